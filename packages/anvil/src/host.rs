//! Host identity and hardware inventory for the peer descriptor.

use std::net::IpAddr;

use mesh::{
    compress::Format,
    peer::{CURRENT_PEERVERSION, Hardware, PeerDescriptor},
};

/// The name this machine advertises in the brokerage.
pub fn fqdn() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| String::from("localhost"))
}

/// Probe the hardware this worker would report.
pub fn hardware() -> Hardware {
    let mut system = sysinfo::System::new();
    system.refresh_cpu_all();
    system.refresh_memory();
    let (cpu_name, mhz) = system
        .cpus()
        .first()
        .map(|cpu| (cpu.brand().to_string(), cpu.frequency()))
        .unwrap_or_default();
    Hardware {
        cpu_name,
        cores: u32::try_from(num_cpus::get_physical()).unwrap_or(1),
        threads: u32::try_from(num_cpus::get()).unwrap_or(1),
        mhz,
        ram_bytes: system.total_memory(),
    }
}

/// Assemble this machine's peer descriptor.
///
/// The tunnel port is filled in by the worker once its endpoint is bound.
pub fn describe(addr: IpAddr, compression: Format) -> PeerDescriptor {
    PeerDescriptor {
        version: CURRENT_PEERVERSION,
        fqdn: fqdn(),
        addr,
        tunnel_port: 0,
        compression,
        hardware: hardware(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_probe_reports_cpus() {
        let hardware = hardware();
        assert!(hardware.threads >= 1);
        assert!(hardware.cores >= 1);
        assert!(hardware.cores <= hardware.threads);
    }

    #[test]
    fn descriptor_is_current_version() {
        let descriptor = describe(IpAddr::from([127, 0, 0, 1]), Format::Zstd);
        assert!(descriptor.is_compatible());
        assert!(!descriptor.fqdn.is_empty());
    }
}
