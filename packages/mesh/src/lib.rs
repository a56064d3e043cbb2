//! Wire layer shared by the `anvil` orchestrator and its workers.
//!
//! Everything that crosses a machine boundary or a process restart lives
//! here: the 128-bit content digest, the typed binary archive that both
//! persists values and fingerprints them, the per-frame compression codecs,
//! the peer descriptor, the message taxonomy, and the QUIC tunnel.

pub mod archive;
pub mod compress;
pub mod digest;
pub mod message;
pub mod peer;
pub mod tunnel;

pub use archive::{Archivable, Archive, ArchiveReader, ArchiveWriter};
pub use digest::Digest;
