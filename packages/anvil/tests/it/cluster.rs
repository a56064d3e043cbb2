//! Remote dispatch scenarios over a loopback cluster.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use color_eyre::Result;
use pretty_assertions::assert_eq;

use anvil::{
    action::runner::ScriptedRunner,
    cluster::{
        broker::{Brokerage, Roster},
        dispatch::RemoteDispatcher,
        worker::{PeerMode, Worker, WorkerConfig},
    },
    graph::{Graph, build::BuildOptions, node::Alias},
    host,
};
use mesh::{compress::Format, tunnel::TunnelConfig};
use tokio_util::sync::CancellationToken;

use crate::{compile_action, harness, temporary_directory};

fn fast_tunnel() -> TunnelConfig {
    TunnelConfig {
        timeout: Duration::from_secs(2),
        retry_count: 2,
        ..TunnelConfig::default()
    }
}

/// Spin up a worker on loopback and advertise it in the brokerage.
async fn spawn_worker(
    brokerage: &Brokerage,
    ufs: Arc<anvil::fs::Ufs>,
    mode: PeerMode,
    cancel: CancellationToken,
) -> Result<Arc<Worker>> {
    let config = WorkerConfig {
        mode,
        // Admission must not depend on how loaded the test machine is.
        min_free_memory: 0,
        tunnel: fast_tunnel(),
        ..WorkerConfig::default()
    };
    let worker = Arc::new(Worker::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        host::describe(IpAddr::V4(Ipv4Addr::LOCALHOST), Format::Zstd),
        brokerage.clone(),
        config,
        Arc::clone(&ufs),
        Arc::new(ScriptedRunner::touching_outputs()),
    )?);
    brokerage.publish(&ufs, worker.descriptor()).await?;

    let serving = Arc::clone(&worker);
    tokio::spawn(async move { serving.serve(cancel).await });
    Ok(worker)
}

#[test_log::test(tokio::test)]
async fn disabled_worker_refuses_and_client_falls_back_to_local() -> Result<()> {
    let (_broker_guard, broker_root) = temporary_directory();
    let (_ws_guard, workspace) = temporary_directory();
    let brokerage = Brokerage::new(broker_root, Duration::from_secs(3));
    let cancel = CancellationToken::new();

    let scratch = harness(None, None);
    let _worker = spawn_worker(
        &brokerage,
        Arc::clone(&scratch.ufs),
        PeerMode::Disabled,
        cancel.clone(),
    )
    .await?;

    let roster = Arc::new(Roster::new(brokerage.timeout()));
    brokerage.discover(&scratch.ufs, &roster).await?;
    assert_eq!(roster.len(), 1);

    let remote = RemoteDispatcher::new(Arc::clone(&roster), fast_tunnel(), None)?;
    let h = harness(None, Some(remote));
    h.ufs
        .create_buffered(&workspace.join("foo.c"), b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("cluster-test").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }
    let started = std::time::Instant::now();
    graph
        .build(
            &Alias::new("foo.o"),
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await?;

    // Refusals burn through the retry budget quickly and end in a local
    // run.
    assert_eq!(h.runner.invocations(), 1, "local fallback ran the task");
    assert!(h.ufs.exists(&workspace.join("out/foo.o")).await);
    assert!(started.elapsed() < Duration::from_secs(10));

    cancel.cancel();
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dedicated_worker_executes_the_task_remotely() -> Result<()> {
    let (_broker_guard, broker_root) = temporary_directory();
    let (_ws_guard, workspace) = temporary_directory();
    let brokerage = Brokerage::new(broker_root, Duration::from_secs(3));
    let cancel = CancellationToken::new();

    let scratch = harness(None, None);
    let _worker = spawn_worker(
        &brokerage,
        Arc::clone(&scratch.ufs),
        PeerMode::Dedicated,
        cancel.clone(),
    )
    .await?;

    let roster = Arc::new(Roster::new(brokerage.timeout()));
    brokerage.discover(&scratch.ufs, &roster).await?;

    let remote = RemoteDispatcher::new(Arc::clone(&roster), fast_tunnel(), None)?;
    let h = harness(None, Some(remote));
    h.ufs
        .create_buffered(&workspace.join("foo.c"), b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("cluster-test").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }
    graph
        .build(
            &Alias::new("foo.o"),
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await?;

    // The worker's runner produced the output on this shared filesystem;
    // the client's own runner never fired.
    assert_eq!(h.runner.invocations(), 0, "task ran on the worker");
    assert!(h.ufs.exists(&workspace.join("out/foo.o")).await);

    cancel.cancel();
    Ok(())
}
