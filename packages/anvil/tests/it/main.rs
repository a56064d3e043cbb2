use std::{collections::BTreeMap, sync::Arc};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use anvil::{
    action::{Action, OptionFlags, runner::ScriptedRunner},
    cache::ActionCache,
    cluster::dispatch::RemoteDispatcher,
    executor::{Executor, Services},
    fs::Ufs,
    path::AbsPath,
    pool::Pool,
};

pub mod cache;
pub mod cluster;
pub mod graph;

#[track_caller]
pub fn temporary_directory() -> (TempDir, AbsPath) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = AbsPath::try_from(dir.path()).expect("read temp dir as abs dir");
    (dir, path)
}

/// Everything a scenario needs to drive builds against a scripted runner.
pub struct Harness {
    pub ufs: Arc<Ufs>,
    pub pool: Pool,
    pub runner: Arc<ScriptedRunner>,
    pub services: Arc<Services>,
    pub cancel: CancellationToken,
}

/// Assemble services around a runner that materializes `-o` outputs and
/// counts its invocations.
pub fn harness(cache: Option<ActionCache>, remote: Option<RemoteDispatcher>) -> Harness {
    let ufs = Arc::new(Ufs::new());
    let pool = Pool::new(2);
    let cancel = CancellationToken::new();
    let runner = Arc::new(ScriptedRunner::touching_outputs());

    let mut executor = Executor::new(
        Arc::clone(&ufs),
        pool.clone(),
        Arc::clone(&runner) as Arc<dyn anvil::action::runner::ProcessRunner>,
        cancel.clone(),
        2,
    );
    if let Some(cache) = cache {
        executor = executor.with_cache(cache);
    }
    if let Some(remote) = remote {
        executor = executor.with_remote(remote);
    }

    let services = Services::new(
        Arc::clone(&ufs),
        pool.clone(),
        Arc::new(executor),
        cancel.clone(),
    );
    Harness {
        ufs,
        pool,
        runner,
        services,
        cancel,
    }
}

/// A compile-like action: relative arguments, one input, one output.
pub fn compile_action(workspace: &AbsPath, source: &str, object: &str) -> Action {
    Action {
        executable: AbsPath::try_from("/usr/bin/cc").expect("abs"),
        arguments: vec!["-c".into(), source.into(), "-o".into(), object.into()],
        working_dir: workspace.clone(),
        environment: BTreeMap::new(),
        static_inputs: vec![workspace.join(source)],
        dynamic_input_actions: Vec::new(),
        prerequisites: Vec::new(),
        outputs: vec![workspace.join(object)],
        export_index: 0,
        flags: OptionFlags::ALLOW_CACHE | OptionFlags::ALLOW_DISTRIBUTION,
    }
}
