//! Incremental build scenarios against a counting runner.

use std::sync::Arc;

use color_eyre::Result;
use pretty_assertions::assert_eq;

use anvil::graph::{Graph, build::BuildOptions, node::Alias, store};

use crate::{compile_action, harness, temporary_directory};

#[test_log::test(tokio::test)]
async fn cold_build_creates_output_and_nodes() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);
    h.ufs
        .create_buffered(&workspace.join("foo.c"), b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }

    let built = graph
        .build(
            &Alias::new("foo.o"),
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await?;

    assert_eq!(h.runner.invocations(), 1);
    assert!(built.rebuilt);
    assert!(!built.stamp.fingerprint.is_zero());
    assert!(h.ufs.exists(&workspace.join("out/foo.o")).await);
    // Exactly one action node plus the two file nodes.
    assert_eq!(graph.len(), 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_build_spawns_nothing() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);
    h.ufs
        .create_buffered(&workspace.join("foo.c"), b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }

    let alias = Alias::new("foo.o");
    graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;
    assert_eq!(h.runner.invocations(), 1);

    let second = graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;
    assert_eq!(h.runner.invocations(), 1, "up-to-date build must not spawn");
    assert!(!second.rebuilt);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn changed_input_rebuilds_exactly_once() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);
    let source = workspace.join("foo.c");
    h.ufs
        .create_buffered(&source, b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }
    let alias = Alias::new("foo.o");
    graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;

    // Rewrite the input and push its mtime forward past filesystem
    // timestamp granularity.
    std::fs::write(source.as_std_path(), b"int main() { return 1; }")?;
    let bumped = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
    filetime::set_file_mtime(
        source.as_std_path(),
        filetime::FileTime::from_system_time(bumped),
    )?;

    graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;
    assert_eq!(h.runner.invocations(), 2);

    graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;
    assert_eq!(h.runner.invocations(), 2, "stable again after the rebuild");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn force_rebuilds_clean_nodes() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);
    h.ufs
        .create_buffered(&workspace.join("foo.c"), b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }
    let alias = Alias::new("foo.o");
    graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;
    graph
        .build(
            &alias,
            BuildOptions {
                force: true,
                ..BuildOptions::default()
            },
            Arc::clone(&h.services),
        )
        .await?;
    assert_eq!(h.runner.invocations(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_input_poisons_dependents_with_root_attribution() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);
    // foo.c is never created.

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
        let mut link = compile_action(&workspace, "main.c", "out/app");
        link.dynamic_input_actions = vec![Alias::new("foo.o")];
        port.register_action(link)?;
    }
    h.ufs
        .create_buffered(&workspace.join("main.c"), b"int main() {}")
        .await?;

    let err = graph
        .build(
            &Alias::new("app"),
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await
        .expect_err("missing input must fail the build");
    let message = format!("{err:#}");
    assert!(
        message.contains("foo.c"),
        "failure should name the root cause, got: {message}"
    );

    // The poisoned dependent was never built and keeps no stamp.
    let link_node = graph.expect(&Alias::new("app"))?;
    assert!(link_node.stamp().is_none());
    assert_eq!(h.runner.invocations(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn cycles_are_a_hard_error() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        let mut first = compile_action(&workspace, "a.c", "out/a.o");
        first.dynamic_input_actions = vec![Alias::new("b.o")];
        port.register_action(first)?;
        let mut second = compile_action(&workspace, "b.c", "out/b.o");
        second.dynamic_input_actions = vec![Alias::new("a.o")];
        port.register_action(second)?;
    }

    let err = graph
        .build(
            &Alias::new("a.o"),
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await
        .expect_err("cyclic graph must not build");
    assert!(format!("{err:#}").contains("cycle"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dependency_chain_walks_static_edges() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }

    let source_alias = Alias::new(workspace.join("foo.c").to_string());
    let chain = graph.dependency_chain(&Alias::new("foo.o"), &source_alias)?;
    assert_eq!(chain.len(), 2);
    assert!(chain[0].via.is_none());
    assert_eq!(chain[1].alias, source_alias);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dirty_if_marks_matching_nodes() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);
    h.ufs
        .create_buffered(&workspace.join("foo.c"), b"int main() { return 0; }")
        .await?;

    let graph = Graph::new();
    {
        let port = graph.write_port("test-setup").await;
        port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
    }
    let alias = Alias::new("foo.o");
    graph
        .build(&alias, BuildOptions::default(), Arc::clone(&h.services))
        .await?;

    let predicate = alias.clone();
    graph
        .build(
            &alias,
            BuildOptions {
                dirty_if: Some(Arc::new(move |candidate| *candidate == predicate)),
                ..BuildOptions::default()
            },
            Arc::clone(&h.services),
        )
        .await?;
    assert_eq!(h.runner.invocations(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn probe_nodes_track_filesystem_changes() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let h = harness(None, None);

    let graph = Graph::new();
    let probe_alias;
    let listing_alias;
    {
        let port = graph.write_port("test-setup").await;
        let probe = anvil::graph::node::FileExists::new(workspace.join("marker"));
        probe_alias = anvil::graph::node::Buildable::alias(&probe);
        port.insert_if_absent(Box::new(probe));
        let listing = anvil::graph::node::DirectoryList::new(workspace.clone());
        listing_alias = anvil::graph::node::Buildable::alias(&listing);
        port.insert_if_absent(Box::new(listing));
    }

    let first = graph
        .build_many(
            &[probe_alias.clone(), listing_alias.clone()],
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await?;
    assert!(first.iter().all(|built| built.rebuilt));

    // Creating the marker flips the existence probe and the listing.
    h.ufs.create_buffered(&workspace.join("marker"), b"").await?;
    let second = graph
        .build_many(
            &[probe_alias, listing_alias],
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await?;
    assert!(second.iter().all(|built| built.rebuilt && built.changed));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn crash_recovery_reruns_only_incomplete_actions() -> Result<()> {
    let (_guard, workspace) = temporary_directory();
    let store_path = workspace.join(".anvil/graph.bin");

    // First process: build two objects and persist the graph.
    {
        let h = harness(None, None);
        h.ufs
            .create_buffered(&workspace.join("foo.c"), b"int foo() { return 0; }")
            .await?;
        h.ufs
            .create_buffered(&workspace.join("bar.c"), b"int bar() { return 0; }")
            .await?;
        let graph = Graph::new();
        {
            let port = graph.write_port("test-setup").await;
            port.register_action(compile_action(&workspace, "foo.c", "out/foo.o"))?;
            port.register_action(compile_action(&workspace, "bar.c", "out/bar.o"))?;
        }
        graph
            .build_many(
                &[Alias::new("foo.o"), Alias::new("bar.o")],
                BuildOptions::default(),
                Arc::clone(&h.services),
            )
            .await?;
        assert_eq!(h.runner.invocations(), 2);
        store::save(&graph, &h.ufs, &store_path).await?;
    }

    // Simulated SIGKILL left foo.o incomplete.
    std::fs::remove_file(workspace.join("out/foo.o").as_std_path())?;

    // Second process: reload and rebuild. Only the incomplete action runs.
    let h = harness(None, None);
    let graph = store::load(&h.ufs, &store_path)
        .await?
        .expect("store survives restart");
    graph
        .build_many(
            &[Alias::new("foo.o"), Alias::new("bar.o")],
            BuildOptions::default(),
            Arc::clone(&h.services),
        )
        .await?;
    assert_eq!(h.runner.invocations(), 1, "only foo.o reruns");
    assert!(h.ufs.exists(&workspace.join("out/foo.o")).await);
    Ok(())
}
