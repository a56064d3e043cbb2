//! Cache sharing across independent working directories.

use std::sync::Arc;

use color_eyre::Result;
use pretty_assertions::assert_eq;

use anvil::{
    cache::ActionCache,
    graph::{Graph, build::BuildOptions, node::Alias},
};

use crate::{compile_action, harness, temporary_directory};

#[test_log::test(tokio::test)]
async fn shared_cache_avoids_respawning_across_workspaces() -> Result<()> {
    let (_cache_guard, cache_root) = temporary_directory();
    let (_ws1_guard, ws1) = temporary_directory();
    let (_ws2_guard, ws2) = temporary_directory();
    const SOURCE: &[u8] = b"int main() { return 0; }";

    // Workspace #1 builds cold and populates the shared cache.
    let first = {
        let h = {
            let scratch = harness(None, None);
            let cache = ActionCache::open(&scratch.ufs, cache_root.clone()).await?;
            harness(Some(cache), None)
        };
        h.ufs.create_buffered(&ws1.join("foo.c"), SOURCE).await?;
        let graph = Graph::new();
        {
            let port = graph.write_port("ws1-setup").await;
            port.register_action(compile_action(&ws1, "foo.c", "out/foo.o"))?;
        }
        graph
            .build(
                &Alias::new("foo.o"),
                BuildOptions::default(),
                Arc::clone(&h.services),
            )
            .await?;
        assert_eq!(h.runner.invocations(), 1);
        h.ufs.read(&ws1.join("out/foo.o")).await?
    };

    // Workspace #2 has the same sources but no outputs; the shared cache
    // must reproduce the object without spawning.
    let h2 = {
        let scratch = harness(None, None);
        let cache = ActionCache::open(&scratch.ufs, cache_root.clone()).await?;
        harness(Some(cache), None)
    };
    h2.ufs.create_buffered(&ws2.join("foo.c"), SOURCE).await?;
    let graph = Graph::new();
    {
        let port = graph.write_port("ws2-setup").await;
        port.register_action(compile_action(&ws2, "foo.c", "out/foo.o"))?;
    }
    graph
        .build(
            &Alias::new("foo.o"),
            BuildOptions::default(),
            Arc::clone(&h2.services),
        )
        .await?;

    assert_eq!(h2.runner.invocations(), 0, "cache hit must not spawn");
    let second = h2.ufs.read(&ws2.join("out/foo.o")).await?;
    assert_eq!(first, second, "cold build and cache hit produce identical bytes");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn changed_source_misses_the_shared_cache() -> Result<()> {
    let (_cache_guard, cache_root) = temporary_directory();
    let (_ws1_guard, ws1) = temporary_directory();
    let (_ws2_guard, ws2) = temporary_directory();

    let h1 = {
        let scratch = harness(None, None);
        let cache = ActionCache::open(&scratch.ufs, cache_root.clone()).await?;
        harness(Some(cache), None)
    };
    h1.ufs
        .create_buffered(&ws1.join("foo.c"), b"int main() { return 0; }")
        .await?;
    let graph = Graph::new();
    {
        let port = graph.write_port("ws1-setup").await;
        port.register_action(compile_action(&ws1, "foo.c", "out/foo.o"))?;
    }
    graph
        .build(
            &Alias::new("foo.o"),
            BuildOptions::default(),
            Arc::clone(&h1.services),
        )
        .await?;

    // Different source content: the inputs stamp differs, so this must
    // run the process.
    let h2 = {
        let scratch = harness(None, None);
        let cache = ActionCache::open(&scratch.ufs, cache_root.clone()).await?;
        harness(Some(cache), None)
    };
    h2.ufs
        .create_buffered(&ws2.join("foo.c"), b"int main() { return 42; }")
        .await?;
    let graph = Graph::new();
    {
        let port = graph.write_port("ws2-setup").await;
        port.register_action(compile_action(&ws2, "foo.c", "out/foo.o"))?;
    }
    graph
        .build(
            &Alias::new("foo.o"),
            BuildOptions::default(),
            Arc::clone(&h2.services),
        )
        .await?;
    assert_eq!(h2.runner.invocations(), 1);
    Ok(())
}
