//! Bulk archives: one compressed bundle of a historical output set.
//!
//! A bulk is a tar archive whose entries are the output files, named by
//! their path relative to the output root, each entry zstd-compressed
//! individually. Entry-level compression keeps inflation of a single
//! output cheap and mirrors how the CAS wire format packages blobs.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use futures::StreamExt;
use mesh::Digest;
use tap::Pipe;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{instrument, trace};

use crate::{fs::Ufs, path::AbsPath};

/// Ceiling for one inflated output file.
const MAX_DECOMPRESSED_SIZE: usize = 1 << 30;

/// Pack the outputs into a fresh bulk archive, returning its bytes.
///
/// Paths are stored relative to `root` with forward slashes so a bulk
/// inflates identically on any machine.
#[instrument(skip(ufs, outputs), fields(count = outputs.len()))]
pub async fn deflate(ufs: &Ufs, root: &AbsPath, outputs: &[AbsPath]) -> Result<Vec<u8>> {
    let cursor = futures::io::Cursor::new(Vec::new());
    let mut tar = async_tar::Builder::new(cursor);

    for output in outputs {
        let rel = output
            .relative_to(root)
            .with_context(|| format!("output {output} outside root {root}"))?;
        let name = rel.as_std_path().to_string_lossy().replace('\\', "/");

        let content = ufs.read(output).await?;
        let compressed = zstd::bulk::compress(&content, 0)
            .with_context(|| format!("compress output {output}"))?;

        let mut header = async_tar::Header::new_gnu();
        header.set_size(compressed.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, &name, compressed.as_slice())
            .await
            .with_context(|| format!("add bulk entry {name}"))?;
    }

    let cursor = tar.into_inner().await.context("finalize bulk archive")?;
    Ok(cursor.into_inner())
}

/// Unpack a bulk archive into the output root.
///
/// Returns the relative path and content digest of every inflated file.
/// Any malformed entry fails the whole inflation; callers treat that as
/// cache corruption and delete the bulk.
#[instrument(skip(ufs, bytes), fields(bytes = bytes.len()))]
pub async fn inflate(
    ufs: &Ufs,
    bytes: &[u8],
    root: &AbsPath,
) -> Result<Vec<(String, Digest)>> {
    let archive = futures::io::Cursor::new(bytes).pipe(async_tar::Archive::new);
    let mut entries = archive.entries().context("read bulk entries")?;

    let mut inflated = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry.context("read bulk entry")?;
        let name = entry
            .path()
            .context("read entry path")?
            .to_string_lossy()
            .into_owned();
        if name.contains("..") {
            bail!("bulk entry escapes the output root: {name}");
        }

        let mut compressed = Vec::new();
        tokio::io::copy(&mut entry.compat(), &mut compressed)
            .await
            .with_context(|| format!("read bulk entry {name}"))?;
        let content = zstd::bulk::decompress(&compressed, MAX_DECOMPRESSED_SIZE)
            .with_context(|| format!("decompress bulk entry {name}"))?;

        let dest = root.join(&name);
        ufs.create_buffered(&dest, &content).await?;
        trace!(%dest, bytes = content.len(), "inflated bulk entry");
        inflated.push((name, Digest::from_buffer(&content)));
    }

    if inflated.is_empty() {
        bail!("bulk archive contains no entries");
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_root() -> (tempfile::TempDir, AbsPath) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = AbsPath::try_from(dir.path()).expect("temp dir is absolute");
        (dir, path)
    }

    #[test_log::test(tokio::test)]
    async fn deflate_inflate_round_trip() -> Result<()> {
        let (_src_guard, src) = temp_root();
        let (_dst_guard, dst) = temp_root();
        let ufs = Ufs::new();

        let object = src.join("out/foo.o");
        let listing = src.join("out/foo.lst");
        ufs.create_buffered(&object, b"ELF object bytes").await?;
        ufs.create_buffered(&listing, b"listing").await?;

        let bytes = deflate(&ufs, &src, &[object.clone(), listing.clone()]).await?;
        let inflated = inflate(&ufs, &bytes, &dst).await?;
        assert_eq!(inflated.len(), 2);

        assert_eq!(ufs.read(&dst.join("out/foo.o")).await?, b"ELF object bytes");
        assert_eq!(ufs.read(&dst.join("out/foo.lst")).await?, b"listing");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn inflate_rejects_garbage() {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        assert!(inflate(&ufs, b"definitely not a tar archive", &root).await.is_err());
    }
}
