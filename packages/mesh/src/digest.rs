//! Stable 128-bit content digests.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;

use crate::archive::{Archivable, Archive, ArchiveWriter};

/// A stable 128-bit content hash.
///
/// Digests identify buildables, cache entries, and input files. They are
/// the truncated blake3 hash of a value's archived representation, so two
/// values digest equal exactly when their serialized forms are equal.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.to_hex())]
pub struct Digest([u8; Self::LEN]);

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Digest {
    /// Size of a digest in bytes.
    pub const LEN: usize = 16;

    /// The all-zero digest, used as the "never built" sentinel.
    pub const ZERO: Digest = Digest([0; Self::LEN]);

    /// Digest the archived representation of a value.
    ///
    /// The value's `archive` method is replayed into a hasher; the same
    /// method drives persistence, so the hash can never drift from the
    /// stored bytes.
    pub fn of(value: &mut dyn Archivable) -> Result<Self> {
        let mut ar = ArchiveWriter::hasher();
        value
            .archive(&mut ar)
            .context("replay archive into hasher")?;
        Ok(ar.finalize_digest())
    }

    /// Digest a raw buffer directly.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        Self::from_blake3(blake3::hash(buffer.as_ref()))
    }

    /// Truncate a full blake3 hash down to digest width.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..Self::LEN]);
        Self(bytes)
    }

    /// Combine several digests into one.
    pub fn combine(digests: impl IntoIterator<Item = Digest>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for digest in digests {
            hasher.update(&digest.0);
        }
        Self::from_blake3(hasher.finalize())
    }

    /// View the digest as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Attempt to parse a digest from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        if bytes.len() != Self::LEN {
            bail!("invalid digest length: expected {} bytes, got {}", Self::LEN, bytes.len());
        }
        let mut inner = [0u8; Self::LEN];
        inner.copy_from_slice(&bytes);
        Ok(Self(inner))
    }

    /// View the digest as bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Whether this is the "never built" sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Archivable for Digest {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.raw(&mut self.0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hex_round_trip() {
        let digest = Digest::from_buffer(b"int main() { return 0; }");
        let parsed = Digest::from_hex(digest.to_hex()).expect("parse hex");
        assert_eq!(digest, parsed);
    }

    #[test]
    fn rejects_bad_length() {
        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn stable_across_calls() {
        let a = Digest::from_buffer(b"stable");
        let b = Digest::from_buffer(b"stable");
        assert_eq!(a, b);
        assert_ne!(a, Digest::from_buffer(b"unstable"));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Digest::from_buffer(b"a");
        let b = Digest::from_buffer(b"b");
        assert_ne!(Digest::combine([a, b]), Digest::combine([b, a]));
    }
}
