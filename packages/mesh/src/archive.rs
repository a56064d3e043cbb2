//! The typed binary archive.
//!
//! Every value that is persisted, framed onto the wire, or fingerprinted
//! implements [`Archivable`] with exactly one `archive` method. The method
//! is direction-aware: driven by an [`ArchiveWriter`] it encodes, driven by
//! an [`ArchiveReader`] it decodes, and driven by the hasher variant it
//! feeds the digest. Collapsing "how to hash me" and "how to persist me"
//! into one traversal eliminates the class of bugs where the two
//! representations drift.

use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Write},
    path::PathBuf,
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use jiff::Timestamp;

use crate::digest::Digest;

/// Upper bound on any single length-prefixed field.
///
/// A corrupt or truncated store must fail with an error, not an attempted
/// multi-gigabyte allocation.
const MAX_FIELD_LEN: u32 = 1 << 30;

/// A direction-aware typed byte stream.
///
/// Primitive lanes are default-implemented on top of [`Archive::raw`], so a
/// driver only supplies the raw byte transport. All integers are encoded
/// little-endian.
pub trait Archive {
    /// True when this driver decodes (fields are overwritten from the
    /// stream) rather than encodes.
    fn reading(&self) -> bool;

    /// Transport a fixed-size buffer: written verbatim when encoding,
    /// filled from the stream when decoding.
    fn raw(&mut self, buf: &mut [u8]) -> Result<()>;

    fn u8(&mut self, v: &mut u8) -> Result<()> {
        let mut buf = [*v];
        self.raw(&mut buf)?;
        *v = buf[0];
        Ok(())
    }

    fn bool(&mut self, v: &mut bool) -> Result<()> {
        let mut byte = u8::from(*v);
        self.u8(&mut byte)?;
        *v = match byte {
            0 => false,
            1 => true,
            other => bail!("invalid boolean byte: {other}"),
        };
        Ok(())
    }

    fn u16(&mut self, v: &mut u16) -> Result<()> {
        let mut buf = v.to_le_bytes();
        self.raw(&mut buf)?;
        *v = u16::from_le_bytes(buf);
        Ok(())
    }

    fn u32(&mut self, v: &mut u32) -> Result<()> {
        let mut buf = v.to_le_bytes();
        self.raw(&mut buf)?;
        *v = u32::from_le_bytes(buf);
        Ok(())
    }

    fn u64(&mut self, v: &mut u64) -> Result<()> {
        let mut buf = v.to_le_bytes();
        self.raw(&mut buf)?;
        *v = u64::from_le_bytes(buf);
        Ok(())
    }

    fn i32(&mut self, v: &mut i32) -> Result<()> {
        let mut buf = v.to_le_bytes();
        self.raw(&mut buf)?;
        *v = i32::from_le_bytes(buf);
        Ok(())
    }

    fn i64(&mut self, v: &mut i64) -> Result<()> {
        let mut buf = v.to_le_bytes();
        self.raw(&mut buf)?;
        *v = i64::from_le_bytes(buf);
        Ok(())
    }

    /// Transport a length-prefixed byte buffer.
    fn bytes(&mut self, v: &mut Vec<u8>) -> Result<()> {
        let mut len = u32::try_from(v.len()).context("field too large")?;
        self.u32(&mut len)?;
        if len > MAX_FIELD_LEN {
            bail!("field length {len} exceeds limit");
        }
        v.resize(len as usize, 0);
        self.raw(v)
    }
}

/// A value with a single archived representation.
///
/// The one method serves persistence, decoding, and fingerprinting; see the
/// module docs.
pub trait Archivable {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()>;
}

impl Archivable for bool {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.bool(self)
    }
}

impl Archivable for u8 {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.u8(self)
    }
}

impl Archivable for u16 {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.u16(self)
    }
}

impl Archivable for u32 {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.u32(self)
    }
}

impl Archivable for u64 {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.u64(self)
    }
}

impl Archivable for i32 {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.i32(self)
    }
}

impl Archivable for i64 {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.i64(self)
    }
}

impl Archivable for String {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut bytes = std::mem::take(self).into_bytes();
        ar.bytes(&mut bytes)?;
        *self = String::from_utf8(bytes).context("decode utf-8 string")?;
        Ok(())
    }
}

impl<T: Archivable + Default> Archivable for Vec<T> {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut len = u32::try_from(self.len()).context("list too large")?;
        ar.u32(&mut len)?;
        if len > MAX_FIELD_LEN {
            bail!("list length {len} exceeds limit");
        }
        if ar.reading() {
            self.clear();
            self.resize_with(len as usize, T::default);
        }
        for item in self.iter_mut() {
            item.archive(ar)?;
        }
        Ok(())
    }
}

impl<T: Archivable + Default> Archivable for Option<T> {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut present = self.is_some();
        ar.bool(&mut present)?;
        if ar.reading() {
            *self = present.then(T::default);
        }
        if let Some(value) = self.as_mut() {
            value.archive(ar)?;
        }
        Ok(())
    }
}

impl Archivable for BTreeMap<String, String> {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut len = u32::try_from(self.len()).context("map too large")?;
        ar.u32(&mut len)?;
        if ar.reading() {
            self.clear();
            for _ in 0..len {
                let mut key = String::new();
                let mut value = String::new();
                key.archive(ar)?;
                value.archive(ar)?;
                self.insert(key, value);
            }
        } else {
            for (key, value) in self.iter() {
                key.clone().archive(ar)?;
                value.clone().archive(ar)?;
            }
        }
        Ok(())
    }
}

impl Archivable for PathBuf {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut repr = self.to_string_lossy().into_owned();
        repr.archive(ar)?;
        *self = PathBuf::from(repr);
        Ok(())
    }
}

impl Archivable for Timestamp {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut second = self.as_second();
        let mut nanos = self.subsec_nanosecond();
        ar.i64(&mut second)?;
        ar.i32(&mut nanos)?;
        *self = Timestamp::new(second, nanos).context("decode timestamp")?;
        Ok(())
    }
}

/// Encoding driver over any [`Write`] sink.
///
/// The blake3 hasher is itself a `Write` sink, so the fingerprint driver is
/// just a writer whose bytes go nowhere but the hash state.
pub struct ArchiveWriter<W: Write> {
    inner: W,
}

impl ArchiveWriter<Vec<u8>> {
    /// Encode into an in-memory buffer.
    pub fn buffer() -> Self {
        Self { inner: Vec::new() }
    }

    /// Take the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.inner
    }
}

impl ArchiveWriter<blake3::Hasher> {
    /// Encode into the digest hasher.
    pub fn hasher() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Finish hashing and truncate to a [`Digest`].
    pub fn finalize_digest(self) -> Digest {
        Digest::from_blake3(self.inner.finalize())
    }
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Archive for ArchiveWriter<W> {
    fn reading(&self) -> bool {
        false
    }

    fn raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.write_all(buf).context("write archive bytes")
    }
}

/// Decoding driver over any [`Read`] source.
pub struct ArchiveReader<R: Read> {
    inner: R,
}

impl<'b> ArchiveReader<Cursor<&'b [u8]>> {
    /// Decode from an in-memory buffer.
    pub fn buffer(bytes: &'b [u8]) -> Self {
        Self {
            inner: Cursor::new(bytes),
        }
    }
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> Archive for ArchiveReader<R> {
    fn reading(&self) -> bool {
        true
    }

    fn raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).context("read archive bytes")
    }
}

/// Transport a schema version tag.
///
/// Written once at the head of every persisted store. A mismatch on load is
/// an error; callers discard the store and rebuild rather than repair.
pub fn version_tag(ar: &mut dyn Archive, current: u32) -> Result<()> {
    let mut version = current;
    ar.u32(&mut version)?;
    if version != current {
        bail!("store schema version mismatch: expected {current}, found {version}");
    }
    Ok(())
}

/// Encode a value into a fresh buffer.
pub fn to_bytes(value: &mut dyn Archivable) -> Result<Vec<u8>> {
    let mut ar = ArchiveWriter::buffer();
    value.archive(&mut ar)?;
    Ok(ar.into_bytes())
}

/// Decode a value from a buffer.
pub fn from_bytes<T: Archivable + Default>(bytes: &[u8]) -> Result<T> {
    let mut ar = ArchiveReader::buffer(bytes);
    let mut value = T::default();
    value.archive(&mut ar)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Clone, Default, Eq, PartialEq, Debug)]
    struct Record {
        name: String,
        flags: u32,
        inputs: Vec<String>,
        note: Option<String>,
        env: BTreeMap<String, String>,
    }

    impl Archivable for Record {
        fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
            self.name.archive(ar)?;
            self.flags.archive(ar)?;
            self.inputs.archive(ar)?;
            self.note.archive(ar)?;
            self.env.archive(ar)
        }
    }

    fn sample() -> Record {
        Record {
            name: "compile.foo.o".into(),
            flags: 0b1010,
            inputs: vec!["foo.c".into(), "foo.h".into()],
            note: Some("unity".into()),
            env: BTreeMap::from([("CC".to_string(), "clang".to_string())]),
        }
    }

    #[test]
    fn round_trip() -> Result<()> {
        let mut record = sample();
        let bytes = to_bytes(&mut record)?;
        let decoded: Record = from_bytes(&bytes)?;
        assert_eq!(record, decoded);
        Ok(())
    }

    #[test]
    fn fingerprint_stable_across_round_trip() -> Result<()> {
        let mut record = sample();
        let before = Digest::of(&mut record)?;
        let bytes = to_bytes(&mut record)?;
        let mut decoded: Record = from_bytes(&bytes)?;
        let after = Digest::of(&mut decoded)?;
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn fingerprint_tracks_content() -> Result<()> {
        let mut record = sample();
        let before = Digest::of(&mut record)?;
        record.flags ^= 1;
        let after = Digest::of(&mut record)?;
        assert_ne!(before, after);
        Ok(())
    }

    #[test]
    fn version_mismatch_is_error() -> Result<()> {
        let mut ar = ArchiveWriter::buffer();
        version_tag(&mut ar, 3)?;
        let bytes = ar.into_bytes();
        let mut ar = ArchiveReader::buffer(&bytes);
        assert!(version_tag(&mut ar, 4).is_err());
        Ok(())
    }

    #[test]
    fn truncated_input_is_error() -> Result<()> {
        let mut record = sample();
        let bytes = to_bytes(&mut record)?;
        let result: Result<Record> = from_bytes(&bytes[..bytes.len() / 2]);
        assert!(result.is_err());
        Ok(())
    }
}
