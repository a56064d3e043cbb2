//! Per-frame compression for the tunnel.
//!
//! Frames are compressed individually so the stream stays self-delimiting
//! and a lost connection never corrupts a decoder window. zstd is the
//! default; a pre-trained dictionary can be supplied to help the many small
//! messages a build produces.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Compression formats supported on the wire.
///
/// Both sides of a tunnel must agree; the format travels in the peer
/// descriptor so a client picks the worker's advertised codec.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Hash, Debug, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Zstd,
    Lz4,
}

/// A configured frame codec.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    format: Format,
    level: i32,
    dictionary: Option<Vec<u8>>,
}

impl Codec {
    /// Codec for the given format at its default level.
    pub fn new(format: Format) -> Self {
        Self {
            format,
            level: 0,
            dictionary: None,
        }
    }

    /// Override the compression level (zstd only; lz4 has no levels).
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Attach a pre-trained dictionary (zstd only).
    pub fn with_dictionary(mut self, dictionary: Vec<u8>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Compress one frame payload.
    pub fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.format {
            Format::Zstd => match &self.dictionary {
                Some(dictionary) => {
                    let mut compressor =
                        zstd::bulk::Compressor::with_dictionary(self.level, dictionary)
                            .context("load zstd dictionary")?;
                    compressor.compress(payload).context("compress frame")
                }
                None => zstd::bulk::compress(payload, self.level).context("compress frame"),
            },
            Format::Lz4 => Ok(lz4_flex::block::compress(payload)),
        }
    }

    /// Decompress one frame payload. `inflated_len` comes from the frame
    /// header and bounds the allocation.
    pub fn decompress(&self, payload: &[u8], inflated_len: usize) -> Result<Vec<u8>> {
        let inflated = match self.format {
            Format::Zstd => match &self.dictionary {
                Some(dictionary) => {
                    let mut decompressor = zstd::bulk::Decompressor::with_dictionary(dictionary)
                        .context("load zstd dictionary")?;
                    decompressor
                        .decompress(payload, inflated_len)
                        .context("decompress frame")?
                }
                None => {
                    zstd::bulk::decompress(payload, inflated_len).context("decompress frame")?
                }
            },
            Format::Lz4 => lz4_flex::block::decompress(payload, inflated_len)
                .context("decompress frame")?,
        };
        if inflated.len() != inflated_len {
            bail!(
                "frame inflated to {} bytes, header declared {inflated_len}",
                inflated.len()
            );
        }
        Ok(inflated)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &[u8] = b"cc -O2 -c foo.c -o foo.o cc -O2 -c bar.c -o bar.o";

    #[test]
    fn zstd_round_trip() -> Result<()> {
        let codec = Codec::new(Format::Zstd);
        let compressed = codec.compress(SAMPLE)?;
        let inflated = codec.decompress(&compressed, SAMPLE.len())?;
        assert_eq!(inflated, SAMPLE);
        Ok(())
    }

    #[test]
    fn lz4_round_trip() -> Result<()> {
        let codec = Codec::new(Format::Lz4);
        let compressed = codec.compress(SAMPLE)?;
        let inflated = codec.decompress(&compressed, SAMPLE.len())?;
        assert_eq!(inflated, SAMPLE);
        Ok(())
    }

    #[test]
    fn zstd_dictionary_round_trip() -> Result<()> {
        // A dictionary is just bytes; sharing the payload prefix is enough
        // to exercise the dictionary paths.
        let codec = Codec::new(Format::Zstd).with_dictionary(SAMPLE[..16].to_vec());
        let compressed = codec.compress(SAMPLE)?;
        let inflated = codec.decompress(&compressed, SAMPLE.len())?;
        assert_eq!(inflated, SAMPLE);
        Ok(())
    }

    #[test]
    fn wrong_inflated_len_is_error() -> Result<()> {
        let codec = Codec::new(Format::Zstd);
        let compressed = codec.compress(SAMPLE)?;
        assert!(codec.decompress(&compressed, SAMPLE.len() + 1).is_err());
        Ok(())
    }
}
