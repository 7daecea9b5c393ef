//! Binary deltas between executable images.
//!
//! The codec seam is deliberately opaque: the artifact tree does not record
//! which algorithm produced a delta, so publisher and consumer must agree
//! out-of-band. The bundled codec drives zstd with the old binary as a
//! prepared compression dictionary: near-identical binaries compress to a
//! few kilobytes, and application is plain dictionary decompression.

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;
use zstd::dict::{DecoderDictionary, EncoderDictionary};

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("delta I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A seekable byte source.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Computes and applies binary deltas.
///
/// `diff` is single-pass over both inputs; `patch` requires a seekable old
/// binary. Implementations must guarantee that `patch(old, diff(old, new))`
/// reproduces `new` byte for byte.
pub trait DiffCodec: Send + Sync {
    fn diff(
        &self,
        old: &mut dyn Read,
        new: &mut dyn Read,
        sink: &mut dyn Write,
    ) -> Result<(), DeltaError>;

    fn patch(
        &self,
        old: &mut dyn ReadSeek,
        sink: &mut dyn Write,
        diff: &mut dyn Read,
    ) -> Result<(), DeltaError>;
}

/// zstd dictionary delta codec. The old binary serves as the dictionary;
/// the delta is the new binary compressed against it.
#[derive(Debug, Clone, Copy)]
pub struct ZstdDelta {
    level: i32,
}

impl ZstdDelta {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdDelta {
    fn default() -> Self {
        Self::new(19)
    }
}

impl DiffCodec for ZstdDelta {
    fn diff(
        &self,
        old: &mut dyn Read,
        new: &mut dyn Read,
        sink: &mut dyn Write,
    ) -> Result<(), DeltaError> {
        let mut old_data = Vec::new();
        old.read_to_end(&mut old_data)?;
        let dict = EncoderDictionary::copy(&old_data, self.level);
        let mut encoder = zstd::stream::Encoder::with_prepared_dictionary(sink, &dict)?;
        io::copy(new, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    }

    fn patch(
        &self,
        old: &mut dyn ReadSeek,
        sink: &mut dyn Write,
        diff: &mut dyn Read,
    ) -> Result<(), DeltaError> {
        old.seek(SeekFrom::Start(0))?;
        let mut old_data = Vec::new();
        old.read_to_end(&mut old_data)?;
        let dict = DecoderDictionary::copy(&old_data);
        let mut buffered_diff = std::io::BufReader::new(diff);
        let mut decoder =
            zstd::stream::Decoder::with_prepared_dictionary(&mut buffered_diff, &dict)?;
        io::copy(&mut decoder, sink)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn delta_roundtrip() {
        let old = b"hello world this is a test string for binary deltas".to_vec();
        let new =
            b"hello world this is a test string for binary deltas with new content at the end"
                .to_vec();

        let codec = ZstdDelta::default();
        let mut delta = Vec::new();
        codec
            .diff(
                &mut Cursor::new(&old),
                &mut Cursor::new(&new),
                &mut delta,
            )
            .unwrap();
        assert!(delta.len() < new.len());

        let mut reconstructed = Vec::new();
        codec
            .patch(
                &mut Cursor::new(&old),
                &mut reconstructed,
                &mut Cursor::new(&delta),
            )
            .unwrap();
        assert_eq!(reconstructed, new);
    }

    #[test]
    fn patch_rejects_garbage_delta() {
        let codec = ZstdDelta::default();
        let old = b"some old binary".to_vec();
        let mut out = Vec::new();
        let result = codec.patch(
            &mut Cursor::new(&old),
            &mut out,
            &mut Cursor::new(b"not a delta".to_vec()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn patch_rewinds_the_old_binary() {
        let old = vec![0xAAu8; 4096];
        let new = vec![0xABu8; 4096];

        let codec = ZstdDelta::default();
        let mut delta = Vec::new();
        codec
            .diff(&mut Cursor::new(&old), &mut Cursor::new(&new), &mut delta)
            .unwrap();

        // Hand the codec a cursor that is not at the start.
        let mut seeked = Cursor::new(&old);
        seeked.set_position(100);
        let mut reconstructed = Vec::new();
        codec
            .patch(&mut seeked, &mut reconstructed, &mut Cursor::new(&delta))
            .unwrap();
        assert_eq!(reconstructed, new);
    }
}
