//! Bounded gzip inflate/deflate with decompression-bomb defense.
//!
//! Inflation runs in fixed-size steps with two independently checked limits:
//! an absolute output cap and a cumulative compression-ratio cap. Either
//! breach aborts with [`TollgateError::DecompressionBomb`]. The caller then
//! skips token/credential scanning for that body but forwards the original
//! compressed bytes unmodified: a bomb aimed at the scanner is not itself
//! exfiltration evidence, so traffic is not blocked.

use std::io::Read;
use std::io::Write;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::LimitsConfig;
use crate::error::{Result, TollgateError};

/// Step size for the inflate loop. Also bounds over-allocation past the cap.
const INFLATE_STEP: usize = 8 * 1024;

/// Whether `bytes` starts with the gzip magic.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// `Read` adapter that counts how many compressed bytes the decoder pulled.
struct CountingReader<'a> {
    inner: &'a [u8],
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Inflate a gzip body under the configured limits.
///
/// Limits are re-checked after every [`INFLATE_STEP`]-sized read, so the
/// output buffer never grows more than one step past the absolute cap no
/// matter what the input claims.
pub fn inflate_bounded(compressed: &[u8], limits: &LimitsConfig) -> Result<Vec<u8>> {
    let reader = CountingReader {
        inner: compressed,
        count: 0,
    };
    let mut decoder = GzDecoder::new(reader);

    let mut out = Vec::new();
    let mut step = [0u8; INFLATE_STEP];
    loop {
        let n = decoder.read(&mut step)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&step[..n]);

        let produced = out.len() as u64;
        let consumed = decoder.get_ref().count;
        if produced > limits.max_decompressed {
            return Err(TollgateError::DecompressionBomb {
                consumed,
                produced,
                limit: "size",
            });
        }
        if consumed > 0 && produced / consumed > limits.max_ratio {
            return Err(TollgateError::DecompressionBomb {
                consumed,
                produced,
                limit: "ratio",
            });
        }
    }
    Ok(out)
}

/// Gzip-compress `bytes` with the default deflate level.
///
/// Used to re-encode a body after an in-place substitution. Callers fall
/// back to the pre-substitution bytes if this fails rather than corrupting
/// the stream.
pub fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}
