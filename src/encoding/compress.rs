//! Block compression behind a small trait so the page writer does not care
//! which algorithm is in use. Compression only affects writes; pages record
//! whether their body is compressed, so a store written with compression on
//! can always be read with it off.

use eyre::{ensure, Result};

/// A block compressor. `compress` may produce output no smaller than the
/// input; the caller compares lengths and keeps the raw body in that case.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8], out: &mut Vec<u8>);

    /// Expands `input` into exactly `expanded_len` bytes.
    fn expand(&self, input: &[u8], expanded_len: usize) -> Result<Vec<u8>>;
}

/// LZ4 block compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&lz4_flex::block::compress(input));
    }

    fn expand(&self, input: &[u8], expanded_len: usize) -> Result<Vec<u8>> {
        let data = lz4_flex::block::decompress(input, expanded_len)
            .map_err(|e| eyre::eyre!("page decompression failed: {}", e))?;
        ensure!(
            data.len() == expanded_len,
            "decompressed length {} does not match expected {}",
            data.len(),
            expanded_len
        );
        Ok(data)
    }
}
