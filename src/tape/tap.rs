//! The `.tap` format: a flat sequence of length-prefixed blocks, each
//! replayed with the ZX Spectrum ROM's standard-speed timing (§4.6).
use super::{Block, BlockTiming, TapeSource};
use crate::error::{EmulatorError, Result};

/// A parsed TAP file: every block's bytes plus a sparse index (every 8th
/// block) so a host seeking near the end of a long tape does not have to
/// walk every preceding block — only a linear re-scan from the nearest
/// indexed block, as real fast-forward implementations do.
pub struct TapFile {
    blocks: Vec<Block>,
    /// Byte offset (of the length prefix) of every `INDEX_STRIDE`-th block.
    index: Vec<usize>,
}

const INDEX_STRIDE: usize = 8;

impl TapFile {
    /// Parses a complete `.tap` image. Each block is `[len_lo, len_hi,
    /// <len bytes>]`; the first data byte conventionally distinguishes a
    /// header (0x00) from a data block (0xFF), which only matters for
    /// picking the pilot-tone length.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut index = Vec::new();
        let mut pos = 0usize;
        while pos + 2 <= bytes.len() {
            let block_start = pos;
            let len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
            pos += 2;
            if pos + len > bytes.len() {
                let err = EmulatorError::TapeMalformed(format!(
                    "block at offset {} declares length {} but only {} bytes remain",
                    pos - 2,
                    len,
                    bytes.len() - pos
                ));
                log::error!("TAP parse failed: {}", err);
                return Err(err);
            }
            if blocks.len() % INDEX_STRIDE == 0 {
                index.push(block_start);
            }
            let data = bytes[pos..pos + len].to_vec();
            pos += len;
            let is_header = data.first().copied() == Some(0x00);
            let timing = BlockTiming::standard(data.len(), is_header);
            blocks.push(Block::from_data(data, timing, is_header));
        }
        if blocks.is_empty() {
            let err = EmulatorError::TapeMalformed("no blocks found".into());
            log::error!("TAP parse failed: {}", err);
            return Err(err);
        }
        Ok(TapFile { blocks, index })
    }

    /// The byte offsets of every `INDEX_STRIDE`-th block, for a host that
    /// wants to present a seek bar without re-parsing from the start.
    pub fn index_points(&self) -> &[usize] {
        &self.index
    }
}

impl TapeSource for TapFile {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }
    fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tap() -> Vec<u8> {
        let header = vec![0x00u8, 0x03, b'H', b'I', b' ', b' ', b' ', b' ', b' ', b' ', b' ', 0x04, 0x00, 0x00, 0x80, 0x00];
        let checksum = header.iter().fold(0u8, |acc, &b| acc ^ b);
        let mut full = header;
        full.push(checksum);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(full.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&full);
        bytes
    }

    #[test]
    fn parses_a_single_header_block() {
        let tap = TapFile::parse(&sample_tap()).unwrap();
        assert_eq!(tap.block_count(), 1);
        assert!(tap.block(0).unwrap().is_header);
    }

    #[test]
    fn truncated_length_prefix_is_malformed() {
        let err = TapFile::parse(&[0x10, 0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, EmulatorError::TapeMalformed(_)));
    }

    #[test]
    fn index_points_are_real_byte_offsets_not_block_indices() {
        let one_block = sample_tap();
        let block_len = one_block.len();
        let mut bytes = Vec::new();
        for _ in 0..9 {
            bytes.extend_from_slice(&one_block);
        }
        let tap = TapFile::parse(&bytes).unwrap();
        assert_eq!(tap.block_count(), 9);
        assert_eq!(tap.index_points(), &[0, block_len * 8]);
    }
}
