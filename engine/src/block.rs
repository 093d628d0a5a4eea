use std::sync::Arc;
use crate::BLOCK_SIZE;

// Identifies a block within a piece, used both as a wire request and as the
// key peers and the picker use to track in-flight requests.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // Checked against storage geometry before being honoured, since a
    // malicious peer may request an out-of-range block.
    pub fn is_valid(&self, info: &crate::store::StoreInfo) -> bool {
        if self.piece_idx >= info.num_pieces as usize {
            return false;
        }
        let piece_len = info.piece_length(self.piece_idx);
        self.len > 0
            && self.len <= BLOCK_SIZE
            && self.offset < piece_len
            && self.offset + self.len <= piece_len
    }
}

// Bytes backing a block reply. Reads served from the disk cache are shared
// via `Arc` so peers reading the same piece don't each clone it.
#[derive(Debug, Clone)]
pub enum BlockData {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl AsRef<[u8]> for BlockData {
    fn as_ref(&self) -> &[u8] {
        match self {
            BlockData::Owned(v) => v,
            BlockData::Cached(v) => v,
        }
    }
}

impl PartialEq for BlockData {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}
impl Eq for BlockData {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {

    pub piece_idx: usize,

    pub offset: usize,

    pub data: BlockData,

}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.as_ref().len(),
        }
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        (0..12).for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i as u32));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn idx_in_piece_divides_by_block_size() {
        let b = BlockInfo { piece_idx: 3, offset: BLOCK_SIZE * 2, len: BLOCK_SIZE };
        assert_eq!(b.idx_in_piece(), 2);
    }
}
