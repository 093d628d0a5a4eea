use std::{collections::HashSet, net::SocketAddr};
use crate::{block::*, BLOCK_SIZE};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {
    
    // Block has not been requested.
    #[default]
    Free,
    
    // Block has been requested by at least 1 peer.
    Requested,
    
    // Block has been received.
    Received,

}

#[derive(Debug)]
pub struct PartialPiece {

    // Piece index.
    pub idx: usize,
    
    // Length of piece.
    pub len: usize,
    
    // State of all blocks within this piece.
    pub blocks_states: Vec<BlockState>,

    // Which peer's block landed in each slot, so a failed hash check on
    // this piece can be attributed back to its contributor(s).
    contributors: Vec<Option<SocketAddr>>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        let n = num_blocks(len) as usize;
        Self {
            idx,
            len,
            blocks_states: vec![BlockState::default(); n],
            contributors: vec![None; n],
        }
    }

    pub fn free_block(&mut self, block: &BlockInfo) {
        assert!(block.piece_idx == self.idx);
        let i = block.idx_in_piece();
        self.blocks_states[i] = BlockState::Free;
        self.contributors[i] = None;
    }

    pub fn free_all_blocks(&mut self) {
        self.blocks_states.iter_mut().for_each(|b| *b = BlockState::Free);
        self.contributors.iter_mut().for_each(|c| *c = None);
    }

    // Returns whether the block is a duplicate (already recieved).
    pub fn received_block(&mut self, block: &BlockInfo, from: SocketAddr) -> bool {
        let i = block.idx_in_piece();
        let block_state = &mut self.blocks_states[i];
        // If we received a block, it must have been requested.
        match *block_state {
            BlockState::Free => unreachable!("Can't receive a block that wasn't requested"),
            BlockState::Requested => {
                *block_state = BlockState::Received;
                self.contributors[i] = Some(from);
                false
            },
            BlockState::Received => true,
        }
    }

    // The distinct peers that contributed at least one received block to
    // this piece.
    pub fn contributors(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        let mut seen = HashSet::new();
        self.contributors.iter().filter_map(move |c| {
            let addr = (*c)?;
            seen.insert(addr).then_some(addr)
        })
    }

    // Pick open blocks sequentially within a partially downloaded piece.
    pub fn pick_next_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        prev: &HashSet<BlockInfo>,
        end_game: bool,
    ) -> usize {
        let mut num_picked = 0;
        for (i, block) in self.blocks_states.iter_mut().enumerate() {
            if num_picked == num {
                break;
            }
            
            if *block == BlockState::Free {
                assert!(!end_game);
                buf.push(BlockInfo {
                    piece_idx: self.idx,
                    offset: i * BLOCK_SIZE as usize,
                    len: block_len(self.len, i)
                });
                *block = BlockState::Requested;
                num_picked += 1;

            } else if end_game && *block == BlockState::Requested {
                
                let block_info = BlockInfo {
                    piece_idx: self.idx,
                    offset: i * BLOCK_SIZE as usize,
                    len: block_len(self.len, i),
                };
                
                if !prev.contains(&block_info) {
                    buf.push(block_info);
                    num_picked += 1;
                }
            }
        }
        num_picked
    }
}
