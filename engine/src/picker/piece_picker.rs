use serde_derive::{Deserialize, Serialize};
use crate::Bitfield;

/*
A better strategy is to download pieces in rarest first order. The client can determine this
by keeping the initial bitfield from each peer, and updating it with every have message.
Then, the client can download the pieces that appear least frequently in these peer bitfields.
Note that any Rarest First strategy should include randomization among at least several of the
least common pieces, as having many clients all attempting to jump on the same "least common"
piece would be counter productive
*/

// Selects which piece a torrent prefers to download next. `RarestFirst`
// suits normal swarm health; `Sequential` suits in-order consumption
// (e.g. extracting an archive as it downloads); `Streaming` keeps a
// window of pieces ahead of a moving playback cursor in order, falling
// back to rarest-first outside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStrategy {
    RarestFirst,
    Sequential,
    Streaming { cursor: usize, window: usize },
}

impl Default for PickStrategy {
    fn default() -> Self {
        PickStrategy::RarestFirst
    }
}

// Per-file priority, settable via a torrent's options bag. Acts as a
// multiplicative weight on piece selection: `DoNotDownload` pieces are
// never picked at all, and among the rest a higher weight makes a piece
// look rarer than its raw availability, competing more strongly in
// rarest-first selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    DoNotDownload,
    Low,
    Normal,
    High,
    Maximum,
}

impl Priority {
    fn weight(self) -> u32 {
        match self {
            Priority::DoNotDownload => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 4,
            Priority::Maximum => 8,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of peers that have this piece.
    frequency: usize,
    // Is the piece partially downloaded.
    is_partial: bool,
    // Selection weight, driven by the owning file's priority.
    priority: Priority,
}

#[derive(Debug)]
pub struct Pieces {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
    strategy: PickStrategy,
}

pub use Pieces as PiecePicker;

impl Pieces {

    pub fn new(num_pieces: usize) -> Self {
        Self::with_strategy(num_pieces, PickStrategy::default())
    }

    pub fn with_strategy(num_pieces: usize, strategy: PickStrategy) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
            strategy,
        }
    }

    pub fn set_strategy(&mut self, strategy: PickStrategy) {
        self.strategy = strategy;
    }

    // Sets the priority of a single piece. Used by `set_file_priority` to
    // apply a file's priority across every piece it intersects.
    pub fn set_priority(&mut self, idx: usize, priority: Priority) {
        self.pieces[idx].priority = priority;
    }

    // Applies `priority` to every piece in `piece_range`, i.e. the pieces a
    // file spans per `StoreInfo::piece_file_intersections`. A piece shared
    // by two files (the boundary piece) ends up with whichever file's
    // priority was applied last; callers apply priorities in file order so
    // the later, higher-index file wins the shared boundary piece.
    pub fn set_file_priority(&mut self, piece_range: std::ops::Range<usize>, priority: Priority) {
        for idx in piece_range {
            self.pieces[idx].priority = priority;
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
    }

    // Will return true if there is at least one piece that peer has and we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
        });
        interested
    }

    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {
        let idx = match self.strategy {
            PickStrategy::Sequential => self.pick_sequential(bf),
            PickStrategy::Streaming { cursor, window } => {
                self.pick_streaming(bf, cursor, window).or_else(|| self.pick_rarest(bf))
            }
            PickStrategy::RarestFirst => self.pick_rarest(bf),
        };
        if let Some(idx) = idx {
            self.pieces[idx].is_partial = true;
        }
        idx
    }

    fn available(&self, idx: usize, bf: &Bitfield) -> bool {
        !self.have[idx]
            && self.pieces[idx].frequency > 0
            && !self.pieces[idx].is_partial
            && self.pieces[idx].priority != Priority::DoNotDownload
            && bf[idx]
    }

    fn pick_sequential(&self, bf: &Bitfield) -> Option<usize> {
        (0..self.have.len()).find(|&idx| self.available(idx, bf))
    }

    // Pieces within [cursor, cursor + window) are preferred in order, so
    // playback never stalls waiting on a piece further ahead to finish.
    fn pick_streaming(&self, bf: &Bitfield, cursor: usize, window: usize) -> Option<usize> {
        let end = (cursor + window).min(self.have.len());
        (cursor..end).find(|&idx| self.available(idx, bf))
    }

    // Rarest-first weighted by priority: a piece's frequency is divided by
    // its priority weight before comparing, so a `High`/`Maximum` piece
    // competes as if it were rarer than it actually is. `available` already
    // excludes `DoNotDownload` pieces, so the weight here is never zero.
    fn pick_rarest(&self, bf: &Bitfield) -> Option<usize> {
        (0..self.have.len())
            .filter(|&idx| self.available(idx, bf))
            .min_by(|&a, &b| {
                let score = |idx: usize| self.pieces[idx].frequency as f64 / self.pieces[idx].priority.weight() as f64;
                score(a).partial_cmp(&score(b)).expect("frequency/weight ratio is never NaN")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn sequential_picks_lowest_index_first() {
        let mut pieces = Pieces::with_strategy(4, PickStrategy::Sequential);
        let bf = BitVec::repeat(true, 4);
        pieces.bitfield_update(&bf);
        assert_eq!(pieces.pick_new_piece(&bf), Some(0));
        assert_eq!(pieces.pick_new_piece(&bf), Some(1));
    }

    #[test]
    fn rarest_first_prefers_least_frequent_piece() {
        let mut pieces = Pieces::with_strategy(3, PickStrategy::RarestFirst);
        let mut bf = BitVec::repeat(false, 3);
        bf.set(0, true);
        bf.set(1, true);
        pieces.bitfield_update(&bf); // piece 0 and 1 now have frequency 1
        bf.set(1, false);
        bf.set(2, false);
        // second peer only has piece 0, bumping its frequency to 2
        let mut second = BitVec::repeat(false, 3);
        second.set(0, true);
        pieces.bitfield_update(&second);

        let all = BitVec::repeat(true, 3);
        // piece 1 has frequency 1, piece 0 has frequency 2: rarest-first picks 1.
        assert_eq!(pieces.pick_new_piece(&all), Some(1));
    }

    #[test]
    fn priority_weight_overrides_raw_rarity() {
        let mut pieces = Pieces::with_strategy(2, PickStrategy::RarestFirst);
        let bf = BitVec::repeat(true, 2);
        pieces.bitfield_update(&bf);
        // second peer only has piece 0, so piece 0 is rarer by raw frequency
        let mut second = BitVec::repeat(false, 2);
        second.set(0, true);
        pieces.bitfield_update(&second);

        // without priority, piece 1 (frequency 1) would win over piece 0 (frequency 2)
        pieces.set_priority(0, Priority::Maximum);
        pieces.set_priority(1, Priority::Low);
        assert_eq!(pieces.pick_new_piece(&bf), Some(0));
    }

    #[test]
    fn do_not_download_excludes_piece() {
        let mut pieces = Pieces::with_strategy(2, PickStrategy::RarestFirst);
        let bf = BitVec::repeat(true, 2);
        pieces.bitfield_update(&bf);
        pieces.set_priority(0, Priority::DoNotDownload);
        assert_eq!(pieces.pick_new_piece(&bf), Some(1));
    }

    #[test]
    fn streaming_prefers_cursor_window_then_falls_back() {
        let mut pieces = Pieces::with_strategy(5, PickStrategy::Streaming { cursor: 3, window: 2 });
        let bf = BitVec::repeat(true, 5);
        pieces.bitfield_update(&bf);
        assert_eq!(pieces.pick_new_piece(&bf), Some(3));
        assert_eq!(pieces.pick_new_piece(&bf), Some(4));
        // window exhausted, falls back to rarest-first over remaining pieces 0..3
        assert_eq!(pieces.pick_new_piece(&bf), Some(0));
    }
}
