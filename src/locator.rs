use crate::record::{Record, MAX_LEVEL};

/// One entry per skiplist level.
pub(crate) const LEVELS: usize = MAX_LEVEL as usize + 1;

/// Cached search position: the framed key, the record sitting at it (exact
/// match, tombstone, or the dummy for the empty key), and the back/forward
/// offsets at every level. Valid only for the `(generation, end)` it was
/// built against; any commit, abort, compaction, or append moves one of the
/// two and forces a re-search.
#[derive(Debug, Clone, Default)]
pub(crate) struct Locator {
    pub key: Vec<u8>,
    pub is_exact: bool,
    pub record: Option<Record>,
    /// Offset of the predecessor at each level.
    pub back: [u64; LEVELS],
    /// Offset of the successor at each level (the exact match's own forward
    /// pointers when `is_exact`).
    pub forward: [u64; LEVELS],
    /// True only after a full top-down search: `back`/`forward` frame the
    /// position at every level and may drive a stitch. In-order advancing
    /// keeps the position but drops the frame.
    pub framed: bool,
    pub generation: u64,
    pub end: u64,
}

impl Locator {
    pub fn start(key: &[u8], generation: u64, end: u64) -> Self {
        Self {
            key: key.to_vec(),
            generation,
            end,
            ..Default::default()
        }
    }

    pub fn valid(&self, generation: u64, end: u64) -> bool {
        self.generation == generation && self.end == end
    }
}
