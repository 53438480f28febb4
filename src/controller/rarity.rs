use std::collections::BTreeMap;

/// Groups pieces by how many unchoked peers hold them.
///
/// Flattening yields piece indices in ascending rarity order; pieces with
/// the same count keep their insertion order within the group.
pub(crate) struct RarityMap {
    data: BTreeMap<u32, Vec<u32>>,
}

impl RarityMap {
    pub(crate) fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }

    pub(crate) fn put(&mut self, rarity: u32, piece: u32) {
        self.data.entry(rarity).or_default().push(piece);
    }

    pub(crate) fn pieces_by_rarity(self) -> Vec<u32> {
        self.data.into_values().flatten().collect()
    }
}

/// One candidate piece for a specific peer, carrying the two sort keys for
/// assignment: how many peers already fetch it, and where it sits in the
/// rarity order.
pub(crate) struct PiecePriority {
    pub(crate) piece: u32,
    pub(crate) active_requests_total: u32,
    pub(crate) rarity_index: usize,
}

/// Sorts candidates by active-request total, rarity index breaking ties,
/// and returns the bare piece indices in that order.
pub(crate) fn sorted_piece_slice(mut candidates: Vec<PiecePriority>) -> Vec<u32> {
    candidates.sort_by_key(|c| (c.active_requests_total, c.rarity_index));
    candidates.into_iter().map(|c| c.piece).collect()
}
