//! Torrent geometry: piece and block arithmetic.
//!
//! The download controller thinks in whole pieces; the wire protocol moves
//! 16KB blocks. This module holds the fixed facts about a torrent that both
//! sides need to translate between the two.

use crate::constants::BLOCK_SIZE;

/// A request for a specific block of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// The piece index.
    pub piece: u32,
    /// Byte offset within the piece.
    pub offset: u32,
    /// Length of the block in bytes.
    pub length: u32,
}

/// Immutable facts about a torrent's shape, known once the metainfo is
/// parsed: the info-hash and how the payload is cut into pieces.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    /// 20-byte SHA-1 of the metainfo's info dictionary.
    pub info_hash: [u8; 20],
    /// Number of pieces in the torrent.
    pub piece_count: u32,
    /// Nominal piece length in bytes (the last piece may be shorter).
    pub piece_length: u64,
    /// Total payload size in bytes.
    pub total_length: u64,
}

impl TorrentLayout {
    /// Returns the actual size of a piece, accounting for a short last piece.
    pub fn piece_size(&self, piece: u32) -> u64 {
        if self.piece_count == 0 {
            return 0;
        }
        if piece < self.piece_count - 1 {
            self.piece_length
        } else {
            let remainder = self.total_length % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        }
    }

    /// Decomposes a piece into its block requests, in offset order.
    pub fn block_requests(&self, piece: u32) -> Vec<BlockRequest> {
        let piece_size = self.piece_size(piece) as u32;
        let mut requests = Vec::with_capacity(piece_size.div_ceil(BLOCK_SIZE) as usize);

        let mut offset = 0u32;
        while offset < piece_size {
            let length = BLOCK_SIZE.min(piece_size - offset);
            requests.push(BlockRequest {
                piece,
                offset,
                length,
            });
            offset += length;
        }

        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(piece_count: u32, piece_length: u64, total_length: u64) -> TorrentLayout {
        TorrentLayout {
            info_hash: [0; 20],
            piece_count,
            piece_length,
            total_length,
        }
    }

    #[test]
    fn piece_size_handles_short_last_piece() {
        let l = layout(3, 32768, 32768 * 2 + 100);
        assert_eq!(l.piece_size(0), 32768);
        assert_eq!(l.piece_size(1), 32768);
        assert_eq!(l.piece_size(2), 100);
    }

    #[test]
    fn piece_size_exact_multiple() {
        let l = layout(2, 32768, 65536);
        assert_eq!(l.piece_size(1), 32768);
    }

    #[test]
    fn block_requests_cover_piece() {
        let l = layout(2, 40000, 80000);
        let blocks = l.block_requests(0);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].length, 16384);
        assert_eq!(blocks[1].offset, 16384);
        assert_eq!(blocks[2].offset, 32768);
        assert_eq!(blocks[2].length, 40000 - 32768);
        assert_eq!(blocks.iter().map(|b| b.length as u64).sum::<u64>(), 40000);
    }

    #[test]
    fn block_requests_single_short_block() {
        let l = layout(1, 16384, 1000);
        let blocks = l.block_requests(0);
        assert_eq!(blocks, vec![BlockRequest { piece: 0, offset: 0, length: 1000 }]);
    }
}
