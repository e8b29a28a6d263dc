//! An ordered collection of a torrent's [`Piece`]s plus the aggregate
//! progress counters the rest of the engine (and eventually the CLI
//! front-end) queries (§4.2 PieceDB).
//!
//! Like [`crate::piece`] this is new: the teacher never had a standalone
//! piece database, since it only ever wrote blocks straight through to
//! disk without a shared, queryable notion of per-piece progress across
//! peers.

use crate::{piece::Validity, Bitfield, BlockInfo, PeerId, Piece, PieceIndex, Sha1Hash};

pub(crate) use crate::piece::WriteBlockOutcome;

/// Ordered collection of a torrent's pieces (§4.2).
///
/// Mirrors the manifest ingestion sequence described in §6: `set_piece_length`
/// and `increase_piece_space` accumulate the information needed to derive
/// the (possibly shorter) length of the final piece, `add` appends one
/// piece per 20-byte digest in `pieces`, and [`PieceDb::finalize`] (called
/// once ingestion is done) materialises the actual [`Piece`]s with their
/// correct lengths.
pub(crate) struct PieceDb {
    piece_len: u32,
    total_len: u64,
    digests: Vec<Sha1Hash>,
    pieces: Vec<Piece>,
    num_downloaded: usize,
    num_completed: usize,
}

impl PieceDb {
    pub fn new() -> Self {
        Self {
            piece_len: 0,
            total_len: 0,
            digests: Vec::new(),
            pieces: Vec::new(),
            num_downloaded: 0,
            num_completed: 0,
        }
    }

    /// Sets the (nominal) length of all but possibly the last piece.
    pub fn set_piece_length(&mut self, len: u32) {
        self.piece_len = len;
    }

    /// Accounts for `bytes` more of file content, as files are registered
    /// by the manifest (§6 "file length" then "file path"). Used, along
    /// with `piece_len`, to derive the length of the final, possibly
    /// shorter, piece.
    pub fn increase_piece_space(&mut self, bytes: u64) {
        self.total_len += bytes;
    }

    /// Appends a piece with the given expected digest. The piece's actual
    /// length isn't known until [`PieceDb::finalize`] is called, since the
    /// last piece's length depends on the total content length.
    pub fn add(&mut self, expected_hash: Sha1Hash) {
        self.digests.push(expected_hash);
    }

    /// Materialises the actual [`Piece`]s from the accumulated digests,
    /// piece length, and total content length. Must be called exactly
    /// once, after manifest ingestion is complete and before any other
    /// query is made.
    pub fn finalize(&mut self) {
        debug_assert!(self.pieces.is_empty(), "finalize called more than once");
        debug_assert!(self.piece_len > 0);
        let piece_count = self.digests.len();
        self.pieces = self
            .digests
            .iter()
            .enumerate()
            .map(|(index, &hash)| {
                let len = if index + 1 == piece_count {
                    let full = self.piece_len as u64 * (piece_count - 1) as u64;
                    (self.total_len.saturating_sub(full)) as u32
                } else {
                    self.piece_len
                };
                Piece::new(index, len, hash)
            })
            .collect();
    }

    pub fn get(&self, index: PieceIndex) -> Option<&Piece> {
        self.pieces.get(index)
    }

    pub fn get_mut(&mut self, index: PieceIndex) -> Option<&mut Piece> {
        self.pieces.get_mut(index)
    }

    /// The number of pieces in the torrent (N in §3).
    pub fn length(&self) -> usize {
        self.pieces.len()
    }

    pub fn num_downloaded(&self) -> usize {
        self.num_downloaded
    }

    pub fn num_completed(&self) -> usize {
        self.num_completed
    }

    pub fn all_complete(&self) -> bool {
        self.num_completed == self.pieces.len()
    }

    /// Builds the bitfield advertised to newly connected peers, one bit
    /// per piece set iff it has passed hash validation (§4.4 "bitfield
    /// exchange").
    pub fn bitfield(&self) -> Bitfield {
        self.pieces.iter().map(Piece::is_complete).collect()
    }

    /// Records that `block` has arrived for `index`, contributed by `peer`.
    ///
    /// Returns the underlying [`WriteBlockOutcome`] so the caller (the
    /// torrent actor) knows whether to kick off validation.
    pub fn mark_block_downloaded(
        &mut self,
        index: PieceIndex,
        block: BlockInfo,
        peer: PeerId,
    ) -> Option<WriteBlockOutcome> {
        let piece = self.pieces.get_mut(index)?;
        let outcome = piece.mark_downloaded(block, peer);
        if outcome.newly_complete {
            self.num_downloaded += 1;
        }
        Some(outcome)
    }

    /// Applies the result of hashing a fully downloaded piece (§4.2: "on
    /// `write_block` returning `newly_complete`, the DB triggers
    /// `validate()`").
    ///
    /// `PieceDb.num_completed` is monotonically non-decreasing except when
    /// `is_valid` is false, in which case it doesn't change (invariant #4,
    /// §8).
    pub fn complete_validation(&mut self, index: PieceIndex, is_valid: bool) {
        let Some(piece) = self.pieces.get_mut(index) else {
            return;
        };
        if is_valid {
            piece.set_validity(Validity::Valid);
            self.num_completed += 1;
        } else {
            piece.set_validity(Validity::Invalid);
            piece.drop_download_progress();
            self.num_downloaded = self.num_downloaded.saturating_sub(1);
        }
    }
}

impl Default for PieceDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn hash_of(bytes: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&result);
        hash
    }

    fn new_db(piece_len: u32, total_len: u64, pieces: usize) -> PieceDb {
        let mut db = PieceDb::new();
        db.set_piece_length(piece_len);
        db.increase_piece_space(total_len);
        for i in 0..pieces {
            db.add(hash_of(&[i as u8]));
        }
        db.finalize();
        db
    }

    #[test]
    fn test_finalize_shortens_last_piece() {
        let db = new_db(16, 16 + 10, 2);
        assert_eq!(db.get(0).unwrap().len, 16);
        assert_eq!(db.get(1).unwrap().len, 10);
    }

    #[test]
    fn test_num_completed_does_not_decrease_on_invalid_validation() {
        let mut db = new_db(16, 16, 1);
        let block = db.get_mut(0).unwrap().poll_block_request().unwrap();
        db.mark_block_downloaded(0, block, [1u8; 20]);
        assert_eq!(db.num_downloaded(), 1);
        assert_eq!(db.num_completed(), 0);

        db.complete_validation(0, false);
        assert_eq!(db.num_completed(), 0);
        assert_eq!(db.num_downloaded(), 0);
        assert!(!db.get(0).unwrap().is_downloaded());

        let block = db.get_mut(0).unwrap().poll_block_request().unwrap();
        db.mark_block_downloaded(0, block, [1u8; 20]);
        db.complete_validation(0, true);
        assert_eq!(db.num_completed(), 1);
        assert!(db.all_complete());
    }
}
