//! A single piece of a torrent: its block-level download/request bitmaps,
//! the set of peers that contributed bytes to it, and its hash validity.
//!
//! This is new relative to the teacher, which only ever tracked a piece's
//! write-buffer-and-hash inline in `disk::io`, plus a per-session download
//! cursor in its now-removed `download` module. Because blocks of the same
//! piece can now be requested from, and contributed by, more than one peer
//! at once (endgame mode, §4.5), the request/download bookkeeping has to
//! live somewhere shared rather than inside a single `PeerSession`, hence
//! this module.

use std::collections::HashSet;

use bitvec::prelude::bitvec;

use crate::{block_count, block_len, Bitfield, BlockInfo, PeerId, Sha1Hash};

/// A piece's hash-validation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Validity {
    /// The piece hasn't been fully downloaded yet, or has been but hasn't
    /// been hashed yet.
    Unchecked,
    /// All blocks are present and the concatenated bytes hash to the
    /// expected digest.
    Valid,
    /// All blocks were present but the hash didn't match; the piece's
    /// progress has been dropped and it needs to be downloaded again.
    Invalid,
}

/// The result of [`Piece::write_block`].
#[derive(Debug)]
pub(crate) struct WriteBlockOutcome {
    /// The number of blocks downloaded so far, for progress reporting.
    pub downloaded_block_count: usize,
    /// Set exactly once, on the write that completes the last missing
    /// block of the piece.
    pub newly_complete: bool,
}

/// One fixed-size (except possibly the last) chunk of a torrent's data,
/// authenticated by a 20 byte SHA-1 digest (§3 "Piece").
pub(crate) struct Piece {
    /// The piece's index within the torrent.
    pub index: usize,
    /// The piece's length in bytes.
    pub len: u32,
    /// The expected SHA-1 digest of the piece's concatenated bytes.
    pub expected_hash: Sha1Hash,
    /// Which blocks have been written to the disk cache.
    downloaded: Bitfield,
    /// Which blocks are currently in flight to some peer.
    requested: Bitfield,
    /// The sequential cursor used by `poll_block_request` to avoid
    /// rescanning the bitmaps from the start on every call.
    cursor: usize,
    /// Peers that have contributed at least one block to this piece.
    contributors: HashSet<PeerId>,
    hash_validity: Validity,
}

impl Piece {
    /// Creates a new, empty piece awaiting its first block.
    pub fn new(index: usize, len: u32, expected_hash: Sha1Hash) -> Self {
        let block_count = block_count(len);
        Self {
            index,
            len,
            expected_hash,
            downloaded: bitvec![0; block_count],
            requested: bitvec![0; block_count],
            cursor: 0,
            contributors: HashSet::new(),
            hash_validity: Validity::Unchecked,
        }
    }

    pub fn validity(&self) -> Validity {
        self.hash_validity
    }

    /// Whether every block has been downloaded, regardless of hash
    /// validity.
    pub fn is_downloaded(&self) -> bool {
        self.downloaded.all()
    }

    /// A piece is complete iff all of its blocks are downloaded and its
    /// hash has been verified (§3 PieceDB invariant).
    pub fn is_complete(&self) -> bool {
        self.is_downloaded() && self.hash_validity == Validity::Valid
    }

    pub fn downloaded_block_count(&self) -> usize {
        self.downloaded.count_ones()
    }

    /// Whether every block is either downloaded or currently requested —
    /// i.e. there is nothing left for `poll_block_request` to hand out.
    pub fn is_saturated(&self) -> bool {
        (0..self.downloaded.len())
            .all(|index| self.downloaded[index] || self.requested[index])
    }

    /// Returns the next block to request, advancing the sequential cursor
    /// past blocks already downloaded or requested (§4.1).
    ///
    /// Returns `None` if the piece is saturated: every block is either
    /// downloaded or in flight. The caller (the piece selector, in
    /// endgame mode) decides whether to request an already in-flight
    /// block anyway, via [`Self::poll_block_request_endgame`].
    pub fn poll_block_request(&mut self) -> Option<BlockInfo> {
        let block_count = self.downloaded.len();
        for _ in 0..block_count {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % block_count;
            if !self.downloaded[index] && !self.requested[index] {
                self.requested.set(index, true);
                return Some(BlockInfo {
                    piece_index: self.index,
                    offset: index as u32 * crate::BLOCK_LEN,
                    len: block_len(self.len, index),
                });
            }
        }
        None
    }

    /// Like [`Self::poll_block_request`], but once the piece is saturated
    /// (every block already requested), also hands out a block that's
    /// requested but not yet downloaded, so it can be requested from a
    /// second peer (§4.5 endgame: "duplicate requesting of the last k
    /// pieces"). Still never returns an already-downloaded block.
    pub fn poll_block_request_endgame(&mut self) -> Option<BlockInfo> {
        if let Some(block) = self.poll_block_request() {
            return Some(block);
        }
        let block_count = self.downloaded.len();
        (0..block_count)
            .find(|&index| !self.downloaded[index])
            .map(|index| BlockInfo {
                piece_index: self.index,
                offset: index as u32 * crate::BLOCK_LEN,
                len: block_len(self.len, index),
            })
    }

    /// Clears the requested bit for `block`, invoked when the peer holding
    /// the request disconnects or times out (§4.1).
    pub fn giveback_block(&mut self, block: BlockInfo) {
        let index = block.index_in_piece();
        self.requested.set(index, false);
    }

    /// Marks `block` as downloaded and records `peer` as a contributor.
    ///
    /// The caller (the disk cache) has already staged the bytes before
    /// this is called, satisfying the "a block is never marked downloaded
    /// until its bytes are staged" invariant (§3).
    pub fn mark_downloaded(&mut self, block: BlockInfo, peer: PeerId) -> WriteBlockOutcome {
        let index = block.index_in_piece();
        let was_complete = self.is_downloaded();
        self.downloaded.set(index, true);
        self.requested.set(index, false);
        self.contributors.insert(peer);
        let newly_complete = !was_complete && self.is_downloaded();
        WriteBlockOutcome {
            downloaded_block_count: self.downloaded_block_count(),
            newly_complete,
        }
    }

    /// Sets the piece's validity, called by the piece database once it has
    /// hashed the piece's full contents.
    pub fn set_validity(&mut self, validity: Validity) {
        self.hash_validity = validity;
    }

    /// Zeroes the download and request bitmaps and resets validity to
    /// `Unchecked`; invoked after a failed hash validation (§4.1).
    ///
    /// This is the left inverse of any sequence of partial writes: after
    /// calling this, `poll_block_request` reproduces the original
    /// sequence of blocks from the start.
    pub fn drop_download_progress(&mut self) {
        self.downloaded.set_all(false);
        self.requested.set_all(false);
        self.cursor = 0;
        self.hash_validity = Validity::Unchecked;
    }

    pub fn contributors(&self) -> &HashSet<PeerId> {
        &self.contributors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> Sha1Hash {
        [0u8; 20]
    }

    #[test]
    fn test_poll_block_request_skips_downloaded_and_requested() {
        let mut piece = Piece::new(0, 3 * crate::BLOCK_LEN, hash());
        let peer = [1u8; 20];

        let b0 = piece.poll_block_request().unwrap();
        assert_eq!(b0.offset, 0);
        piece.mark_downloaded(b0, peer);

        let b1 = piece.poll_block_request().unwrap();
        assert_eq!(b1.offset, crate::BLOCK_LEN);
        // b1 is now requested but not downloaded; polling again must not
        // return it a second time outside endgame mode.
        let b2 = piece.poll_block_request().unwrap();
        assert_eq!(b2.offset, 2 * crate::BLOCK_LEN);

        assert!(piece.poll_block_request().is_none());
        assert!(piece.is_saturated());
    }

    #[test]
    fn test_newly_complete_fires_exactly_once() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN, hash());
        let peer = [1u8; 20];
        let block = piece.poll_block_request().unwrap();
        let outcome = piece.mark_downloaded(block, peer);
        assert!(outcome.newly_complete);

        // a duplicate write of the same block (e.g. endgame race) must not
        // re-signal completion.
        let outcome = piece.mark_downloaded(block, peer);
        assert!(!outcome.newly_complete);
    }

    #[test]
    fn test_giveback_clears_requested_bit_only() {
        let mut piece = Piece::new(0, 2 * crate::BLOCK_LEN, hash());
        let peer = [1u8; 20];
        let b0 = piece.poll_block_request().unwrap();
        piece.mark_downloaded(b0, peer);
        let b1 = piece.poll_block_request().unwrap();

        piece.giveback_block(b1);
        // block 0 remains downloaded; block 1 is requestable again.
        assert!(piece.downloaded[0]);
        let reclaimed = piece.poll_block_request().unwrap();
        assert_eq!(reclaimed, b1);
    }

    #[test]
    fn test_drop_download_progress_reproduces_original_sequence() {
        let mut piece = Piece::new(0, 3 * crate::BLOCK_LEN, hash());
        let peer = [1u8; 20];
        let mut requested = Vec::new();
        while let Some(block) = piece.poll_block_request() {
            piece.mark_downloaded(block, peer);
            requested.push(block);
        }
        piece.set_validity(Validity::Invalid);
        piece.drop_download_progress();

        assert_eq!(piece.validity(), Validity::Unchecked);
        assert!(!piece.is_downloaded());

        let mut reproduced = Vec::new();
        while let Some(block) = piece.poll_block_request() {
            reproduced.push(block);
        }
        assert_eq!(requested, reproduced);
    }
}
