use std::path::PathBuf;

use serde_bencode::Error;
use sha1::{Digest, Sha1};

use crate::{storage_info::FsStructure, FileInfo, Sha1Hash};

/// A parsed torrent metainfo ("`.torrent`") file.
///
/// Only the `info` dictionary participates in the infohash (it's hashed
/// bencoded verbatim), so it's kept as its own nested struct even though
/// `announce`/`announce-list` live alongside it at the top level.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    /// The tracker's announce URL.
    pub announce: Option<String>,
    /// BEP 12 backup tracker tiers, each tier a list of URLs tried in
    /// order before falling through to the next tier (§6 "announce queue
    /// with fallback", supplementing the original's `llqueue_offer`
    /// behaviour, which this crate's tracker queue mirrors).
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces, derived from the length of the concatenated
    /// piece hash string (§6 "pieces (concatenation of 20-byte digests)").
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The nominal piece length (all but possibly the last piece).
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// Returns the flattened list of announce URLs to try, in order: the
    /// primary `announce` URL first (if present and not already covered by
    /// the announce-list), then every tier of `announce-list` flattened
    /// (§6 "announce (string) → appended to the announce queue").
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }

    /// Derives the on-disk file structure from the manifest, mirroring the
    /// original's sequential `(file length, file path)` manifest event
    /// handling (§6, §3 "Supplemented features"): single `length` means a
    /// single file named after the torrent; a `files` list means an
    /// archive, walked in order so each file's `torrent_offset` reflects
    /// its position in the concatenated byte stream.
    pub fn structure(&self) -> FsStructure {
        match (&self.info.length, &self.info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: *len,
                torrent_offset: 0,
            }),
            (None, Some(files)) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|file| {
                        let info = FileInfo {
                            path: file.path.iter().collect(),
                            len: file.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += info.len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            _ => {
                // a well-formed manifest has exactly one of `length`
                // (single file) or `files` (archive); treat an
                // ambiguous/empty manifest as a single empty file rather
                // than panicking on malformed input from the network.
                log::warn!(
                    "Metainfo has neither or both of `length`/`files`; \
                     treating as empty single file"
                );
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&self.info.name),
                    len: 0,
                    torrent_offset: 0,
                })
            }
        }
    }
}

/// The `info` dictionary of a metainfo file — the part whose bencoded
/// bytes are hashed to produce the infohash.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
