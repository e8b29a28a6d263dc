use {
    nix::sys::uio::{preadv, pwritev},
    sha1::{Digest, Sha1},
    std::{
        collections::HashMap,
        fs::{self, File, OpenOptions},
        ops::Range,
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex, RwLock},
    },
    tokio::{sync::mpsc, task},
};

use {
    super::{
        cache::DiskCache,
        error::*,
        Alert, AlertReceiver, AlertSender, Command, CommandReceiver,
        CommandSender, TorrentAlert, TorrentAlertReceiver, TorrentAlertSender,
        TorrentAllocation, ValidationOutcome,
    },
    crate::{
        iovecs::{IoVec, IoVecs},
        storage_info::{FsStructure, StorageInfo},
        BlockInfo, FileIndex, FileInfo, PeerId, PieceIndex, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk and
/// serving reads of them back, for both hash validation and upload
/// requests.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, Arc<RwLock<Torrent>>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    cache_capacity,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    let torrent_res = Torrent::new(info, piece_hashes, cache_capacity);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, Arc::new(RwLock::new(torrent)));
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock {
                    id,
                    info,
                    data,
                    peer,
                } => {
                    self.with_torrent(id, |t| t.write_block(info, data, peer))
                        .await?;
                }
                Command::ReadBlock { id, info } => {
                    self.with_torrent(id, |t| t.read_block(info)).await?;
                }
                Command::ValidatePiece { id, index } => {
                    self.with_torrent(id, |t| t.validate_piece(index)).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Looks up `id`'s torrent and runs the given operation against it on
    /// the blocking thread pool, since all of these operations perform
    /// synchronous file IO (§5 "reimplementations MAY offload disk to a
    /// dedicated thread"). `spawn_blocking`'s own worker pool is how that
    /// offload actually happens, rather than running it inline on the
    /// disk task's event loop, which would stall every other torrent's IO
    /// while one syscall blocks.
    async fn with_torrent<F>(&self, id: TorrentId, op: F) -> Result<()>
    where
        F: FnOnce(&Torrent) + Send + 'static,
    {
        let torrent = Arc::clone(
            self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?,
        );
        // we only need a read lock: `Torrent`'s per-operation state (the
        // disk cache) is internally synchronized, and the shared file
        // handles are each behind their own mutex.
        task::spawn_blocking(move || {
            let torrent = torrent.read().unwrap();
            op(&torrent);
        })
        .await
        .map_err(|_| Error::BlockingTaskPanicked)?;
        Ok(())
    }
}

/// Torrent information related to disk IO.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert the torrent actor of write/read/validation
    /// completions.
    alert_chan: TorrentAlertSender,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// The write-through block cache sitting in front of these files
    /// (§4.3).
    cache: Mutex<DiskCache>,
    /// Disk IO statistics.
    stats: Mutex<Stats>,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For a single file, there is a path validity check and then the file is
    /// opened. For multi-file torrents, if there are any subdirectories in the
    /// torrent archive, they are created and all files are opened.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        cache_capacity: u64,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        if info.download_dir.exists() {
            log::warn!("Download path {:?} exists", info.download_dir);
            return Err(NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "Download path already exists",
            )));
        }

        let open_file = |info: FileInfo| {
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                vec![open_file(file.clone())?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                log::debug!("Setting up directory structure");
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    debug_assert!(!file.path.is_absolute());

                    if let Some(subdir) = file.path.parent() {
                        if !subdir.as_os_str().is_empty() && !subdir.exists() {
                            log::info!("Creating torrent subdir {:?}", subdir);
                            fs::create_dir_all(&subdir).map_err(|e| {
                                log::warn!(
                                    "Failed to create subdir {:?}",
                                    subdir
                                );
                                NewTorrentError::Io(e)
                            })?;
                        }
                    }

                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                files: Arc::new(files),
                piece_hashes,
                cache: Mutex::new(DiskCache::new(cache_capacity)),
                stats: Mutex::new(Stats::default()),
            },
            alert_port,
        ))
    }

    /// Returns the expected 20 byte hash of `index`, or `None` if the index
    /// is out of range.
    fn expected_hash(&self, index: PieceIndex) -> Option<[u8; 20]> {
        let pos = index * 20;
        let slice = self.piece_hashes.get(pos..pos + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Writes a block through to disk immediately and populates the cache
    /// with it (§4.3 write-through).
    fn write_block(&self, info: BlockInfo, data: Vec<u8>, peer: PeerId) {
        log::trace!("Saving block {:?} to disk", info);

        let piece_torrent_offset =
            info.piece_index as u64 * self.info.piece_len as u64;
        let torrent_offset = piece_torrent_offset + info.offset as u64;

        let result = write_bytes(&self.files, torrent_offset, &data);
        match &result {
            Ok(count) => {
                self.stats.lock().unwrap().write_count += *count as u64;
                self.cache
                    .lock()
                    .unwrap()
                    .insert(info.piece_index, info.offset, data);
            }
            Err(e) => {
                log::warn!("Block {:?} write error: {}", info, e);
                self.stats.lock().unwrap().write_failure_count += 1;
            }
        }

        // result is intentionally dropped here: the `with_torrent` wrapper
        // that called us runs on the blocking pool and has no way to
        // propagate a value back other than through the alert channel.
        let alert = TorrentAlert::Write(
            result.map(|_| (info, peer)).map_err(WriteError::Io),
        );
        if self.alert_chan.send(alert).is_err() {
            log::warn!("Torrent alert channel disconnected");
        }
    }

    /// Reads a block back, preferring the cache, to serve an upload
    /// request.
    fn read_block(&self, info: BlockInfo) {
        log::trace!("Reading block {:?} from disk", info);

        if let Some(data) = self
            .cache
            .lock()
            .unwrap()
            .get(info.piece_index, info.offset)
        {
            let data = data.to_vec();
            let _ = self
                .alert_chan
                .send(TorrentAlert::Read(Ok((info, data))));
            return;
        }

        let piece_torrent_offset =
            info.piece_index as u64 * self.info.piece_len as u64;
        let torrent_offset = piece_torrent_offset + info.offset as u64;
        let result = read_bytes(&self.files, torrent_offset, info.len as usize)
            .map_err(ReadError::Io);
        let alert = match result {
            Ok(data) => TorrentAlert::Read(Ok((info, data))),
            Err(e) => TorrentAlert::Read(Err(e)),
        };
        let _ = self.alert_chan.send(alert);
    }

    /// Reads a fully downloaded piece's bytes back and hashes them,
    /// evicting the piece's cached blocks on success (§4.1 validate, §4.3
    /// eviction on completion).
    fn validate_piece(&self, index: PieceIndex) {
        log::trace!("Validating piece {}", index);

        let expected_hash = match self.expected_hash(index) {
            Some(hash) => hash,
            None => {
                let _ = self
                    .alert_chan
                    .send(TorrentAlert::Validate(Err(ReadError::InvalidPieceIndex)));
                return;
            }
        };
        let len = match self.info.piece_len(index) {
            Ok(len) => len,
            Err(_) => {
                let _ = self
                    .alert_chan
                    .send(TorrentAlert::Validate(Err(ReadError::InvalidPieceIndex)));
                return;
            }
        };

        let piece_torrent_offset = index as u64 * self.info.piece_len as u64;
        let result =
            read_bytes(&self.files, piece_torrent_offset, len as usize)
                .map_err(ReadError::Io);

        let alert = match result {
            Ok(data) => {
                let mut hasher = Sha1::new();
                hasher.update(&data);
                let hash = hasher.finalize();
                let is_valid = hash.as_slice() == expected_hash;
                log::debug!("Piece {} hash valid: {}", index, is_valid);
                if is_valid {
                    self.cache.lock().unwrap().evict_piece(index);
                }
                TorrentAlert::Validate(Ok(ValidationOutcome { index, is_valid }))
            }
            Err(e) => TorrentAlert::Validate(Err(e)),
        };
        let _ = self.alert_chan.send(alert);
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes `iovecs` at `offset`, repeating the syscall until every byte
    /// is confirmed written (IO syscalls aren't guaranteed to consume the
    /// whole input buffer in one go).
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_>,
        mut offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count =
                pwritev(self.handle.as_raw_fd(), iovecs.buffers(), offset as i64)
                    .map_err(|e| {
                        log::warn!("File {:?} write error: {}", self.info.path, e);
                        WriteError::Io(std::io::Error::from(e))
                    })?;
            iovecs.advance(write_count);
            offset += write_count as u64;
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }

    /// Reads into `iovecs` starting at `offset`, repeating until every
    /// buffer is filled or EOF is hit.
    fn read_vectored_at(
        &self,
        iovecs: &mut ReadIoVecs<'_>,
        mut offset: u64,
    ) -> Result<usize, ReadError> {
        let mut total_read_count = 0;
        loop {
            if iovecs.remaining() == 0 {
                break;
            }
            let read_count =
                preadv(self.handle.as_raw_fd(), iovecs.buffers_mut(), offset as i64)
                    .map_err(|e| {
                        log::warn!("File {:?} read error: {}", self.info.path, e);
                        ReadError::Io(std::io::Error::from(e))
                    })?;
            if read_count == 0 {
                break;
            }
            iovecs.advance(read_count);
            offset += read_count as u64;
            total_read_count += read_count;
        }
        Ok(total_read_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// Writes `data` (a single contiguous buffer, which may span more than one
/// file if the write straddles a file boundary) at `torrent_offset`.
///
/// This generalizes the teacher's piece-at-a-time `Piece::write` (which
/// only ever wrote a whole piece's concatenated blocks at once) to an
/// arbitrary byte range, since blocks are now written through
/// individually rather than batched until a piece completes.
fn write_bytes(
    files: &[Mutex<TorrentFile>],
    torrent_offset: u64,
    data: &[u8],
) -> Result<usize, WriteError> {
    let mut total_write_count = 0;
    let mut bufs: Vec<IoVec> = vec![IoVec::from_slice(data)];
    let mut write_torrent_offset = torrent_offset;

    let overlapping = files_overlapping_range(files, torrent_offset, data.len() as u64);
    debug_assert!(!overlapping.is_empty());

    if overlapping.len() == 1 {
        let file = overlapping[0].lock().unwrap();
        let slice = file.info.get_slice(write_torrent_offset, data.len() as u64);
        let mut iovecs = IoVecs::unbounded(&bufs);
        total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
        bufs = iovecs.into_tail();
    } else {
        for file in overlapping {
            let file = file.lock().unwrap();
            let remaining: usize =
                bufs.iter().map(|iov| iov.as_slice().len()).sum();
            if remaining == 0 {
                break;
            }
            let slice = file.info.get_slice(write_torrent_offset, remaining as u64);
            let mut iovecs = IoVecs::bounded(&bufs, slice.len as usize);
            let write_count =
                file.write_vectored_at(&mut iovecs, slice.offset)?;
            bufs = iovecs.into_tail();
            write_torrent_offset += write_count as u64;
            total_write_count += write_count;
        }
    }

    debug_assert!(bufs.is_empty());
    Ok(total_write_count)
}

/// Reads `len` bytes starting at `torrent_offset`, possibly spanning more
/// than one file. Used both to serve upload requests and to read back a
/// whole piece for hash validation.
fn read_bytes(
    files: &[Mutex<TorrentFile>],
    torrent_offset: u64,
    len: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let mut data = vec![0u8; len];
    let overlapping =
        files_overlapping_range(files, torrent_offset, len as u64);
    debug_assert!(!overlapping.is_empty());

    let mut read_torrent_offset = torrent_offset;
    let mut written = 0;
    for file in overlapping {
        let file = file.lock().unwrap();
        let remaining = len - written;
        if remaining == 0 {
            break;
        }
        let slice = file.info.get_slice(read_torrent_offset, remaining as u64);
        let chunk_len = slice.len as usize;
        let mut iovecs = ReadIoVecs::new(&mut data[written..written + chunk_len]);
        let read_count = file
            .read_vectored_at(&mut iovecs, slice.offset)
            .map_err(|e| match e {
                ReadError::Io(e) => e,
                ReadError::InvalidPieceIndex => std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid piece index",
                ),
            })?;
        written += read_count;
        read_torrent_offset += read_count as u64;
    }
    data.truncate(written);
    Ok(data)
}

/// Returns the subslice of `files` that `[offset, offset + len)` overlaps,
/// delegating to `StorageInfo`'s range-to-file mapping logic rather than
/// duplicating it here.
fn files_overlapping_range(
    files: &[Mutex<TorrentFile>],
    offset: u64,
    len: u64,
) -> Vec<&Mutex<TorrentFile>> {
    let range = byte_range_to_file_range(files, offset, len);
    files[range].iter().collect()
}

/// Finds the first and last file index that `[offset, offset+len)`
/// overlaps, assuming `files` are laid out contiguously in torrent-offset
/// order (true for both `FsStructure::File` and `::Archive`).
fn byte_range_to_file_range(
    files: &[Mutex<TorrentFile>],
    offset: u64,
    len: u64,
) -> Range<FileIndex> {
    let end = offset + len;
    let mut start_index = 0;
    let mut end_index = files.len();
    for (i, file) in files.iter().enumerate() {
        let info = &file.lock().unwrap().info;
        let file_start = info.torrent_offset;
        let file_end = info.torrent_end_offset();
        if offset < file_end && file_start <= offset {
            start_index = i;
        }
        if end <= file_end {
            end_index = i + 1;
            break;
        }
    }
    start_index..end_index
}

/// A thin vectored-read adapter: unlike writes, reads need a single
/// mutable destination buffer split into `nix::sys::uio::IoVec<&mut [u8]>`
/// segments, so it can't reuse [`crate::iovecs::IoVecs`] (which is
/// specialized to the `&[u8]` write side).
struct ReadIoVecs<'a> {
    buf: &'a mut [u8],
    filled: usize,
}

impl<'a> ReadIoVecs<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, filled: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.filled
    }

    fn buffers_mut(&mut self) -> [nix::sys::uio::IoVec<&mut [u8]>; 1] {
        [nix::sys::uio::IoVec::from_mut_slice(&mut self.buf[self.filled..])]
    }

    fn advance(&mut self, n: usize) {
        self.filled += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sha1::{Digest as _, Sha1 as Sha1Hasher};
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("cratetorrent-disk-io-test-{}-{}", name, std::process::id()));
        dir
    }

    fn hash_of(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1Hasher::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&result);
        hash
    }

    fn single_file_torrent(name: &str, content_len: u64) -> (StorageInfo, PathBuf) {
        let download_dir = temp_dir(name);
        let _ = fs::remove_dir_all(&download_dir);
        let metainfo = crate::metainfo::Metainfo {
            info: crate::metainfo::Info {
                name: "f.bin".to_string(),
                pieces: vec![],
                piece_length: content_len,
                length: Some(content_len),
                files: None,
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        let info = StorageInfo::new(&metainfo, download_dir.clone());
        (info, download_dir)
    }

    #[test]
    fn test_write_then_read_back_roundtrips() {
        let (info, download_dir) = single_file_torrent("roundtrip", 16);
        let data = b"Hello, world!!!\n".to_vec();
        let expected_hash = hash_of(&data);
        let (torrent, mut alert_port) =
            Torrent::new(info, expected_hash.to_vec(), 10 * 1024 * 1024).unwrap();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: data.len() as u32,
        };
        let peer = [7u8; 20];
        torrent.write_block(block, data.clone(), peer);
        match alert_port.try_recv().unwrap() {
            TorrentAlert::Write(Ok((info, contributor))) => {
                assert_eq!(info, block);
                assert_eq!(contributor, peer);
            }
            _ => panic!("expected a successful write alert"),
        }

        torrent.read_block(block);
        match alert_port.try_recv().unwrap() {
            TorrentAlert::Read(Ok((_, bytes))) => assert_eq!(bytes, data),
            _ => panic!("expected a successful read alert"),
        }

        torrent.validate_piece(0);
        match alert_port.try_recv().unwrap() {
            TorrentAlert::Validate(Ok(outcome)) => {
                assert_eq!(outcome.index, 0);
                assert!(outcome.is_valid);
            }
            _ => panic!("expected a successful validation alert"),
        }

        let _ = fs::remove_dir_all(&download_dir);
    }
}
