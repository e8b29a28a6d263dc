//! The literal end-to-end scenarios from §8: a real [`torrent_engine::engine::Engine`]
//! talking the wire protocol over a loopback `TcpStream` to a hand-driven
//! stand-in for a remote peer. S3/S4 are exercised at the `Piece`/`PiecePicker`
//! unit level inside their own modules, since they're about concurrency
//! bookkeeping rather than wire bytes; S6's bitfield round trip is exercised
//! alongside the codec it belongs to. This covers S1, S2, and S5.

use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

use torrent_engine::{
    engine::Engine,
    metainfo::{File as MetaFile, Info},
    Conf,
};

const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Bencodes an [`Info`] dict and wraps it as a minimal single-key metainfo
/// dict (`d4:info<info-dict>e`), matching what
/// `torrent_engine::metainfo::Metainfo::from_bytes` expects (§6). Omitting
/// `announce`/`announce-list` is fine: both are optional and the tests
/// connect peers manually via `Engine::connect_peer` rather than a tracker.
fn encode_metainfo(info: &Info) -> Vec<u8> {
    let info_bytes = serde_bencode::to_bytes(info).expect("info dict encodes");
    let mut out = Vec::with_capacity(info_bytes.len() + 16);
    out.extend_from_slice(b"d4:info");
    out.extend_from_slice(&info_bytes);
    out.push(b'e');
    out
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let digest = Sha1::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Reads exactly the 68-byte handshake (§6) off `stream` and returns its
/// infohash, then writes back our own handshake carrying the same infohash
/// and an arbitrary 20-byte peer id.
async fn exchange_handshake(stream: &mut TcpStream, info_hash: [u8; 20], peer_id: [u8; 20]) {
    let mut buf = [0u8; 1 + 19 + 8 + 20 + 20];
    stream.read_exact(&mut buf).await.expect("read handshake");
    assert_eq!(buf[0] as usize, PROTOCOL_STRING.len());
    assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
    let mut their_info_hash = [0u8; 20];
    their_info_hash.copy_from_slice(&buf[28..48]);
    assert_eq!(their_info_hash, info_hash, "engine advertised wrong infohash");

    let mut reply = Vec::with_capacity(buf.len());
    reply.push(PROTOCOL_STRING.len() as u8);
    reply.extend_from_slice(PROTOCOL_STRING.as_bytes());
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(&peer_id);
    stream.write_all(&reply).await.expect("write handshake");
}

async fn send_message(stream: &mut TcpStream, id: u8, payload: &[u8]) {
    let len = (1 + payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + payload.len() + 1);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.expect("write message");
}

async fn send_bitfield(stream: &mut TcpStream, bytes: &[u8]) {
    send_message(stream, 5, bytes).await;
}

async fn send_unchoke(stream: &mut TcpStream) {
    send_message(stream, 1, &[]).await;
}

/// Reads the engine's unsolicited post-handshake `Bitfield` message and
/// discards it: every test here connects a lone, fully-seeded peer, so the
/// engine's own bitfield content (all zero bits, nothing downloaded yet) is
/// never asserted on.
async fn skip_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.expect("read length prefix");
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.expect("read message body");
    if len == 0 {
        return (u8::MAX, Vec::new());
    }
    let id = body[0];
    (id, body[1..].to_vec())
}

/// Reads messages off `stream` until one with `want_id` arrives (ignoring
/// interleaved `Interested`/`Have`/keepalive traffic), and returns its
/// payload.
async fn expect_message(stream: &mut TcpStream, want_id: u8) -> Vec<u8> {
    loop {
        let (id, payload) = skip_message(stream).await;
        if id == want_id {
            return payload;
        }
    }
}

fn single_file_info(name: &str, data: &[u8], piece_len: u32, piece_hashes: &[[u8; 20]]) -> Info {
    let mut pieces = Vec::with_capacity(piece_hashes.len() * 20);
    for hash in piece_hashes {
        pieces.extend_from_slice(hash);
    }
    Info {
        name: name.to_string(),
        pieces,
        piece_length: piece_len as u64,
        length: Some(data.len() as u64),
        files: None,
        private: None,
    }
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// S1 — single-piece single-peer happy path: the peer sends Bitfield,
/// Unchoke, then the full piece in one `Piece` message; the engine must
/// validate it, write it to disk intact, and report it complete.
#[tokio::test]
async fn s1_single_piece_single_peer_happy_path() {
    let dataset = b"Hello, world!!!\n".to_vec();
    let expected_hash = sha1_of(&dataset);
    assert_eq!(hex::encode_upper(expected_hash), "5DD39CAB1C53C2C77CD352983F9641E1D9A6D6C5");

    let dir = tempdir();
    let info = single_file_info("s1.bin", &dataset, 16, &[expected_hash]);
    let metainfo_bytes = encode_metainfo(&info);

    let mut engine = Engine::new(Conf::new(dir.path())).expect("engine starts");
    let id = engine
        .add_torrent(&metainfo_bytes)
        .await
        .expect("torrent added");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock peer");
    let addr = listener.local_addr().unwrap();
    let info_hash = info_hash_of(&info);

    let peer_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        exchange_handshake(&mut stream, info_hash, [7u8; 20]).await;
        let _ = skip_message(&mut stream).await; // engine's own (all-zero) bitfield
        send_bitfield(&mut stream, &[0x80]).await;
        send_unchoke(&mut stream).await;

        let request = expect_message(&mut stream, 6).await;
        assert_eq!(&request[0..4], &0u32.to_be_bytes());
        assert_eq!(&request[4..8], &0u32.to_be_bytes());
        assert_eq!(&request[8..12], &16u32.to_be_bytes());

        let mut payload = Vec::with_capacity(8 + 16);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(b"Hello, world!!!\n");
        send_message(&mut stream, 7, &payload).await;
        stream
    });

    engine.connect_peer(id, addr).expect("connect_peer queues outbound dial");

    let stats = wait_for_completion(&engine, id, 1).await;
    assert_eq!(stats.completed_pieces, 1);
    assert_eq!(stats.total_pieces, 1);

    peer_task.await.expect("mock peer task panicked");

    let on_disk = std::fs::read(dir.path().join("s1.bin")).expect("downloaded file exists");
    assert_eq!(on_disk, dataset);
}

/// S2 — hash mismatch: the peer first sends a corrupted last byte, which
/// must fail validation and reset the piece's progress instead of being
/// accepted; the same peer then supplies the correct bytes and the piece
/// completes on the second try.
#[tokio::test]
async fn s2_hash_mismatch_drops_progress_and_is_re_requestable() {
    let dataset = b"Hello, world!!!\n".to_vec();
    let corrupted = b"Hello, world!!!X".to_vec();
    let expected_hash = sha1_of(&dataset);

    let dir = tempdir();
    let info = single_file_info("s2.bin", &dataset, 16, &[expected_hash]);
    let metainfo_bytes = encode_metainfo(&info);
    let info_hash = info_hash_of(&info);

    let mut engine = Engine::new(Conf::new(dir.path())).expect("engine starts");
    let id = engine
        .add_torrent(&metainfo_bytes)
        .await
        .expect("torrent added");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock peer");
    let addr = listener.local_addr().unwrap();

    let peer_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        exchange_handshake(&mut stream, info_hash, [9u8; 20]).await;
        let _ = skip_message(&mut stream).await;
        send_bitfield(&mut stream, &[0x80]).await;
        send_unchoke(&mut stream).await;

        // first attempt: wrong bytes, must fail validation.
        let _req = expect_message(&mut stream, 6).await;
        let mut bad_payload = Vec::with_capacity(8 + corrupted.len());
        bad_payload.extend_from_slice(&0u32.to_be_bytes());
        bad_payload.extend_from_slice(&0u32.to_be_bytes());
        bad_payload.extend_from_slice(&corrupted);
        send_message(&mut stream, 7, &bad_payload).await;

        // the piece's progress was dropped, so the block is requested
        // again; this time answer with the correct bytes.
        let _req = expect_message(&mut stream, 6).await;
        let mut good_payload = Vec::with_capacity(8 + dataset.len());
        good_payload.extend_from_slice(&0u32.to_be_bytes());
        good_payload.extend_from_slice(&0u32.to_be_bytes());
        good_payload.extend_from_slice(&dataset);
        send_message(&mut stream, 7, &good_payload).await;
        stream
    });

    engine.connect_peer(id, addr).expect("connect_peer queues outbound dial");

    let stats = wait_for_completion(&engine, id, 1).await;
    assert_eq!(stats.completed_pieces, 1, "piece must complete once correct bytes arrive");

    peer_task.await.expect("mock peer task panicked");

    let on_disk = std::fs::read(dir.path().join("s2.bin")).expect("downloaded file exists");
    assert_eq!(on_disk, dataset, "final on-disk bytes must be the valid ones, not the corrupted ones");
}

/// S5 — multi-file piece boundary: two files of length 10 and 22 with piece
/// length 16 (N=2); piece 1 is entirely within file1 at offset 6, so block
/// (1, 0, 16) must land exactly at file1's bytes 6..22.
#[tokio::test]
async fn s5_multi_file_piece_boundary() {
    let file0_data = vec![0xAAu8; 10];
    let file1_data: Vec<u8> = (0..22).map(|i| i as u8).collect();
    let mut whole = file0_data.clone();
    whole.extend_from_slice(&file1_data);
    assert_eq!(whole.len(), 32);

    let piece0 = whole[0..16].to_vec();
    let piece1 = whole[16..32].to_vec();
    let hash0 = sha1_of(&piece0);
    let hash1 = sha1_of(&piece1);

    let dir = tempdir();
    let info = Info {
        name: "s5".to_string(),
        pieces: [hash0, hash1].concat(),
        piece_length: 16,
        length: None,
        files: Some(vec![
            MetaFile { path: vec!["file0.bin".to_string()], length: 10 },
            MetaFile { path: vec!["file1.bin".to_string()], length: 22 },
        ]),
        private: None,
    };
    let metainfo_bytes = encode_metainfo(&info);
    let info_hash = info_hash_of(&info);

    let mut engine = Engine::new(Conf::new(dir.path())).expect("engine starts");
    let id = engine
        .add_torrent(&metainfo_bytes)
        .await
        .expect("torrent added");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock peer");
    let addr = listener.local_addr().unwrap();

    let peer_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        exchange_handshake(&mut stream, info_hash, [3u8; 20]).await;
        let _ = skip_message(&mut stream).await;
        // own both pieces (N=2): bitfield is one byte, top two bits set.
        send_bitfield(&mut stream, &[0xC0]).await;
        send_unchoke(&mut stream).await;

        for _ in 0..2 {
            let req = expect_message(&mut stream, 6).await;
            let piece_index = u32::from_be_bytes([req[0], req[1], req[2], req[3]]);
            let data = if piece_index == 0 { &piece0 } else { &piece1 };
            let mut payload = Vec::with_capacity(8 + data.len());
            payload.extend_from_slice(&piece_index.to_be_bytes());
            payload.extend_from_slice(&0u32.to_be_bytes());
            payload.extend_from_slice(data);
            send_message(&mut stream, 7, &payload).await;
        }
        stream
    });

    engine.connect_peer(id, addr).expect("connect_peer queues outbound dial");

    let stats = wait_for_completion(&engine, id, 2).await;
    assert_eq!(stats.completed_pieces, 2);

    peer_task.await.expect("mock peer task panicked");

    let torrent_dir = dir.path().join("s5");
    let on_disk_file1 = std::fs::read(torrent_dir.join("file1.bin")).expect("file1 exists");
    assert_eq!(on_disk_file1, file1_data);
    // block (1, 0, 16) is exactly file1's bytes 6..22.
    assert_eq!(&on_disk_file1[6..22], &piece1[..]);
}

fn info_hash_of(info: &Info) -> [u8; 20] {
    let info_bytes = serde_bencode::to_bytes(info).expect("info dict encodes");
    sha1_of(&info_bytes)
}

/// Polls `Engine::stats` until `completed_pieces` reaches `want`, or panics
/// after a generous timeout — there's no push-based completion signal on
/// the public API, so this mirrors how a CLI front-end would poll it.
async fn wait_for_completion(
    engine: &Engine,
    id: torrent_engine::TorrentId,
    want: usize,
) -> torrent_engine::Stats {
    timeout(TEST_TIMEOUT, async {
        loop {
            let stats = engine.stats(id).await.expect("torrent id still valid");
            if stats.completed_pieces >= want {
                return stats;
            }
            tokio::time::delay_for(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("torrent did not complete before the test timeout")
}

fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp download dir")
}
