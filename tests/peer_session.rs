//! End-to-end test driving a real `tokio::net::TcpListener` fixture peer
//! against [`bt_peer_engine::peer::session::run`]: the single-file,
//! single-peer, four-piece scenario from spec.md §8 scenario 1, plus the
//! BITFIELD-first protocol check from §4.5/§9.

use std::sync::Arc;
use std::time::Duration;

use bt_peer_engine::conf::SessionConf;
use bt_peer_engine::error::Error;
use bt_peer_engine::inventory::PieceInventory;
use bt_peer_engine::metainfo::{Info, Metainfo};
use bt_peer_engine::peer::session::{generate_peer_id, run};
use bt_peer_engine::piece_store::PieceStore;
use bt_peer_engine::storage_info::StorageInfo;
use bt_peer_engine::wire::{decode_handshake, encode_handshake, HandshakeCodec, Message, MessageCodec};
use bt_peer_engine::{Bitfield, PeerId, Sha1Hash};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, FramedParts};

fn piece_hash(data: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(data);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}

fn build_metainfo(piece_len: u32, pieces: &[Vec<u8>]) -> Metainfo {
    let total_len: u64 = pieces.iter().map(|p| p.len() as u64).sum();
    let hashes: Vec<u8> = pieces.iter().flat_map(|p| piece_hash(p).to_vec()).collect();
    Metainfo {
        info: Info {
            name: "file.bin".to_string(),
            pieces: hashes,
            piece_length: piece_len,
            length: Some(total_len),
            files: None,
            private: None,
        },
    }
}

/// A minimal fixture peer: accepts one connection, completes the handshake,
/// announces it has every piece, unchokes immediately, and serves whatever
/// blocks it's asked for from `pieces`.
async fn run_fixture_seeder(listener: TcpListener, info_hash: Sha1Hash, peer_id: PeerId, pieces: Vec<Vec<u8>>) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut handshake_framed = Framed::new(socket, HandshakeCodec);
    let buf = handshake_framed.next().await.unwrap().unwrap();
    decode_handshake(&buf, &info_hash).unwrap();
    handshake_framed.send(encode_handshake(&info_hash, &peer_id)).await.unwrap();

    let old_parts = handshake_framed.into_parts();
    let piece_count = pieces.len();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec::new(128, piece_count));
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut framed = Framed::from_parts(new_parts);

    framed.send(Message::Bitfield(Bitfield::repeat(true, piece_count))).await.unwrap();
    framed.send(Message::Unchoke).await.unwrap();

    let mut served = 0;
    while served < piece_count {
        match framed.next().await {
            Some(Ok(Message::Request(req))) => {
                let data = pieces[req.piece_index][req.offset as usize..(req.offset + req.len) as usize].to_vec();
                framed
                    .send(Message::Piece { piece_index: req.piece_index, offset: req.offset, data })
                    .await
                    .unwrap();
                served += 1;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
}

#[tokio::test]
async fn downloads_a_small_single_file_torrent_from_one_peer() {
    let pieces = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10, 11, 12], vec![13, 14]];
    let metainfo = build_metainfo(4, &pieces);
    let info_hash = metainfo.info_hash().unwrap();
    let piece_count = metainfo.piece_count();

    let dir = tempfile::tempdir().unwrap();
    let storage = StorageInfo::new(&metainfo, dir.path().join("downloads"));
    let store = Arc::new(PieceStore::new(storage, dir.path().join("pieces")).unwrap());
    let inventory = Arc::new(PieceInventory::new(piece_count, Bitfield::repeat(false, piece_count)));
    let piece_hashes = Arc::new(metainfo.piece_hashes());

    let expected_pieces = pieces.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fixture_peer_id = generate_peer_id();
    let fixture = tokio::spawn(run_fixture_seeder(listener, info_hash, fixture_peer_id, pieces));

    let conf = SessionConf { read_idle_timeout: Duration::from_millis(500), ..SessionConf::default() };
    let result = run(
        addr,
        info_hash,
        generate_peer_id(),
        piece_count,
        piece_hashes,
        conf,
        3,
        Arc::clone(&inventory),
        Arc::clone(&store),
        None,
    )
    .await;

    assert!(result.is_ok(), "session should finish cleanly, got {result:?}");
    assert_eq!(inventory.completed_count(), piece_count);
    assert!(inventory.is_done(piece_count));

    // every piece lands on disk with exactly the bytes the fixture served.
    for (index, expected) in expected_pieces.into_iter().enumerate() {
        let on_disk = store.load(index).unwrap().unwrap();
        assert_eq!(on_disk, expected);
    }

    tokio::time::timeout(Duration::from_secs(1), fixture).await.unwrap().unwrap();
}

#[tokio::test]
async fn closes_the_session_if_a_typed_message_precedes_the_bitfield() {
    let pieces = vec![vec![1, 2, 3, 4]];
    let metainfo = build_metainfo(4, &pieces);
    let info_hash = metainfo.info_hash().unwrap();
    let piece_count = metainfo.piece_count();

    let dir = tempfile::tempdir().unwrap();
    let storage = StorageInfo::new(&metainfo, dir.path().join("downloads"));
    let store = Arc::new(PieceStore::new(storage, dir.path().join("pieces")).unwrap());
    let inventory = Arc::new(PieceInventory::new(piece_count, Bitfield::repeat(false, piece_count)));
    let piece_hashes = Arc::new(metainfo.piece_hashes());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fixture_peer_id = generate_peer_id();
    let fixture = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut handshake_framed = Framed::new(socket, HandshakeCodec);
        let buf = handshake_framed.next().await.unwrap().unwrap();
        decode_handshake(&buf, &info_hash).unwrap();
        handshake_framed.send(encode_handshake(&info_hash, &fixture_peer_id)).await.unwrap();

        let old_parts = handshake_framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, MessageCodec::new(128, piece_count));
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut framed = Framed::from_parts(new_parts);
        // sends UNCHOKE before BITFIELD, which the core must reject.
        framed.send(Message::Unchoke).await.unwrap();
    });

    let conf = SessionConf { read_idle_timeout: Duration::from_millis(500), ..SessionConf::default() };
    let result = run(
        addr,
        info_hash,
        generate_peer_id(),
        piece_count,
        piece_hashes,
        conf,
        3,
        inventory,
        store,
        None,
    )
    .await;

    assert!(matches!(result, Err(Error::BitfieldNotFirst)), "got {result:?}");
    tokio::time::timeout(Duration::from_secs(1), fixture).await.unwrap().unwrap();
}
