use super::*;
use crate::peer::{Bitfield, Handshake, Message, PeerTransport};
use crate::storage::MemoryStorage;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::DuplexStream;

const INFO_HASH: [u8; 20] = [0x42; 20];
const PIECE_LEN: u64 = 32768;
const PIECE_COUNT: usize = 10;
const CONTENT_LEN: usize = PIECE_COUNT * PIECE_LEN as usize - 300;

fn content() -> Vec<u8> {
    (0..CONTENT_LEN).map(|i| (i * 31 % 241) as u8).collect()
}

fn metainfo_for(data: &[u8]) -> Metainfo {
    let hashes = data
        .chunks(PIECE_LEN as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(Sha1::digest(chunk).as_slice());
            hash
        })
        .collect();
    Metainfo::new(
        INFO_HASH,
        "content",
        PIECE_LEN,
        hashes,
        vec![
            (PathBuf::from("content/first.bin"), 100_000),
            (PathBuf::from("content/second.bin"), data.len() as u64 - 100_000),
        ],
    )
    .unwrap()
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, 2], port))
}

/// A remote peer holding the full content. It announces everything,
/// unchokes immediately and answers every request. Returns the messages it
/// received once the connection closes.
async fn run_seeder(stream: DuplexStream, id: PeerId, data: Arc<Vec<u8>>) -> Vec<Message> {
    let mut transport = PeerTransport::new(stream);
    transport
        .respond(&Handshake::new(INFO_HASH, id), Duration::from_secs(5))
        .await
        .unwrap();
    let (mut reader, mut writer) = transport.into_split();

    writer
        .send_message(&Message::Bitfield(Bitfield::full(PIECE_COUNT).to_bytes()))
        .await
        .unwrap();
    writer.send_message(&Message::Unchoke).await.unwrap();

    let mut received = Vec::new();
    while let Ok(message) = reader.receive_message().await {
        if let Message::Request {
            index,
            begin,
            length,
        } = message
        {
            let start = index as usize * PIECE_LEN as usize + begin as usize;
            let block = Bytes::copy_from_slice(&data[start..start + length as usize]);
            let reply = Message::Piece {
                index,
                begin,
                data: block,
            };
            if writer.send_message(&reply).await.is_err() {
                break;
            }
        }
        received.push(message);
    }
    received
}

async fn wait_for_completion(events: &mut mpsc::UnboundedReceiver<TorrentEvent>) -> Vec<u32> {
    let mut completed = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("download stalled")
            .expect("event channel closed");
        match event {
            TorrentEvent::PieceCompleted(piece) => completed.push(piece),
            TorrentEvent::DownloadComplete => return completed,
            TorrentEvent::StorageFailure(e) => panic!("storage failure: {}", e),
        }
    }
}

fn requests(messages: &[Message]) -> Vec<(u32, u32, u32)> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Request {
                index,
                begin,
                length,
            } => Some((*index, *begin, *length)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_downloads_everything_from_one_seeder() {
    let data = Arc::new(content());
    let storage = Arc::new(MemoryStorage::new(data.len() as u64));
    let (torrent, mut events) = Torrent::new(
        metainfo_for(&data),
        storage.clone(),
        PeerId::generate(),
        SessionConfig::default().with_selection_seed(5),
    );

    assert_eq!(torrent.start().await.unwrap(), 0);
    assert_eq!(torrent.status(), TorrentStatus::Downloading);

    let seeder_id = PeerId::generate();
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let seeder = tokio::spawn(run_seeder(remote, seeder_id, data.clone()));

    let session = torrent
        .attach(local, addr(6881), ConnectionRole::Outbound(Some(seeder_id)))
        .await
        .unwrap()
        .expect("session bound");
    assert_eq!(session.peer_id(), seeder_id);

    let mut completed = wait_for_completion(&mut events).await;
    completed.sort_unstable();
    assert_eq!(completed, (0..PIECE_COUNT as u32).collect::<Vec<_>>());

    assert!(torrent.is_complete());
    assert_eq!(torrent.status(), TorrentStatus::Seeding);
    assert!(storage.is_complete());
    assert_eq!(storage.contents(), *data);

    let stats = torrent.stats();
    assert_eq!(stats.downloaded, CONTENT_LEN as u64);
    assert_eq!(stats.left, 0);
    assert_eq!(stats.uploaded, 0);

    torrent.shutdown().await.unwrap();
    let received = seeder.await.unwrap();

    assert_eq!(received.first(), Some(&Message::Interested));
    let mut asked = requests(&received);
    let total = asked.len();
    asked.sort_unstable();
    asked.dedup();
    assert_eq!(asked.len(), total, "a block was requested twice");
    assert_eq!(total, 2 * PIECE_COUNT);
    assert_eq!(
        asked.last(),
        Some(&(PIECE_COUNT as u32 - 1, 16384, 16384 - 300))
    );

    let after_interest = received
        .iter()
        .position(|m| *m == Message::NotInterested)
        .expect("interest withdrawn once complete");
    assert!(requests(&received[after_interest..]).is_empty());
}

#[tokio::test]
async fn test_downloads_from_two_seeders() {
    let data = Arc::new(content());
    let storage = Arc::new(MemoryStorage::new(data.len() as u64));
    let (torrent, mut events) = Torrent::new(
        metainfo_for(&data),
        storage.clone(),
        PeerId::generate(),
        SessionConfig::default(),
    );
    torrent.start().await.unwrap();

    let mut seeders = Vec::new();
    for port in [7001, 7002] {
        let id = PeerId::generate();
        let (local, remote) = tokio::io::duplex(256 * 1024);
        seeders.push(tokio::spawn(run_seeder(remote, id, data.clone())));
        torrent
            .attach(local, addr(port), ConnectionRole::Outbound(Some(id)))
            .await
            .unwrap()
            .expect("session bound");
    }
    assert_eq!(torrent.manager().connected_count(), 2);

    let completed = wait_for_completion(&mut events).await;
    assert_eq!(completed.len(), PIECE_COUNT);
    assert_eq!(storage.contents(), *data);
    assert_eq!(torrent.repository().in_flight_count(), 0);

    torrent.shutdown().await.unwrap();
    let mut asked = 0;
    for seeder in seeders {
        asked += requests(&seeder.await.unwrap()).len();
    }
    assert!(asked >= 2 * PIECE_COUNT);
}

#[tokio::test]
async fn test_start_resumes_from_existing_data() {
    let data = content();
    let storage = Arc::new(MemoryStorage::with_data(data.clone()));
    let (torrent, _events) = Torrent::new(
        metainfo_for(&data),
        storage.clone(),
        PeerId::generate(),
        SessionConfig::default(),
    );

    assert_eq!(torrent.start().await.unwrap(), PIECE_COUNT);
    assert_eq!(torrent.status(), TorrentStatus::Seeding);
    assert!(storage.is_complete());

    let stats = torrent.stats();
    assert_eq!(stats.left, 0);
    assert_eq!(stats.downloaded, 0);
    torrent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_skips_damaged_pieces() {
    let data = content();
    let mut stored = data.clone();
    stored[3 * PIECE_LEN as usize] ^= 0x01;
    stored[7 * PIECE_LEN as usize + 10] ^= 0x01;

    let storage = Arc::new(MemoryStorage::with_data(stored));
    let (torrent, _events) = Torrent::new(
        metainfo_for(&data),
        storage.clone(),
        PeerId::generate(),
        SessionConfig::default(),
    );

    assert_eq!(torrent.start().await.unwrap(), PIECE_COUNT - 2);
    assert_eq!(torrent.status(), TorrentStatus::Downloading);
    assert!(!torrent.repository().is_piece_complete(3));
    assert!(!torrent.repository().is_piece_complete(7));
    assert_eq!(torrent.stats().left, 2 * PIECE_LEN);
    assert!(!storage.is_complete());
}

#[tokio::test]
async fn test_rejects_peer_for_other_torrent() {
    let data = content();
    let (torrent, _events) = Torrent::new(
        metainfo_for(&data),
        Arc::new(MemoryStorage::new(data.len() as u64)),
        PeerId::generate(),
        SessionConfig::default(),
    );

    let (local, remote) = tokio::io::duplex(1024);
    let stranger = tokio::spawn(async move {
        let mut transport = PeerTransport::new(remote);
        transport
            .initiate(
                &Handshake::new([0u8; 20], PeerId::generate()),
                None,
                Duration::from_secs(5),
            )
            .await
    });

    let result = torrent.attach(local, addr(1), ConnectionRole::Inbound).await;
    assert!(matches!(result, Err(PeerError::Handshake(_))));
    assert!(stranger.await.unwrap().is_err());
    assert_eq!(torrent.manager().connected_count(), 0);
}
