// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

//! End-to-end tests: a tower thread per test on a private socket path, with
//! Reader/Writer endpoints doing real handshakes and shared memory traffic.

use fastipc::wire::MIN_REQUEST_SIZE;
use fastipc::{FastIpcError, Reader, Tower, Writer};

use nix::sys::socket::{
    connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ── Tower fixture ───────────────────────────────────────────────────────────

/// Runs a tower on its own socket path for the duration of a test.
struct TowerGuard {
    tower: Arc<Tower>,
    thread: Option<thread::JoinHandle<fastipc::Result<()>>>,
    path: String,
}

impl TowerGuard {
    fn start(tag: &str) -> Self {
        let path = format!("/tmp/fastipc_{}_{}", tag, std::process::id());
        let tower = Arc::new(Tower::create(&path).expect("failed to create tower"));
        let thread = {
            let tower = Arc::clone(&tower);
            Some(thread::spawn(move || tower.run()))
        };
        Self {
            tower,
            thread,
            path,
        }
    }

    fn socket(&self) -> &str {
        &self.path
    }
}

impl Drop for TowerGuard {
    fn drop(&mut self) {
        let _ = self.tower.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

// ── Handshake and data path ─────────────────────────────────────────────────

#[test]
fn single_writer_single_reader_one_sample() {
    let tower = TowerGuard::start("hello");

    let writer = Writer::connect(tower.socket(), "hello", 4).unwrap();
    let reader = Reader::connect(tower.socket(), "hello", 4).unwrap();

    {
        let sample = reader.acquire();
        assert_eq!(sample.sequence_id(), 0);
        reader.release(sample);
    }
    assert!(!reader.has_new_data(0));

    {
        let mut sample = writer.prepare();
        assert_eq!(sample.sequence_id(), 1);
        sample.payload_mut()[..4].copy_from_slice(&5i32.to_ne_bytes());
        sample.set_payload_len(4);
        writer.submit(sample);
    }
    assert!(reader.has_new_data(0));

    {
        let sample = reader.acquire();
        assert_eq!(sample.sequence_id(), 1);
        assert_eq!(sample.payload_len(), 4);
        assert_eq!(sample.payload()[..4], 5i32.to_ne_bytes());
        assert!(sample.timestamp_ns() > 0);
        reader.release(sample);
    }
    assert!(!reader.has_new_data(1));
}

#[test]
fn reader_only_sees_the_newest_sample() {
    let tower = TowerGuard::start("overwrite");

    let writer = Writer::connect(tower.socket(), "ticks", 1).unwrap();
    let reader = Reader::connect(tower.socket(), "ticks", 1).unwrap();

    for byte in [0x10u8, 0x20, 0x30] {
        let mut sample = writer.prepare();
        sample.payload_mut()[0] = byte;
        sample.set_payload_len(1);
        writer.submit(sample);
    }

    let sample = reader.acquire();
    assert_eq!(sample.sequence_id(), 3);
    assert_eq!(sample.payload()[0], 0x30);
    reader.release(sample);
}

#[test]
fn second_client_with_other_payload_size_is_refused() {
    let tower = TowerGuard::start("mismatch");

    let _writer = Writer::connect(tower.socket(), "t", 64).unwrap();
    let err = Reader::connect(tower.socket(), "t", 128).unwrap_err();

    match err {
        FastIpcError::PayloadSizeMismatch {
            channel,
            channel_size,
            requested,
        } => {
            assert_eq!(channel, "t");
            assert_eq!(channel_size, 64);
            assert_eq!(requested, 128);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The original size keeps working.
    let _reader = Reader::connect(tower.socket(), "t", 64).unwrap();
}

#[test]
fn empty_topic_name_is_a_valid_channel() {
    let tower = TowerGuard::start("empty");

    // Reader first: the first connector creates the channel either way.
    let reader = Reader::connect(tower.socket(), "", 8).unwrap();
    let writer = Writer::connect(tower.socket(), "", 8).unwrap();

    {
        let sample = reader.acquire();
        assert_eq!(sample.sequence_id(), 0);
        reader.release(sample);
    }

    let mut sample = writer.prepare();
    sample.payload_mut().copy_from_slice(&7u64.to_ne_bytes());
    sample.set_payload_len(8);
    writer.submit(sample);

    let sample = reader.acquire();
    assert_eq!(sample.payload(), 7u64.to_ne_bytes());
    reader.release(sample);
}

#[test]
fn all_endpoints_of_a_topic_share_one_channel() {
    let tower = TowerGuard::start("shared");

    let writer = Writer::connect(tower.socket(), "state", 8).unwrap();
    let first = Reader::connect(tower.socket(), "state", 8).unwrap();
    let second = Reader::connect(tower.socket(), "state", 8).unwrap();

    let mut sample = writer.prepare();
    sample.payload_mut().copy_from_slice(&42u64.to_ne_bytes());
    sample.set_payload_len(8);
    writer.submit(sample);

    for reader in [&first, &second] {
        let sample = reader.acquire();
        assert_eq!(sample.sequence_id(), 1);
        assert_eq!(sample.payload(), 42u64.to_ne_bytes());
        reader.release(sample);
    }
}

#[test]
fn abandoned_write_samples_do_not_leak_slots() {
    let tower = TowerGuard::start("abandon");

    let writer = Writer::connect(tower.socket(), "drops", 4).unwrap();
    let reader = Reader::connect(tower.socket(), "drops", 4).unwrap();

    // Far more abandoned reservations than slots exist.
    for _ in 0..200 {
        let sample = writer.prepare();
        drop(sample);
    }

    let mut sample = writer.prepare();
    assert_eq!(sample.sequence_id(), 201);
    sample.payload_mut()[0] = 0xaa;
    sample.set_payload_len(1);
    writer.submit(sample);

    let sample = reader.acquire();
    assert_eq!(sample.sequence_id(), 201);
    assert_eq!(sample.payload()[0], 0xaa);
    reader.release(sample);
}

// ── Concurrency scenarios ───────────────────────────────────────────────────

#[test]
fn racing_writer_endpoints_publish_distinct_ids() {
    const SUBMITS_PER_WRITER: usize = 10_000;

    let tower = TowerGuard::start("racing");

    let first = Writer::connect(tower.socket(), "race", 8).unwrap();
    let second = Writer::connect(tower.socket(), "race", 8).unwrap();
    let reader = Reader::connect(tower.socket(), "race", 8).unwrap();

    let all_ids: Vec<Vec<u64>> = thread::scope(|s| {
        let handles = [&first, &second].map(|writer| {
            s.spawn(move || {
                let mut ids = Vec::with_capacity(SUBMITS_PER_WRITER);
                for _ in 0..SUBMITS_PER_WRITER {
                    let sample = writer.prepare();
                    ids.push(sample.sequence_id());
                    writer.submit(sample);
                }
                ids
            })
        });
        handles.map(|h| h.join().unwrap()).into_iter().collect()
    });

    let mut union = HashSet::new();
    for ids in &all_ids {
        union.extend(ids.iter().copied());
    }
    assert_eq!(union.len(), 2 * SUBMITS_PER_WRITER);

    let sample = reader.acquire();
    assert!(union.contains(&sample.sequence_id()));
    reader.release(sample);
}

#[test]
fn reader_keeps_up_with_a_churning_writer() {
    const SUBMITS: u64 = 5_000;

    let tower = TowerGuard::start("churn");

    let writer = Writer::connect(tower.socket(), "churn", 8).unwrap();
    let reader = Reader::connect(tower.socket(), "churn", 8).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..SUBMITS {
                let sample = writer.prepare();
                writer.submit(sample);
            }
        });

        let deadline = Instant::now() + Duration::from_secs(30);
        let mut last = 0u64;
        while last < SUBMITS {
            if reader.has_new_data(last) {
                let sample = reader.acquire();
                let id = sample.sequence_id();
                reader.release(sample);

                assert!(id >= last, "sequence went backwards: {last} -> {id}");
                last = id;
            }
            assert!(Instant::now() < deadline, "reader never caught up");
        }
        assert_eq!(last, SUBMITS);
    });
}

// ── Broker robustness ───────────────────────────────────────────────────────

/// Sends raw bytes as a handshake packet and returns how many reply bytes
/// came back (zero means the broker closed the connection without replying).
fn raw_handshake(broker_socket: &str, packet: &[u8]) -> usize {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .unwrap();
    let addr = UnixAddr::new(broker_socket).unwrap();
    connect(fd.as_raw_fd(), &addr).unwrap();
    send(fd.as_raw_fd(), packet, MsgFlags::empty()).unwrap();

    let mut buf = [0u8; 64];
    recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap()
}

#[test]
fn malformed_requests_only_cost_their_connection() {
    let tower = TowerGuard::start("malformed");

    // Short packet.
    assert_eq!(raw_handshake(tower.socket(), &[1u8; 3]), 0);

    // Unknown requester type.
    let mut bad_type = vec![7u8];
    bad_type.extend_from_slice(&8usize.to_ne_bytes());
    bad_type.push(0);
    assert_eq!(raw_handshake(tower.socket(), &bad_type), 0);

    // Topic name length pointing past the packet.
    let mut bad_len = vec![0u8];
    bad_len.extend_from_slice(&8usize.to_ne_bytes());
    bad_len.push(200);
    bad_len.extend_from_slice(b"short");
    assert_eq!(raw_handshake(tower.socket(), &bad_len), 0);

    // Topic name that is not UTF-8.
    let mut bad_name = vec![0u8];
    bad_name.extend_from_slice(&8usize.to_ne_bytes());
    bad_name.push(2);
    bad_name.extend_from_slice(&[0xff, 0xfe]);
    assert_eq!(raw_handshake(tower.socket(), &bad_name), 0);
    assert_eq!(bad_name.len(), MIN_REQUEST_SIZE + 2);

    // The broker is still serving.
    let writer = Writer::connect(tower.socket(), "still-alive", 4).unwrap();
    let sample = writer.prepare();
    assert_eq!(sample.sequence_id(), 1);
    writer.submit(sample);
}

#[test]
fn segment_creation_failure_ends_the_tower() {
    let path = format!("/tmp/fastipc_fatal_{}", std::process::id());
    let tower = Arc::new(Tower::create(&path).unwrap());

    let thread = {
        let tower = Arc::clone(&tower);
        thread::spawn(move || tower.run())
    };

    // A payload size no address space can map: the segment cannot be
    // created, the client gets no reply, and the broker stops rather than
    // limping on with a half-built topic table.
    let err = Writer::connect(&path, "huge", 1usize << 45).unwrap_err();
    assert!(matches!(err, FastIpcError::Internal(_)), "got {err}");

    let result = thread.join().unwrap();
    assert!(result.is_err(), "run survived a segment creation failure");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn shutdown_unblocks_a_running_tower() {
    let path = format!("/tmp/fastipc_shutdown_{}", std::process::id());
    let tower = Arc::new(Tower::create(&path).unwrap());

    let thread = {
        let tower = Arc::clone(&tower);
        thread::spawn(move || tower.run())
    };

    // Serve one real handshake, then stop.
    let _writer = Writer::connect(&path, "bye", 4).unwrap();
    tower.shutdown().unwrap();

    let result = thread.join().unwrap();
    assert!(result.is_ok(), "run returned {result:?}");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn stale_socket_files_are_replaced_on_create() {
    let path = format!("/tmp/fastipc_stale_{}", std::process::id());

    let first = Tower::create(&path).unwrap();
    drop(first);

    // The socket file is still on disk; create must take the path over.
    let second = Tower::create(&path).unwrap();
    drop(second);
    let _ = std::fs::remove_file(&path);
}
