//! Framed, checksummed event log.
//!
//! Each component persists its state as a sequence of events. Every event is
//! written as one frame:
//!
//! ```text
//! magic "TLOG" (4) | version (2) | kind (1) | length (4) | CBOR payload | crc32 (4)
//! ```
//!
//! The CRC covers header and payload. A frame cut short at the end of the log
//! is a torn write from a crash: replay stops there and the tail is dropped.
//! A bad magic or checksum anywhere is corruption and fails the replay.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use tether_storage::StorageBackend;
use tracing::warn;

/// Magic bytes opening every frame.
pub const LOG_MAGIC: [u8; 4] = *b"TLOG";

/// Current frame format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Logs with fewer frames than this are never worth compacting.
const COMPACT_MIN_FRAMES: usize = 256;

/// Frames allowed per live item before a log counts as bloated.
const COMPACT_RATIO: usize = 4;

/// Which component a log belongs to.
///
/// Stored in every frame so a log opened by the wrong component is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    /// Local record store.
    Records = 1,
    /// Sync queue.
    Queue = 2,
    /// Pending conflicts.
    Conflicts = 3,
}

impl LogKind {
    /// Converts a byte to a log kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Records),
            2 => Some(Self::Queue),
            3 => Some(Self::Conflicts),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// An append-only log of serializable events over a storage backend.
pub struct EventLog<E> {
    backend: Mutex<Box<dyn StorageBackend>>,
    kind: LogKind,
    frames: AtomicUsize,
    _events: PhantomData<fn() -> E>,
}

impl<E> EventLog<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Wraps a backend. Every append is flushed before it returns.
    pub fn new(backend: Box<dyn StorageBackend>, kind: LogKind) -> Self {
        Self {
            backend: Mutex::new(backend),
            kind,
            frames: AtomicUsize::new(0),
            _events: PhantomData,
        }
    }

    /// The component this log belongs to.
    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Reads every event in order.
    ///
    /// A torn frame at the tail is discarded and the log is rewritten without
    /// it, so later appends start on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption, a checksum mismatch or an I/O failure.
    pub fn replay(&self) -> CoreResult<Vec<E>> {
        let mut backend = self.backend.lock();
        let size = backend.size()?;
        let bytes = backend.read_at(0, size as usize)?;

        let (events, valid_len) = decode_frames(self.kind, &bytes)?;
        if valid_len < bytes.len() {
            warn!(
                kind = ?self.kind,
                dropped = bytes.len() - valid_len,
                "discarding torn frame at end of log"
            );
            backend.rewrite(&bytes[..valid_len])?;
        }

        self.frames.store(events.len(), Ordering::SeqCst);
        Ok(events)
    }

    /// Appends one event and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns `StorageFull` if the backend is out of space; the log is left
    /// unchanged in that case.
    pub fn append(&self, event: &E) -> CoreResult<u64> {
        let frame = encode_frame(self.kind, event)?;
        let mut backend = self.backend.lock();
        let offset = backend.append(&frame)?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        backend.flush()?;
        Ok(offset)
    }

    /// Appends several events with a single backend write.
    pub fn append_all(&self, events: &[E]) -> CoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut data = Vec::new();
        for event in events {
            data.extend_from_slice(&encode_frame(self.kind, event)?);
        }
        let mut backend = self.backend.lock();
        backend.append(&data)?;
        self.frames.fetch_add(events.len(), Ordering::SeqCst);
        backend.flush()?;
        Ok(())
    }

    /// Replaces the whole log with `events`.
    pub fn rewrite<'a, I>(&self, events: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = &'a E>,
        E: 'a,
    {
        let mut data = Vec::new();
        let mut count = 0;
        for event in events {
            data.extend_from_slice(&encode_frame(self.kind, event)?);
            count += 1;
        }
        let mut backend = self.backend.lock();
        backend.rewrite(&data)?;
        self.frames.store(count, Ordering::SeqCst);
        backend.sync()?;
        Ok(())
    }

    /// Frames currently in the log.
    pub fn frame_count(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Returns true if the log has grown well past the `live` items it
    /// describes and should be rewritten.
    pub fn is_bloated(&self, live: usize) -> bool {
        let frames = self.frame_count();
        frames >= COMPACT_MIN_FRAMES && frames > live.saturating_mul(COMPACT_RATIO)
    }

    /// Current size of the log in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}

fn encode_frame<E: Serialize>(kind: LogKind, event: &E) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(event, &mut payload).map_err(|e| CoreError::Encode(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::Encode("event larger than 4 GiB".into()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&LOG_MAGIC);
    frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
    frame.push(kind.as_byte());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decodes frames, returning the events and the length of the valid prefix.
fn decode_frames<E: DeserializeOwned>(kind: LogKind, bytes: &[u8]) -> CoreResult<(Vec<E>, usize)> {
    let mut events = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        if bytes.len() - pos < HEADER_SIZE {
            break;
        }
        let header = &bytes[pos..pos + HEADER_SIZE];

        if header[0..4] != LOG_MAGIC {
            return Err(CoreError::LogCorruption {
                offset,
                message: "invalid magic".into(),
            });
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::LogCorruption {
                offset,
                message: format!("unsupported version {version}"),
            });
        }

        if LogKind::from_byte(header[6]) != Some(kind) {
            return Err(CoreError::LogCorruption {
                offset,
                message: format!("frame kind {} does not belong to a {kind:?} log", header[6]),
            });
        }

        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if bytes.len() - pos < total {
            break;
        }

        let body_end = pos + HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        let computed = crc32fast::hash(&bytes[pos..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                offset,
                expected: stored,
                actual: computed,
            });
        }

        let event = ciborium::from_reader(&bytes[pos + HEADER_SIZE..body_end])
            .map_err(|e| CoreError::Decode(format!("frame at offset {offset}: {e}")))?;
        events.push(event);
        pos += total;
    }

    Ok((events, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tether_storage::{InMemoryBackend, StorageResult};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Event {
        Put { key: String, value: serde_json::Value },
        Drop(String),
    }

    /// Backend sharing its bytes with the test so they can be inspected or damaged.
    #[derive(Clone, Default)]
    struct Shared(Arc<parking_lot::Mutex<InMemoryBackend>>);

    impl StorageBackend for Shared {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.0.lock().read_at(offset, len)
        }
        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.0.lock().append(data)
        }
        fn rewrite(&mut self, data: &[u8]) -> StorageResult<()> {
            self.0.lock().rewrite(data)
        }
        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn size(&self) -> StorageResult<u64> {
            self.0.lock().size()
        }
        fn capacity(&self) -> Option<u64> {
            None
        }
    }

    fn put(key: &str, n: i64) -> Event {
        Event::Put {
            key: key.into(),
            value: serde_json::json!({ "n": n }),
        }
    }

    #[test]
    fn append_then_replay_in_order() {
        let log = EventLog::<Event>::new(Box::new(InMemoryBackend::new()), LogKind::Queue);
        log.append(&put("a", 1)).unwrap();
        log.append(&Event::Drop("a".into())).unwrap();
        log.append_all(&[put("b", 2), put("c", 3)]).unwrap();

        let events = log.replay().unwrap();
        assert_eq!(
            events,
            vec![put("a", 1), Event::Drop("a".into()), put("b", 2), put("c", 3)]
        );
    }

    #[test]
    fn torn_tail_is_dropped() {
        let shared = Shared::default();
        let log = EventLog::<Event>::new(Box::new(shared.clone()), LogKind::Records);
        log.append(&put("a", 1)).unwrap();
        let good_len = log.size().unwrap();
        log.append(&put("b", 2)).unwrap();

        // simulate a crash midway through the second frame
        let bytes = shared.0.lock().data();
        shared.0.lock().rewrite(&bytes[..bytes.len() - 3]).unwrap();

        assert_eq!(log.replay().unwrap(), vec![put("a", 1)]);
        assert_eq!(log.size().unwrap(), good_len);

        log.append(&put("c", 3)).unwrap();
        assert_eq!(log.replay().unwrap(), vec![put("a", 1), put("c", 3)]);
    }

    #[test]
    fn flipped_byte_is_detected() {
        let shared = Shared::default();
        let log = EventLog::<Event>::new(Box::new(shared.clone()), LogKind::Records);
        log.append(&put("a", 1)).unwrap();

        let mut bytes = shared.0.lock().data();
        bytes[HEADER_SIZE + 1] ^= 0xFF;
        shared.0.lock().rewrite(&bytes).unwrap();

        assert!(matches!(
            log.replay(),
            Err(CoreError::ChecksumMismatch { offset: 0, .. })
        ));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let shared = Shared::default();
        EventLog::<Event>::new(Box::new(shared.clone()), LogKind::Queue)
            .append(&put("a", 1))
            .unwrap();

        let as_records = EventLog::<Event>::new(Box::new(shared), LogKind::Records);
        assert!(matches!(
            as_records.replay(),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn rewrite_replaces_history() {
        let log = EventLog::<Event>::new(Box::new(InMemoryBackend::new()), LogKind::Conflicts);
        for n in 0..10 {
            log.append(&put("a", n)).unwrap();
        }
        let before = log.size().unwrap();

        log.rewrite([&put("a", 9)]).unwrap();
        assert!(log.size().unwrap() < before);
        assert_eq!(log.replay().unwrap(), vec![put("a", 9)]);
    }

    #[test]
    fn bloat_tracks_frames_against_live_items() {
        let log = EventLog::<Event>::new(Box::new(InMemoryBackend::new()), LogKind::Records);
        for n in 0..COMPACT_MIN_FRAMES as i64 {
            log.append(&put("a", n)).unwrap();
        }
        assert_eq!(log.frame_count(), COMPACT_MIN_FRAMES);
        assert!(log.is_bloated(1));
        assert!(!log.is_bloated(COMPACT_MIN_FRAMES));

        log.rewrite([&put("a", 0)]).unwrap();
        assert_eq!(log.frame_count(), 1);
        assert!(!log.is_bloated(1));

        log.append_all(&[put("b", 1), put("c", 2)]).unwrap();
        assert_eq!(log.replay().unwrap().len(), 3);
        assert_eq!(log.frame_count(), 3);
    }

    #[test]
    fn full_backend_leaves_log_intact() {
        let log = EventLog::<Event>::new(Box::new(InMemoryBackend::with_capacity(64)), LogKind::Records);
        log.append(&put("a", 1)).unwrap();

        let big = Event::Put {
            key: "b".into(),
            value: serde_json::json!({ "blob": "x".repeat(200) }),
        };
        assert!(log.append(&big).unwrap_err().is_storage_full());
        assert_eq!(log.replay().unwrap(), vec![put("a", 1)]);
    }
}
