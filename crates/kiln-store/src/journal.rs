//! File journal
//!
//! Append-only journal file fronting every transaction the store accepts.
//! A single writer thread drains submitted entries in sequence order, writes
//! them with CRC framing, fsyncs once per batch and fires the durable-ack
//! callbacks in order.
//!
//! Record format:
//! ```text
//! +--------+--------+------+--------+---------+--------+
//! | Magic  | Seq    | Kind | Length | Payload | CRC32C |
//! | 4B     | 8B     | 1B   | 4B     | var     | 4B     |
//! +--------+--------+------+--------+---------+--------+
//! ```
//!
//! The header records the committed watermark: replay skips entries at or
//! below it, and once every written entry is committed the write position
//! rewinds to the top so the file never grows past its budget.

use bytes::Bytes;
use crc32c::crc32c;
use kiln_common::config::JournalConfig;
use kiln_common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

const HEADER_MAGIC: u32 = 0x4b4c_4a48; // "KLJH"
const RECORD_MAGIC: u32 = 0x4b4c_4a52; // "KLJR"
const HEADER_SIZE: u64 = 4096;
const RECORD_HEADER_LEN: usize = 17;

/// Journal entry payload kinds.
pub const KIND_TXNS: u8 = 0;
pub const KIND_ACK_BATCH: u8 = 1;

/// Durable-ack callback attached to a submitted entry.
pub type JournalAck = Box<dyn FnOnce() + Send + 'static>;

/// A decoded journal entry seen during replay.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: u64,
    pub kind: u8,
    pub payload: Bytes,
}

/// An encoded entry ready for submission. Producing one has no side effects.
pub struct PreparedEntry {
    framed: Vec<u8>,
    /// Payload length before framing.
    pub orig_len: usize,
    kind: u8,
}

struct JournalHeader {
    fsid: Uuid,
    max_size: u64,
    committed_seq: u64,
}

impl JournalHeader {
    const ENCODED_LEN: usize = 4 + 4 + 16 + 8 + 8 + 4;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(self.fsid.as_bytes());
        buf.extend_from_slice(&self.max_size.to_le_bytes());
        buf.extend_from_slice(&self.committed_seq.to_le_bytes());
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_LEN {
            return Err(Error::Journal("journal header too small".into()));
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(Error::Journal("bad journal header magic".into()));
        }
        let stored_crc =
            u32::from_le_bytes(data[Self::ENCODED_LEN - 4..Self::ENCODED_LEN].try_into().unwrap());
        if crc32c(&data[..Self::ENCODED_LEN - 4]) != stored_crc {
            return Err(Error::Journal("journal header crc mismatch".into()));
        }
        let fsid = Uuid::from_bytes(data[8..24].try_into().unwrap());
        let max_size = u64::from_le_bytes(data[24..32].try_into().unwrap());
        let committed_seq = u64::from_le_bytes(data[32..40].try_into().unwrap());
        Ok(Self { fsid, max_size, committed_seq })
    }
}

struct PendingWrite {
    seq: u64,
    framed: Vec<u8>,
    ack: Option<JournalAck>,
}

struct JState {
    queue: VecDeque<PendingWrite>,
    write_pos: u64,
    inflight_bytes: u64,
    last_submitted_seq: u64,
    last_written_seq: u64,
    committed_seq: u64,
    writing: bool,
    stop: bool,
}

struct JournalInner {
    file: File,
    state: Mutex<JState>,
    /// wakes the writer thread
    write_cond: Condvar,
    /// wakes flush/throttle/full waiters
    done_cond: Condvar,
    writeable: AtomicBool,
    fsid: Uuid,
    max_size: u64,
    max_inflight: u64,
    pressure_pct: u8,
}

/// The journal over one file.
pub struct FileJournal {
    inner: Arc<JournalInner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileJournal {
    /// Format a new journal file.
    pub fn create(path: &Path, fsid: Uuid, config: &JournalConfig) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from_io(e, "create journal"))?;
        let header = JournalHeader { fsid, max_size: config.size, committed_seq: 0 };
        let mut block = header.to_bytes();
        block.resize(HEADER_SIZE as usize, 0);
        file.write_all_at(&block, 0).map_err(|e| Error::from_io(e, "write journal header"))?;
        file.sync_all().map_err(|e| Error::from_io(e, "sync journal header"))?;
        info!("created journal at {} ({} bytes)", path.display(), config.size);
        Ok(())
    }

    /// Open an existing journal, validating it belongs to this store.
    pub fn open(path: &Path, fsid: Uuid, config: &JournalConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from_io(e, "open journal"))?;
        let mut block = vec![0u8; JournalHeader::ENCODED_LEN];
        file.read_exact_at(&mut block, 0)
            .map_err(|e| Error::from_io(e, "read journal header"))?;
        let header = JournalHeader::from_bytes(&block)?;
        if header.fsid != fsid {
            return Err(Error::Incompatible(format!(
                "journal fsid {} does not match store fsid {fsid}",
                header.fsid
            )));
        }
        let inner = Arc::new(JournalInner {
            file,
            state: Mutex::new(JState {
                queue: VecDeque::new(),
                write_pos: HEADER_SIZE,
                inflight_bytes: 0,
                last_submitted_seq: header.committed_seq,
                last_written_seq: header.committed_seq,
                committed_seq: header.committed_seq,
                writing: false,
                stop: false,
            }),
            write_cond: Condvar::new(),
            done_cond: Condvar::new(),
            writeable: AtomicBool::new(true),
            fsid,
            max_size: header.max_size,
            max_inflight: config.max_inflight_bytes,
            pressure_pct: config.commit_pressure_pct,
        });
        Ok(Self { inner, writer: Mutex::new(None) })
    }

    /// Committed watermark read from the header at open.
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.inner.state.lock().committed_seq
    }

    /// Scan every decodable entry with `seq > from_seq`, in order. Also
    /// positions the write cursor after the last valid record.
    pub fn replay(&self, from_seq: u64) -> Result<Vec<JournalEntry>> {
        let mut state = self.inner.state.lock();
        let mut pos = HEADER_SIZE;
        let mut prev_seq = 0u64;
        let mut out = Vec::new();
        loop {
            match self.inner.read_record(pos) {
                Some((seq, kind, payload, next)) => {
                    if seq <= prev_seq {
                        break;
                    }
                    prev_seq = seq;
                    if seq > from_seq {
                        out.push(JournalEntry { seq, kind, payload: Bytes::from(payload) });
                    }
                    pos = next;
                }
                None => break,
            }
        }
        state.write_pos = pos;
        state.last_submitted_seq = state.last_submitted_seq.max(prev_seq);
        state.last_written_seq = state.last_written_seq.max(prev_seq);
        debug!(
            "journal replay: {} entries after seq {from_seq}, write cursor at {pos}",
            out.len()
        );
        Ok(out)
    }

    /// Start the writer thread.
    pub fn start(&self) {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *writer = Some(
            std::thread::Builder::new()
                .name("kiln-journal".into())
                .spawn(move || inner.writer_loop())
                .expect("spawn journal writer"),
        );
    }

    /// Stop the writer thread after draining the queue.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
            self.inner.write_cond.notify_all();
        }
        if let Some(t) = self.writer.lock().take() {
            let _ = t.join();
        }
        self.inner.state.lock().stop = false;
    }

    /// Frame a payload for submission. Side-effect free.
    #[must_use]
    pub fn prepare_entry(&self, kind: u8, payload: &[u8]) -> PreparedEntry {
        PreparedEntry { framed: frame_record(0, kind, payload), orig_len: payload.len(), kind }
    }

    /// Queue a framed entry under its sequence number; `ack` fires once the
    /// entry is durable. Entries must be submitted in increasing seq order.
    pub fn submit_entry(&self, seq: u64, mut entry: PreparedEntry, ack: JournalAck) -> Result<()> {
        if !self.is_writeable() {
            return Err(Error::Journal("journal is not writeable".into()));
        }
        // the frame is built before the seq is known; stamp it now
        stamp_record_seq(&mut entry.framed, seq);
        let mut state = self.inner.state.lock();
        debug_assert!(seq > state.last_submitted_seq);
        state.last_submitted_seq = seq;
        state.inflight_bytes += entry.framed.len() as u64;
        state.queue.push_back(PendingWrite { seq, framed: entry.framed, ack: Some(ack) });
        self.inner.write_cond.notify_all();
        Ok(())
    }

    /// Cooperative bound on in-flight journal bytes.
    pub fn throttle(&self) {
        let mut state = self.inner.state.lock();
        while state.inflight_bytes > self.inner.max_inflight && !state.stop {
            self.inner.done_cond.wait(&mut state);
        }
    }

    /// False after a fatal write error.
    #[must_use]
    pub fn is_writeable(&self) -> bool {
        self.inner.writeable.load(Ordering::SeqCst)
    }

    /// Wait until everything submitted so far is durable.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() || state.writing {
            self.inner.done_cond.wait(&mut state);
        }
    }

    /// Record that every entry with `seq <= thru` is durably applied and
    /// committed; reclaims journal space once no written entry is newer.
    pub fn committed_thru(&self, thru: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        if thru < state.committed_seq {
            return Ok(());
        }
        state.committed_seq = thru;
        let header = JournalHeader {
            fsid: self.inner.fsid,
            max_size: self.inner.max_size,
            committed_seq: thru,
        };
        self.inner
            .file
            .write_all_at(&header.to_bytes(), 0)
            .map_err(|e| Error::from_io(e, "write journal header"))?;
        self.inner
            .file
            .sync_data()
            .map_err(|e| Error::from_io(e, "sync journal header"))?;
        if thru >= state.last_written_seq && state.write_pos > HEADER_SIZE {
            debug!("journal trim: rewinding write cursor (committed thru {thru})");
            state.write_pos = HEADER_SIZE;
            // a stalled full-journal writer can go again
            self.inner.write_cond.notify_all();
        }
        Ok(())
    }

    /// The sync engine should run a cycle now: the journal is filling up.
    #[must_use]
    pub fn should_commit_now(&self) -> bool {
        let state = self.inner.state.lock();
        let used = state.write_pos.saturating_sub(HEADER_SIZE);
        let budget = self.inner.max_size.saturating_sub(HEADER_SIZE);
        used * 100 >= budget * u64::from(self.inner.pressure_pct)
    }

    /// Validate the record chain; returns the number of valid entries.
    pub fn check(&self) -> Result<u64> {
        let mut pos = HEADER_SIZE;
        let mut prev_seq = 0u64;
        let mut count = 0u64;
        while let Some((seq, _, _, next)) = self.inner.read_record(pos) {
            if seq <= prev_seq {
                break;
            }
            prev_seq = seq;
            count += 1;
            pos = next;
        }
        Ok(count)
    }

    /// Write a human-readable listing of the record chain.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let committed = self.committed_seq();
        writeln!(out, "journal fsid {} committed_thru {committed}", self.inner.fsid)
            .map_err(|e| Error::from_io(e, "dump"))?;
        let mut pos = HEADER_SIZE;
        let mut prev_seq = 0u64;
        while let Some((seq, kind, payload, next)) = self.inner.read_record(pos) {
            if seq <= prev_seq {
                break;
            }
            prev_seq = seq;
            writeln!(
                out,
                "  seq {seq} kind {} len {} at {pos}",
                if kind == KIND_ACK_BATCH { "ack" } else { "txns" },
                payload.len()
            )
            .map_err(|e| Error::from_io(e, "dump"))?;
            pos = next;
        }
        Ok(())
    }
}

impl JournalInner {
    fn writer_loop(self: Arc<Self>) {
        debug!("journal writer started");
        let mut state = self.state.lock();
        loop {
            while state.queue.is_empty() && !state.stop {
                self.write_cond.wait(&mut state);
            }
            if state.queue.is_empty() && state.stop {
                break;
            }
            let mut batch: Vec<PendingWrite> = Vec::with_capacity(state.queue.len());
            let mut pos = state.write_pos;
            let budget = self.max_size;
            while let Some(front) = state.queue.front() {
                let len = front.framed.len() as u64;
                if pos + len > budget {
                    break;
                }
                pos += len;
                batch.push(state.queue.pop_front().unwrap());
            }
            if batch.is_empty() {
                // journal full: wait for a commit cycle to reclaim space
                if state.stop {
                    break;
                }
                self.write_cond.wait(&mut state);
                continue;
            }
            state.writing = true;
            let start_pos = state.write_pos;
            state.write_pos = pos;
            drop(state);

            let mut ok = true;
            let mut at = start_pos;
            for entry in &batch {
                if let Err(e) = self.file.write_all_at(&entry.framed, at) {
                    error!("journal write failed at {at}: {e}");
                    ok = false;
                    break;
                }
                at += entry.framed.len() as u64;
            }
            if ok {
                if let Err(e) = self.file.sync_data() {
                    error!("journal fsync failed: {e}");
                    ok = false;
                }
            }

            state = self.state.lock();
            state.writing = false;
            if ok {
                for entry in &batch {
                    state.last_written_seq = state.last_written_seq.max(entry.seq);
                }
                let released: u64 = batch.iter().map(|e| e.framed.len() as u64).sum();
                state.inflight_bytes -= released;
                drop(state);
                for entry in &mut batch {
                    if let Some(ack) = entry.ack.take() {
                        ack();
                    }
                }
                state = self.state.lock();
            } else {
                // fatal: completions never fire, later submits are refused
                self.writeable.store(false, Ordering::SeqCst);
            }
            self.done_cond.notify_all();
        }
        drop(state);
        debug!("journal writer stopped");
    }

    /// Read one record at `pos`; returns (seq, kind, payload, next_pos).
    fn read_record(&self, pos: u64) -> Option<(u64, u8, Vec<u8>, u64)> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        self.file.read_exact_at(&mut head, pos).ok()?;
        if u32::from_le_bytes(head[0..4].try_into().unwrap()) != RECORD_MAGIC {
            return None;
        }
        let seq = u64::from_le_bytes(head[4..12].try_into().unwrap());
        let kind = head[12];
        let len = u32::from_le_bytes(head[13..17].try_into().unwrap()) as usize;
        if pos + (RECORD_HEADER_LEN + len + 4) as u64 > self.max_size {
            return None;
        }
        let mut rest = vec![0u8; len + 4];
        self.file.read_exact_at(&mut rest, pos + RECORD_HEADER_LEN as u64).ok()?;
        let stored_crc = u32::from_le_bytes(rest[len..len + 4].try_into().unwrap());
        let mut crc_input = Vec::with_capacity(RECORD_HEADER_LEN + len);
        crc_input.extend_from_slice(&head);
        crc_input.extend_from_slice(&rest[..len]);
        if crc32c(&crc_input) != stored_crc {
            return None;
        }
        rest.truncate(len);
        let next = pos + (RECORD_HEADER_LEN + len + 4) as u64;
        Some((seq, kind, rest, next))
    }
}

impl Drop for FileJournal {
    fn drop(&mut self) {
        self.stop();
    }
}

fn frame_record(seq: u64, kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + 4);
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn stamp_record_seq(framed: &mut [u8], seq: u64) {
    framed[4..12].copy_from_slice(&seq.to_le_bytes());
    let body_len = framed.len() - 4;
    let crc = crc32c(&framed[..body_len]);
    framed[body_len..].copy_from_slice(&crc.to_le_bytes());
}

impl PreparedEntry {
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.kind
    }

    #[must_use]
    pub fn framed_len(&self) -> usize {
        self.framed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn config() -> JournalConfig {
        JournalConfig { size: 1 << 20, max_inflight_bytes: 1 << 20, commit_pressure_pct: 50 }
    }

    fn new_journal(dir: &std::path::Path) -> (FileJournal, Uuid) {
        let fsid = Uuid::new_v4();
        let path = dir.join("journal");
        FileJournal::create(&path, fsid, &config()).unwrap();
        let j = FileJournal::open(&path, fsid, &config()).unwrap();
        (j, fsid)
    }

    #[test]
    fn test_create_open_and_fsid_check() {
        let dir = tempdir().unwrap();
        let (j, fsid) = new_journal(dir.path());
        assert_eq!(j.committed_seq(), 0);
        drop(j);
        let err = FileJournal::open(&dir.path().join("journal"), Uuid::new_v4(), &config());
        assert!(matches!(err, Err(Error::Incompatible(_))));
        let _ = fsid;
    }

    #[test]
    fn test_submit_ack_and_replay() {
        let dir = tempdir().unwrap();
        let (j, _) = new_journal(dir.path());
        j.start();

        let (tx, rx) = mpsc::channel();
        for seq in 1..=3u64 {
            let entry = j.prepare_entry(KIND_TXNS, format!("payload{seq}").as_bytes());
            let tx = tx.clone();
            j.submit_entry(seq, entry, Box::new(move || tx.send(seq).unwrap())).unwrap();
        }
        // acks fire in submission order
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 3);
        j.stop();

        let reopened = FileJournal::open(
            &dir.path().join("journal"),
            j.inner.fsid,
            &config(),
        )
        .unwrap();
        let entries = reopened.replay(1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 2);
        assert_eq!(entries[1].payload, Bytes::from_static(b"payload3"));
        assert_eq!(reopened.check().unwrap(), 3);
    }

    #[test]
    fn test_committed_thru_trims_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let (j, fsid) = new_journal(dir.path());
        j.start();

        let (tx, rx) = mpsc::channel();
        let entry = j.prepare_entry(KIND_TXNS, b"one");
        j.submit_entry(1, entry, Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();

        j.committed_thru(1).unwrap();
        // cursor rewound: the next entry lands at the top again
        let (tx2, rx2) = mpsc::channel();
        let entry = j.prepare_entry(KIND_TXNS, b"two");
        j.submit_entry(2, entry, Box::new(move || tx2.send(()).unwrap())).unwrap();
        rx2.recv().unwrap();
        j.stop();

        let reopened = FileJournal::open(&dir.path().join("journal"), fsid, &config()).unwrap();
        assert_eq!(reopened.committed_seq(), 1);
        let entries = reopened.replay(reopened.committed_seq()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 2);
    }

    #[test]
    fn test_replay_stops_at_corruption() {
        let dir = tempdir().unwrap();
        let (j, fsid) = new_journal(dir.path());
        j.start();
        for seq in 1..=3u64 {
            let (tx, rx) = mpsc::channel();
            let entry = j.prepare_entry(KIND_TXNS, &[seq as u8; 32]);
            j.submit_entry(seq, entry, Box::new(move || tx.send(()).unwrap())).unwrap();
            rx.recv().unwrap();
        }
        j.stop();

        // flip a byte in the middle of the second record's payload
        let path = dir.path().join("journal");
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let second = HEADER_SIZE + (RECORD_HEADER_LEN + 32 + 4) as u64 + RECORD_HEADER_LEN as u64;
        file.write_all_at(&[0xff], second + 5).unwrap();

        let reopened = FileJournal::open(&path, fsid, &config()).unwrap();
        let entries = reopened.replay(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 1);
    }

    #[test]
    fn test_flush_and_dump() {
        let dir = tempdir().unwrap();
        let (j, _) = new_journal(dir.path());
        j.start();
        let entry = j.prepare_entry(KIND_ACK_BATCH, b"acks");
        j.submit_entry(1, entry, Box::new(|| {})).unwrap();
        j.flush();

        let mut out = Vec::new();
        j.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("seq 1 kind ack"));
        j.stop();
    }

    #[test]
    fn test_should_commit_now_under_pressure() {
        let dir = tempdir().unwrap();
        let fsid = Uuid::new_v4();
        let path = dir.path().join("journal");
        let small = JournalConfig { size: 8192, max_inflight_bytes: 1 << 20, commit_pressure_pct: 50 };
        FileJournal::create(&path, fsid, &small).unwrap();
        let j = FileJournal::open(&path, fsid, &small).unwrap();
        assert!(!j.should_commit_now());
        j.start();
        let (tx, rx) = mpsc::channel();
        let entry = j.prepare_entry(KIND_TXNS, &[0u8; 3000]);
        j.submit_entry(1, entry, Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();
        assert!(j.should_commit_now());
        j.stop();
    }
}
