//! The Kiln object store
//!
//! Ties the pipeline together: callers queue transaction bundles against a
//! sequencer; bundles are journaled, applied by a worker pool with strict
//! per-sequencer ordering, acknowledged through a batched ack record, and
//! made durable by the periodic commit cycle. Mount validates the on-disk
//! store, replays the journal and starts the machinery; umount drains and
//! stops it in order.

use crate::apply::ApplyMode;
use crate::backend::{CrcTracker, FsBackend, GenericBackend, BTRFS_SUPER_MAGIC, XFS_SUPER_MAGIC};
use crate::exec::{ApplyPool, Completion, Finisher};
use crate::fdcache::FdCache;
use crate::fs_util;
use crate::index::IndexManager;
use crate::journal::{FileJournal, KIND_ACK_BATCH, KIND_TXNS};
use crate::omap::OmapStore;
use crate::pgmeta::PgMetaCache;
use crate::sequencer::{Op, OpCallbacks, OpSequencer, OpState, OpThrottle, SequencerRegistry};
use crate::sync::ApplyManager;
use crate::transaction::{
    classify_wal, encode_ack_batch, encode_txn_list, Transaction,
};
use crate::wbthrottle::WbThrottle;
use bytes::Bytes;
use kiln_common::config::{ConfigUpdate, StoreConfig};
use kiln_common::{CollectionId, Error, ObjectId, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::File;
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// On-disk format version this build reads and writes.
pub const STORE_VERSION: u32 = 4;

const SUPERBLOCK_MAGIC: u32 = 0x4b4c_5342; // "KLSB"

/// Entries are framed and sequenced in the journal.
pub const INCOMPAT_SEQ_JOURNAL: u64 = 1 << 0;
/// The object map lives in an embedded KV store under `current/omap`.
pub const INCOMPAT_OMAP_KV: u64 = 1 << 1;

const SUPPORTED_COMPAT: u64 = 0;
const SUPPORTED_RO_COMPAT: u64 = 0;
const SUPPORTED_INCOMPAT: u64 = INCOMPAT_SEQ_JOURNAL | INCOMPAT_OMAP_KV;

/// Compat feature sets from the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub compat: u64,
    pub ro_compat: u64,
    pub incompat: u64,
}

impl Superblock {
    fn current() -> Self {
        Self {
            compat: SUPPORTED_COMPAT,
            ro_compat: SUPPORTED_RO_COMPAT,
            incompat: SUPPORTED_INCOMPAT,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.compat.to_le_bytes());
        buf.extend_from_slice(&self.ro_compat.to_le_bytes());
        buf.extend_from_slice(&self.incompat.to_le_bytes());
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(Error::Corrupt("superblock too small".into()));
        }
        if u32::from_le_bytes(data[0..4].try_into().unwrap()) != SUPERBLOCK_MAGIC {
            return Err(Error::Corrupt("bad superblock magic".into()));
        }
        let stored = u32::from_le_bytes(data[28..32].try_into().unwrap());
        if crc32c::crc32c(&data[..28]) != stored {
            return Err(Error::Corrupt("superblock crc mismatch".into()));
        }
        Ok(Self {
            compat: u64::from_le_bytes(data[4..12].try_into().unwrap()),
            ro_compat: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            incompat: u64::from_le_bytes(data[20..28].try_into().unwrap()),
        })
    }
}

/// The runtime-tunable knobs, behind one lock.
pub(crate) struct Tunables {
    pub(crate) min_sync_interval: Duration,
    pub(crate) max_sync_interval: Duration,
    pub(crate) commit_timeout: Duration,
    pub(crate) queue_max_ops: u64,
    pub(crate) queue_max_bytes: u64,
    pub(crate) queue_committing_max_ops: u64,
    pub(crate) queue_committing_max_bytes: u64,
    pub(crate) fail_eio: bool,
    pub(crate) sloppy_crc: bool,
}

pub(crate) struct JwaQueue {
    pub(crate) queue: VecDeque<Arc<Op>>,
    pub(crate) stop: bool,
}

pub(crate) struct SyncControl {
    pub(crate) force_sync: bool,
    pub(crate) stop: bool,
    pub(crate) waiters: Vec<Completion>,
}

/// Everything the worker threads share.
pub(crate) struct StoreInner {
    pub(crate) base_dir: PathBuf,
    pub(crate) current_dir: PathBuf,
    pub(crate) fsid: Uuid,
    #[allow(dead_code)]
    pub(crate) fsid_file: File, // holds the mount flock
    pub(crate) op_seq_file: Mutex<File>,
    pub(crate) tunables: Mutex<Tunables>,
    pub(crate) xattr_limits: Mutex<(usize, usize)>,
    pub(crate) backend: Box<dyn FsBackend>,
    pub(crate) index: IndexManager,
    pub(crate) omap: Arc<OmapStore>,
    pub(crate) pgmeta: PgMetaCache,
    pub(crate) fdcache: FdCache,
    pub(crate) wbthrottle: WbThrottle,
    pub(crate) journal: FileJournal,
    pub(crate) sequencers: SequencerRegistry,
    pub(crate) default_osr: Arc<OpSequencer>,
    pub(crate) op_throttle: OpThrottle,
    /// Last allocated sequence number; held across journal submission so
    /// entries enter the journal in sequence order.
    pub(crate) next_seq: Mutex<u64>,
    pub(crate) apply_pool: ApplyPool<Arc<OpSequencer>>,
    pub(crate) ondisk_finishers: Vec<Finisher>,
    pub(crate) apply_finishers: Vec<Finisher>,
    pub(crate) jwa: Mutex<JwaQueue>,
    pub(crate) jwa_cond: Condvar,
    pub(crate) apply_mgr: ApplyManager,
    pub(crate) sync_state: Mutex<SyncControl>,
    pub(crate) sync_cond: Condvar,
    pub(crate) replaying: AtomicBool,
    pub(crate) kill_at: AtomicI64,
    pub(crate) crc: CrcTracker,
    pub(crate) dump_file: Mutex<Option<File>>,
    pub(crate) snaps: Mutex<Vec<u64>>,
}

struct StoreThreads {
    sync: JoinHandle<()>,
    jwa: JoinHandle<()>,
}

/// Caller-visible ordering token. Ops queued on the same handle apply and
/// complete strictly in submission order.
#[derive(Clone)]
pub struct SequencerHandle {
    pub(crate) osr: Arc<OpSequencer>,
}

impl SequencerHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.osr.name
    }
}

/// A mounted Kiln store.
pub struct KilnStore {
    inner: Arc<StoreInner>,
    threads: Mutex<Option<StoreThreads>>,
}

impl std::fmt::Debug for KilnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KilnStore").finish_non_exhaustive()
    }
}

impl KilnStore {
    /// Format a store (and its journal) under the configured base directory.
    /// Idempotent over an existing store.
    pub fn mkfs(config: &StoreConfig) -> Result<()> {
        let base = &config.base_dir;
        std::fs::create_dir_all(base).map_err(|e| Error::from_io(e, "mkdir base"))?;

        let fsid_path = base.join("fsid");
        let fsid = match read_fsid_file(&fsid_path) {
            Ok(existing) => existing,
            Err(_) => {
                let fsid = Uuid::new_v4();
                let mut f = File::create(&fsid_path)
                    .map_err(|e| Error::from_io(e, "create fsid"))?;
                writeln!(f, "{fsid}").map_err(|e| Error::from_io(e, "write fsid"))?;
                f.sync_all().map_err(|e| Error::from_io(e, "sync fsid"))?;
                fsid
            }
        };

        write_file_durable(&base.join("store_version"), &STORE_VERSION.to_le_bytes())?;
        write_file_durable(&base.join("superblock"), &Superblock::current().to_bytes())?;

        let current = base.join("current");
        if !current.is_dir() {
            std::fs::create_dir(&current).map_err(|e| Error::from_io(e, "mkdir current"))?;
        }
        let op_seq_path = current.join("commit_op_seq");
        if !op_seq_path.is_file() {
            write_file_durable(&op_seq_path, b"1\n")?;
        }
        // create the object map so mount never races its tables
        drop(OmapStore::open(&current.join("omap"))?);

        let journal_path = config.journal_file();
        if !journal_path.is_file() {
            FileJournal::create(&journal_path, fsid, &config.journal)?;
        }
        info!("mkfs complete at {} (fsid {fsid})", base.display());
        Ok(())
    }

    /// Open the store: validate, maybe roll back, replay the journal and
    /// start the pipeline.
    pub fn mount(config: StoreConfig) -> Result<Self> {
        let base = config.base_dir.clone();
        let current_dir = base.join("current");
        info!("mounting {}", base.display());

        // fsid + exclusive lock for the mount lifetime
        let fsid_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(base.join("fsid"))
            .map_err(|e| Error::from_io(e, "open fsid"))?;
        let fsid = read_fsid(&fsid_file)?;
        fs_util::flock_exclusive(&fsid_file)
            .map_err(|_| Error::Busy("store is mounted elsewhere".into()))?;
        debug!("mount fsid is {fsid}");

        check_version_stamp(&base, config.update_to)?;

        let superblock = Superblock::from_bytes(
            &std::fs::read(base.join("superblock"))
                .map_err(|e| Error::from_io(e, "read superblock"))?,
        )?;
        if superblock.incompat & !SUPPORTED_INCOMPAT != 0 {
            return Err(Error::Incompatible(format!(
                "unknown incompat features {:#x}",
                superblock.incompat & !SUPPORTED_INCOMPAT
            )));
        }

        let backend = Box::new(GenericBackend::detect(&current_dir)?);
        probe_xattrs(&current_dir)?;
        let xattr_limits = resolve_xattr_limits(&config, backend.fs_type());

        handle_checkpoints(backend.as_ref(), &config, &current_dir)?;

        let op_seq_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(current_dir.join("commit_op_seq"))
            .map_err(|e| Error::from_io(e, "open commit_op_seq"))?;
        let committed = read_op_seq(&op_seq_file)?;
        if committed == 0 {
            return Err(Error::Incompatible("initial op seq is 0".into()));
        }
        debug!("mount op_seq is {committed}");

        if config.omap_backend != "redb" {
            return Err(Error::Config(format!(
                "unknown omap backend {:?}",
                config.omap_backend
            )));
        }
        let omap = Arc::new(OmapStore::open(&current_dir.join("omap"))?);
        let journal = FileJournal::open(&config.journal_file(), fsid, &config.journal)?;

        let sequencers = SequencerRegistry::new();
        let default_osr = sequencers.get_or_create("default");
        let ondisk_finishers = (0..config.threads.ondisk_finishers.max(1))
            .map(|i| Finisher::new(format!("kiln-ondisk-{i}")))
            .collect();
        let apply_finishers = (0..config.threads.apply_finishers.max(1))
            .map(|i| Finisher::new(format!("kiln-apply-fin-{i}")))
            .collect();

        let inner = Arc::new(StoreInner {
            base_dir: base,
            current_dir: current_dir.clone(),
            fsid,
            fsid_file,
            op_seq_file: Mutex::new(op_seq_file),
            tunables: Mutex::new(Tunables {
                min_sync_interval: config.sync.min_interval,
                max_sync_interval: config.sync.max_interval,
                commit_timeout: config.sync.commit_timeout,
                queue_max_ops: config.queue.max_ops,
                queue_max_bytes: config.queue.max_bytes,
                queue_committing_max_ops: config.queue.committing_max_ops,
                queue_committing_max_bytes: config.queue.committing_max_bytes,
                fail_eio: config.debug.fail_eio,
                sloppy_crc: config.debug.sloppy_crc,
            }),
            xattr_limits: Mutex::new(xattr_limits),
            backend,
            index: IndexManager::new(&current_dir),
            omap: Arc::clone(&omap),
            pgmeta: PgMetaCache::new(&config.pgmeta, omap),
            fdcache: FdCache::new(
                config.fd_cache.size,
                config.fd_cache.shards,
                config.fd_cache.random,
            ),
            wbthrottle: WbThrottle::new(&config.wb_throttle),
            journal,
            sequencers,
            default_osr,
            op_throttle: OpThrottle::new(),
            next_seq: Mutex::new(committed),
            apply_pool: ApplyPool::new(),
            ondisk_finishers,
            apply_finishers,
            jwa: Mutex::new(JwaQueue { queue: VecDeque::new(), stop: false }),
            jwa_cond: Condvar::new(),
            apply_mgr: ApplyManager::new(),
            sync_state: Mutex::new(SyncControl {
                force_sync: false,
                stop: false,
                waiters: Vec::new(),
            }),
            sync_cond: Condvar::new(),
            replaying: AtomicBool::new(false),
            kill_at: AtomicI64::new(i64::from(config.debug.kill_at)),
            crc: CrcTracker::new(),
            dump_file: Mutex::new(match &config.debug.dump_file {
                Some(path) => Some(
                    File::create(path).map_err(|e| Error::from_io(e, "open dump file"))?,
                ),
                None => None,
            }),
            snaps: Mutex::new(Vec::new()),
        });

        // replay before anything concurrent starts
        inner.apply_mgr.init_committed(committed);
        inner.replaying.store(true, Ordering::SeqCst);
        inner.omap.set_replay_gating(true);
        let last_seq = inner.journal_replay(committed)?;
        inner.omap.set_replay_gating(false);
        inner.replaying.store(false, Ordering::SeqCst);
        *inner.next_seq.lock() = last_seq;
        inner.apply_mgr.note_allocated(last_seq);

        // start the machinery: journal writer, flushers, pool, finishers,
        // then the sync and ack-writer threads
        inner.journal.start();
        inner.wbthrottle.start();
        {
            let weak = Arc::downgrade(&inner);
            inner.apply_pool.start(
                config.threads.apply_threads,
                "kiln-apply",
                move |osr: Arc<OpSequencer>| {
                    if let Some(store) = weak.upgrade() {
                        store.do_op(&osr);
                    }
                },
            );
        }
        for f in inner.ondisk_finishers.iter().chain(inner.apply_finishers.iter()) {
            f.start();
        }
        let sync_inner = Arc::clone(&inner);
        let sync = std::thread::Builder::new()
            .name("kiln-sync".into())
            .spawn(move || sync_inner.sync_entry())
            .expect("spawn sync thread");
        let jwa_inner = Arc::clone(&inner);
        let jwa = std::thread::Builder::new()
            .name("kiln-jwa".into())
            .spawn(move || jwa_inner.jwa_entry())
            .expect("spawn ack writer");

        info!("mounted {} at op_seq {committed}", inner.base_dir.display());
        Ok(Self { inner, threads: Mutex::new(Some(StoreThreads { sync, jwa })) })
    }

    /// Drain, force a final commit and stop everything in order.
    pub fn umount(&self) {
        let Some(threads) = self.threads.lock().take() else {
            return;
        };
        info!("umounting {}", self.inner.base_dir.display());
        self.inner.flush();
        self.sync();

        {
            let mut state = self.inner.sync_state.lock();
            state.stop = true;
            self.inner.sync_cond.notify_all();
        }
        let _ = threads.sync.join();

        {
            let mut jwa = self.inner.jwa.lock();
            jwa.stop = true;
            self.inner.jwa_cond.notify_all();
        }
        let _ = threads.jwa.join();

        self.inner.apply_pool.stop();
        self.inner.wbthrottle.stop();
        self.inner.journal.stop();
        for f in self
            .inner
            .ondisk_finishers
            .iter()
            .chain(self.inner.apply_finishers.iter())
        {
            f.stop();
        }
    }

    /// The store's fsid.
    #[must_use]
    pub fn fsid(&self) -> Uuid {
        self.inner.fsid
    }

    /// Get (or create) a named sequencer.
    #[must_use]
    pub fn sequencer(&self, name: &str) -> SequencerHandle {
        SequencerHandle { osr: self.inner.sequencers.get_or_create(name) }
    }

    /// Queue a transaction bundle. Returns once the bundle is accepted;
    /// progress is reported through the callbacks.
    pub fn queue_transactions(
        &self,
        handle: Option<&SequencerHandle>,
        txns: Vec<Transaction>,
        callbacks: OpCallbacks,
    ) -> Result<()> {
        self.inner.queue_transactions(handle, txns, callbacks)
    }

    /// Queue one transaction and wait for both its apply and its journal
    /// commit.
    pub fn apply_transaction(
        &self,
        handle: Option<&SequencerHandle>,
        txn: Transaction,
    ) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx2 = tx.clone();
        let callbacks = OpCallbacks {
            ondisk: Some(Box::new(move |r| {
                let _ = tx.send(r);
            })),
            onreadable: Some(Box::new(move |r| {
                let _ = tx2.send(r);
            })),
            onreadable_sync: None,
        };
        self.queue_transactions(handle, vec![txn], callbacks)?;
        for _ in 0..2 {
            rx.recv().map_err(|_| Error::Journal("store shut down mid-op".into()))?;
        }
        Ok(())
    }

    /// Make every queued write readable.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Trigger a commit cycle and wait for it.
    pub fn sync(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        self.start_sync(Box::new(move |_| {
            let _ = tx.send(());
        }));
        let _ = rx.recv();
    }

    /// Register a callback for the next commit cycle and nudge the sync
    /// thread.
    pub fn start_sync(&self, onsafe: Completion) {
        let mut state = self.inner.sync_state.lock();
        state.waiters.push(onsafe);
        self.inner.sync_cond.notify_all();
    }

    /// Ask the sync thread to run a cycle now.
    pub fn do_force_sync(&self) {
        let mut state = self.inner.sync_state.lock();
        state.force_sync = true;
        self.inner.sync_cond.notify_all();
    }

    /// Make every queued write readable and committed.
    pub fn sync_and_flush(&self) {
        self.inner.flush();
        self.sync();
    }

    /// Take a named cluster snapshot of `current/`.
    pub fn snapshot(&self, name: &str) -> Result<()> {
        self.sync_and_flush();
        if !self.inner.backend.can_checkpoint() {
            warn!("snapshot {name} refused: backend cannot checkpoint");
            return Err(Error::Unsupported("snapshot without checkpoints".into()));
        }
        self.inner.backend.create_checkpoint(&format!("clustersnap_{name}")).map(|_| ())
    }

    /// Apply a runtime configuration update.
    pub fn reconfigure(&self, update: &ConfigUpdate) {
        self.inner.reconfigure(update);
    }

    /// The durable committed sequence, as of the last commit cycle.
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.inner.apply_mgr.committed_seq()
    }

    /// Write a human-readable journal listing (admin/debugging).
    pub fn dump_journal(&self, out: &mut dyn std::io::Write) -> Result<()> {
        self.inner.journal.dump(out)
    }

    // ---- read side ----

    pub fn read(&self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64)
        -> Result<Bytes> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        let fd = self.inner.lfn_open(cid, oid, false)?;
        let size = fd.file().metadata().map_err(|e| Error::from_io(e, "fstat"))?.len();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let want = if len == 0 { size - offset } else { len.min(size - offset) };
        let mut buf = vec![0u8; want as usize];
        fd.file()
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::from_io(e, format!("read {cid}/{oid}")))?;
        if self.inner.tunables.lock().sloppy_crc {
            self.inner.crc.verify_read(oid, offset, &buf);
        }
        Ok(Bytes::from(buf))
    }

    pub fn stat(&self, cid: &CollectionId, oid: &ObjectId) -> Result<u64> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        let path = self.inner.index.lookup(cid, oid)?;
        Ok(std::fs::metadata(path).map_err(|e| Error::from_io(e, "stat"))?.len())
    }

    #[must_use]
    pub fn exists(&self, cid: &CollectionId, oid: &ObjectId) -> bool {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        self.inner.index.lookup(cid, oid).is_ok()
    }

    pub fn getattr(&self, cid: &CollectionId, oid: &ObjectId, name: &str) -> Result<Bytes> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        let fd = self.inner.lfn_open(cid, oid, false)?;
        match fs_util::chain_getxattr(fd.file(), &fs_util::attr_xattr_name(name)) {
            Ok(v) => Ok(Bytes::from(v)),
            Err(e) if e.is_no_data() => {
                let mut names = BTreeSet::new();
                names.insert(name.to_string());
                let got = self.inner.omap.get_xattrs(oid, &names)?;
                got.into_values()
                    .next()
                    .ok_or_else(|| Error::NoData(format!("{cid}/{oid} '{name}'")))
            }
            Err(e) => Err(e),
        }
    }

    pub fn getattrs(&self, cid: &CollectionId, oid: &ObjectId)
        -> Result<BTreeMap<String, Bytes>> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        let fd = self.inner.lfn_open(cid, oid, false)?;
        let mut out = BTreeMap::new();
        for name in fs_util::list_attr_names(fd.file())? {
            let v = fs_util::chain_getxattr(fd.file(), &fs_util::attr_xattr_name(&name))?;
            out.insert(name, Bytes::from(v));
        }
        let spilled = match fs_util::fgetxattr(fd.file(), crate::guard::SPILL_OUT_XATTR) {
            Ok(v) if v == crate::guard::SPILL_OUT_NO => false,
            _ => true,
        };
        if spilled {
            let names = self.inner.omap.get_all_xattr_names(oid)?;
            for (k, v) in self.inner.omap.get_xattrs(oid, &names)? {
                out.insert(k, v);
            }
        }
        Ok(out)
    }

    pub fn collection_getattr(&self, cid: &CollectionId, name: &str) -> Result<Bytes> {
        let dir = File::open(self.inner.index.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("open {cid}")))?;
        fs_util::chain_getxattr(&dir, &fs_util::attr_xattr_name(name)).map(Bytes::from)
    }

    pub fn collection_getattrs(&self, cid: &CollectionId) -> Result<BTreeMap<String, Bytes>> {
        let dir = File::open(self.inner.index.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("open {cid}")))?;
        let mut out = BTreeMap::new();
        for name in fs_util::list_attr_names(&dir)? {
            let v = fs_util::chain_getxattr(&dir, &fs_util::attr_xattr_name(&name))?;
            out.insert(name, Bytes::from(v));
        }
        Ok(out)
    }

    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        self.inner.index.list_collections()
    }

    #[must_use]
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        self.inner.index.collection_exists(cid)
    }

    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        self.inner.index.collection_empty(cid)
    }

    pub fn collection_list(&self, cid: &CollectionId) -> Result<Vec<ObjectId>> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        self.inner.index.list_objects(cid)
    }

    /// Omap header and all keys; pending pgmeta state is merged in.
    pub fn omap_get(&self, cid: &CollectionId, oid: &ObjectId)
        -> Result<(Option<Bytes>, BTreeMap<String, Bytes>)> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        self.inner.index.lookup(cid, oid)?;
        if oid.is_pgmeta() {
            self.inner.pgmeta.get_all(oid)
        } else {
            self.inner.omap.get_all(oid)
        }
    }

    pub fn omap_get_header(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Option<Bytes>> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        self.inner.index.lookup(cid, oid)?;
        self.inner.omap.get_header(oid)
    }

    pub fn omap_get_keys(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Vec<String>> {
        Ok(self.omap_get(cid, oid)?.1.into_keys().collect())
    }

    pub fn omap_get_values(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Bytes>> {
        let lock = self.inner.index.lock(cid);
        let _guard = lock.read();
        self.inner.index.lookup(cid, oid)?;
        if oid.is_pgmeta() {
            self.inner.pgmeta.get_by_keys(oid, keys)
        } else {
            self.inner.omap.get_values(oid, keys)
        }
    }

    pub fn omap_check_keys(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        Ok(self.omap_get_values(cid, oid, keys)?.into_keys().collect())
    }
}

impl Drop for KilnStore {
    fn drop(&mut self) {
        self.umount();
    }
}

impl StoreInner {
    /// Submission path: reserve throttle, frame, allocate the seq, enqueue,
    /// hand to the journal.
    pub(crate) fn queue_transactions(
        self: &Arc<Self>,
        handle: Option<&SequencerHandle>,
        txns: Vec<Transaction>,
        callbacks: OpCallbacks,
    ) -> Result<()> {
        if !self.journal.is_writeable() {
            return Err(Error::Journal("journal is not writeable".into()));
        }
        let osr = match handle {
            Some(h) => Arc::clone(&h.osr),
            None => Arc::clone(&self.default_osr),
        };
        let wal = classify_wal(&txns);
        let op = Op::new(txns, wal, callbacks, &osr);

        let (max_ops, max_bytes) = self.effective_queue_limits();
        self.op_throttle.reserve(max_ops, max_bytes, op.num_bytes);
        self.journal.throttle();

        let payload = encode_txn_list(&op.txns);
        let entry = self.journal.prepare_entry(KIND_TXNS, &payload);

        let mut next = self.next_seq.lock();
        *next += 1;
        let seq = *next;
        op.set_seq(seq);
        self.apply_mgr.note_allocated(seq);
        self.apply_mgr.register(seq);
        self.maybe_dump_transactions(&op.txns, seq, &osr);
        debug!(
            "queue op seq {seq} on {osr:?} ({} ops, {} bytes, wal={wal})",
            op.num_ops, op.num_bytes
        );

        osr.queue_inq(seq);
        osr.queue_journal(seq);
        let weak = Arc::downgrade(self);
        let ack_op = Arc::clone(&op);
        let submitted = self.journal.submit_entry(
            seq,
            entry,
            Box::new(move || {
                if let Some(store) = weak.upgrade() {
                    store.journaled_written(&ack_op);
                }
            }),
        );
        if let Err(e) = submitted {
            // the journal died between the writeable check and here; unwind
            let _ = osr.dequeue_inq();
            let _ = osr.dequeue_journal();
            self.apply_mgr.op_done(seq);
            self.op_throttle.release(op.num_bytes);
            return Err(e);
        }
        osr.queue(op);
        self.apply_pool.queue(Arc::clone(&osr));
        drop(next);
        Ok(())
    }

    fn effective_queue_limits(&self) -> (u64, u64) {
        let t = self.tunables.lock();
        let mut max_ops = t.queue_max_ops;
        let mut max_bytes = t.queue_max_bytes;
        if self.backend.can_checkpoint() && self.apply_mgr.is_committing() {
            max_ops += t.queue_committing_max_ops;
            max_bytes += t.queue_committing_max_bytes;
        }
        (max_ops, max_bytes)
    }

    /// Journal durable-ack for one op: move it along, and once its apply
    /// pass is also done, queue it for the ack record.
    pub(crate) fn journaled_written(&self, op: &Arc<Op>) {
        let mut jwa = self.jwa.lock();
        match op.state() {
            OpState::Write => {
                op.set_state(OpState::Commit);
                jwa.queue.push_back(Arc::clone(op));
                self.jwa_cond.notify_one();
            }
            OpState::Init => {
                op.set_state(OpState::Journal);
            }
            other => {
                debug_assert!(false, "journal ack in state {other:?}");
            }
        }
        debug!("journaled seq {}", op.seq());
    }

    /// Ack-writer thread: batch journaled+applied ops into one consolidated
    /// ack record and journal it.
    pub(crate) fn jwa_entry(self: &Arc<Self>) {
        debug!("ack writer started");
        let mut jwa = self.jwa.lock();
        loop {
            if jwa.queue.is_empty() {
                if jwa.stop {
                    break;
                }
                self.jwa_cond.wait(&mut jwa);
                continue;
            }
            let batch: Vec<Arc<Op>> = jwa.queue.drain(..).collect();
            drop(jwa);

            let seqs: Vec<u64> = batch.iter().map(|o| o.seq()).collect();
            let payload = encode_ack_batch(&seqs);
            let entry = self.journal.prepare_entry(KIND_ACK_BATCH, &payload);
            {
                let mut next = self.next_seq.lock();
                *next += 1;
                let seq = *next;
                self.apply_mgr.note_allocated(seq);
                debug!("ack record seq {seq} covers {seqs:?}");
                let weak = Arc::downgrade(self);
                let r = self.journal.submit_entry(
                    seq,
                    entry,
                    Box::new(move || {
                        if let Some(store) = weak.upgrade() {
                            store.journaled_ack_written(&batch);
                        }
                    }),
                );
                if let Err(e) = r {
                    error!("ack record submission failed: {e}");
                }
            }
            jwa = self.jwa.lock();
        }
        drop(jwa);
        debug!("ack writer stopped");
    }

    /// The consolidated ack record is durable: ops move to ACK, requeue for
    /// their final pass, and ondisk completions fire.
    pub(crate) fn journaled_ack_written(&self, acks: &[Arc<Op>]) {
        for op in acks {
            let Some(osr) = op.sequencer() else {
                warn!("sequencer gone for acked seq {}", op.seq());
                continue;
            };
            {
                let _jwa = self.jwa.lock();
                debug_assert_eq!(op.state(), OpState::Commit);
                op.set_state(OpState::Ack);
            }
            debug!("ack durable for seq {} on {osr:?}", op.seq());
            let _ = osr.dequeue_journal();
            // ondisk goes to its finisher before the final pass can mark the
            // op done, so a flush that sees nothing in flight only has the
            // finisher queues left to wait for
            if let Some(ondisk) = op.take_ondisk() {
                let f = &self.ondisk_finishers[osr.id as usize % self.ondisk_finishers.len()];
                f.queue(ondisk);
            }
            osr.queue(Arc::clone(op));
            self.apply_pool.queue(Arc::clone(&osr));
        }
    }

    /// One apply-pool slot: run the front op of this sequencer through its
    /// next pass under the sequencer's apply lock.
    pub(crate) fn do_op(&self, osr: &Arc<OpSequencer>) {
        self.wbthrottle.throttle(osr.id as usize);
        let apply_guard = osr.apply_lock.lock();
        let op = osr.peek_queue();
        // the journal ack can land before the first apply pass runs, so a
        // fresh op may already sit in Journal rather than Init
        let entry_state = op.state();
        debug_assert!(matches!(
            entry_state,
            OpState::Init | OpState::Journal | OpState::Ack
        ));
        self.apply_mgr.begin_pass();

        let mode = match (entry_state, op.wal) {
            (OpState::Init | OpState::Journal, true) => Some(ApplyMode::Full),
            (OpState::Init | OpState::Journal, false) => Some(ApplyMode::DataPrefix),
            (OpState::Ack, false) => Some(ApplyMode::MetadataTail { touch_data: false }),
            (OpState::Ack, true) => None,
            _ => None,
        };
        if let Some(mode) = mode {
            let _paused = self.do_transactions(&op.txns, op.seq(), osr.id, mode);
            debug_assert!(!_paused || mode == ApplyMode::DataPrefix);
        }
        self.apply_mgr.end_pass();

        // finish: advance the state machine under the jwa lock
        let fully_done = {
            let mut jwa = self.jwa.lock();
            match op.state() {
                OpState::Init => {
                    op.set_state(OpState::Write);
                    false
                }
                OpState::Journal => {
                    op.set_state(OpState::Commit);
                    jwa.queue.push_back(Arc::clone(&op));
                    self.jwa_cond.notify_one();
                    false
                }
                OpState::Ack => true,
                other => {
                    debug_assert!(false, "finishing op in state {other:?}");
                    false
                }
            }
        };

        if !fully_done {
            let _ = osr.dequeue();
            drop(apply_guard);
            return;
        }

        op.set_state(OpState::Done);
        self.apply_mgr.op_done(op.seq());
        let _done = osr.dequeue();
        debug_assert!(Arc::ptr_eq(&_done, &op));
        if let Some(sync_cb) = op.take_onreadable_sync() {
            sync_cb(0);
        }
        self.op_throttle.release(op.num_bytes);
        if let Some(cb) = op.take_onreadable() {
            let f = &self.apply_finishers[osr.id as usize % self.apply_finishers.len()];
            f.queue(cb);
        }
        // the op leaves the in-flight queue only after its completions are
        // queued, so a drain that sees zero in flight has nothing left to wait
        // for beyond the finishers
        let inq = osr.dequeue_inq();
        debug_assert_eq!(inq, Some(op.seq()));
        drop(apply_guard);
        debug!("seq {} done on {osr:?}", op.seq());
    }

    /// Drain the pipeline: every submitted op reaches DONE and every
    /// completion has run.
    pub(crate) fn flush(&self) {
        loop {
            self.journal.flush();
            self.apply_pool.drain();
            let jwa_busy = !self.jwa.lock().queue.is_empty();
            let in_flight: usize =
                self.sequencers.all().iter().map(|o| o.in_flight()).sum();
            for f in self.ondisk_finishers.iter().chain(self.apply_finishers.iter()) {
                f.wait_for_empty();
            }
            if !jwa_busy && in_flight == 0 {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Countdown fault-injection hook; crossing zero kills the process.
    pub(crate) fn inject_failure(&self) {
        if self.kill_at.load(Ordering::SeqCst) > 0 {
            let left = self.kill_at.fetch_sub(1, Ordering::SeqCst) - 1;
            if left == 0 {
                error!("fault injection countdown hit zero; dying");
                std::process::abort();
            }
        }
    }

    pub(crate) fn write_op_seq(&self, seq: u64, sync: bool) -> Result<()> {
        let file = self.op_seq_file.lock();
        let text = format!("{seq}\n");
        file.set_len(0).map_err(|e| Error::from_io(e, "truncate commit_op_seq"))?;
        file.write_all_at(text.as_bytes(), 0)
            .map_err(|e| Error::from_io(e, "write commit_op_seq"))?;
        if sync {
            file.sync_all().map_err(|e| Error::from_io(e, "fsync commit_op_seq"))?;
        }
        Ok(())
    }

    pub(crate) fn maybe_dump_transactions(
        &self,
        txns: &[Transaction],
        seq: u64,
        osr: &Arc<OpSequencer>,
    ) {
        let mut dump = self.dump_file.lock();
        let Some(file) = dump.as_mut() else { return };
        for (trans_num, txn) in txns.iter().enumerate() {
            let record = serde_json::json!({
                "osr": osr.name,
                "seq": seq,
                "trans_num": trans_num,
                "transaction": txn.dump_json(),
            });
            if writeln!(file, "{record}").is_err() {
                warn!("transaction dump write failed; disabling dump");
                *dump = None;
                return;
            }
        }
    }

    pub(crate) fn dump_transaction_blob(&self, txn: &Transaction) {
        let mut dump = self.dump_file.lock();
        if let Some(file) = dump.as_mut() {
            let _ = writeln!(file, "{}", txn.dump_json());
            let _ = file.sync_all();
        }
    }

    pub(crate) fn reconfigure(&self, update: &ConfigUpdate) {
        {
            let mut t = self.tunables.lock();
            if let Some(v) = update.min_sync_interval {
                t.min_sync_interval = v;
            }
            if let Some(v) = update.max_sync_interval {
                t.max_sync_interval = v;
            }
            if let Some(v) = update.commit_timeout {
                t.commit_timeout = v;
            }
            if let Some(v) = update.queue_max_ops {
                t.queue_max_ops = v;
            }
            if let Some(v) = update.queue_max_bytes {
                t.queue_max_bytes = v;
            }
            if let Some(v) = update.queue_committing_max_ops {
                t.queue_committing_max_ops = v;
            }
            if let Some(v) = update.queue_committing_max_bytes {
                t.queue_committing_max_bytes = v;
            }
            if let Some(v) = update.fail_eio {
                t.fail_eio = v;
            }
            if let Some(v) = update.sloppy_crc {
                t.sloppy_crc = v;
            }
        }
        if let Some(v) = update.kill_at {
            self.kill_at.store(i64::from(v), Ordering::SeqCst);
        }
        if let Some(v) = update.fd_cache_size {
            self.fdcache.set_size(v);
        }
        {
            let mut limits = self.xattr_limits.lock();
            if let Some(v) = update.max_inline_xattr_size {
                limits.0 = v;
            }
            if let Some(v) = update.max_inline_xattr_count {
                limits.1 = v;
            }
        }
        if let Some(dump) = &update.dump_file {
            let mut slot = self.dump_file.lock();
            *slot = match dump {
                Some(path) => match File::create(path) {
                    Ok(f) => Some(f),
                    Err(e) => {
                        warn!("opening dump file failed: {e}");
                        None
                    }
                },
                None => None,
            };
        }
        info!("configuration updated");
    }
}

// ---- mount helpers ----

fn write_file_durable(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = File::create(path)
        .map_err(|e| Error::from_io(e, format!("create {}", path.display())))?;
    f.write_all(data)
        .map_err(|e| Error::from_io(e, format!("write {}", path.display())))?;
    f.sync_all()
        .map_err(|e| Error::from_io(e, format!("sync {}", path.display())))?;
    Ok(())
}

fn read_fsid_file(path: &Path) -> Result<Uuid> {
    let file = File::open(path).map_err(|e| Error::from_io(e, "open fsid"))?;
    read_fsid(&file)
}

/// ASCII uuid with trailing newline; a bare 16-byte value is the legacy form.
fn read_fsid(file: &File) -> Result<Uuid> {
    use std::io::{Read, Seek};
    let mut buf = Vec::new();
    let mut clone = file.try_clone().map_err(|e| Error::from_io(e, "dup fsid fd"))?;
    clone.rewind().map_err(|e| Error::from_io(e, "seek fsid"))?;
    clone.read_to_end(&mut buf).map_err(|e| Error::from_io(e, "read fsid"))?;
    if buf.len() == 16 {
        return Uuid::from_slice(&buf).map_err(|_| Error::Corrupt("bad legacy fsid".into()));
    }
    let text = String::from_utf8_lossy(&buf);
    text.trim()
        .parse::<Uuid>()
        .map_err(|_| Error::Corrupt(format!("unparsable fsid {:?}", text.trim())))
}

fn check_version_stamp(base: &Path, update_to: u32) -> Result<()> {
    let raw = std::fs::read(base.join("store_version"))
        .map_err(|e| Error::from_io(e, "read store_version"))?;
    if raw.len() < 4 {
        return Err(Error::Corrupt("short store_version".into()));
    }
    let stored = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    if stored == STORE_VERSION {
        return Ok(());
    }
    if stored > STORE_VERSION {
        return Err(Error::Incompatible(format!(
            "on-disk version {stored} is newer than supported {STORE_VERSION}"
        )));
    }
    if update_to >= STORE_VERSION {
        warn!("upgrading store version stamp {stored} -> {STORE_VERSION}");
        write_file_durable(&base.join("store_version"), &STORE_VERSION.to_le_bytes())?;
        return Ok(());
    }
    Err(Error::Incompatible(format!(
        "stale version stamp {stored}; set update_to to {STORE_VERSION} to upgrade"
    )))
}

/// Write xattrs and read them back so a filesystem without them fails the
/// mount instead of the first transaction.
fn probe_xattrs(current_dir: &Path) -> Result<()> {
    let path = current_dir.join(".xattr_probe");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| Error::from_io(e, "open xattr probe"))?;
    let value = vec![0x5au8; fs_util::XATTR_BLOCK_LEN + 128];
    let result = (|| -> Result<()> {
        fs_util::chain_setxattr(&file, "user.cephos.probe", &value)?;
        let back = fs_util::chain_getxattr(&file, "user.cephos.probe")?;
        if back != value {
            return Err(Error::Incompatible("xattr probe read back wrong data".into()));
        }
        Ok(())
    })();
    drop(file);
    let _ = std::fs::remove_file(&path);
    result.map_err(|e| Error::Incompatible(format!("filesystem cannot hold xattrs: {e}")))
}

fn resolve_xattr_limits(config: &StoreConfig, fs_type: i64) -> (usize, usize) {
    let x = &config.xattr;
    let (fs_size, fs_count) = match fs_type {
        XFS_SUPER_MAGIC => (x.max_inline_size_xfs, x.max_inline_count_xfs),
        BTRFS_SUPER_MAGIC => (x.max_inline_size_btrfs, x.max_inline_count_btrfs),
        _ => (x.max_inline_size_other, x.max_inline_count_other),
    };
    let size = if x.max_inline_size != 0 { x.max_inline_size } else { fs_size };
    let count = if x.max_inline_count != 0 { x.max_inline_count } else { fs_count };
    (size, count)
}

/// Checkpoint enumeration and rollback policy. With a checkpointing backend
/// the newest commit snapshot is rolled back to unless `nosnap` forbids it;
/// without one, rollback requests refuse the mount and the `nosnap`
/// sentinel is (re)created.
fn handle_checkpoints(
    backend: &dyn FsBackend,
    config: &StoreConfig,
    current_dir: &Path,
) -> Result<()> {
    let nosnap = current_dir.join("nosnap");
    if !backend.can_checkpoint() {
        if let Some(name) = &config.rollback_to_cluster_snap {
            return Err(Error::Unsupported(format!(
                "rollback to snapshot {name} requires a checkpointing backend"
            )));
        }
        // protect against a later rollback throwing away this data
        if !nosnap.exists() {
            write_file_durable(&nosnap, b"")?;
        }
        return Ok(());
    }

    let mut commit_snaps: Vec<u64> = Vec::new();
    let mut cluster_snaps: BTreeSet<String> = BTreeSet::new();
    for name in backend.list_checkpoints()? {
        if let Some(seq) = name.strip_prefix("snap_").and_then(|s| s.parse::<u64>().ok()) {
            commit_snaps.push(seq);
        } else if let Some(rest) = name.strip_prefix("clustersnap_") {
            cluster_snaps.insert(rest.to_string());
        }
    }
    commit_snaps.sort_unstable();

    if let Some(name) = &config.rollback_to_cluster_snap {
        if !cluster_snaps.contains(name) {
            return Err(Error::NotFound(format!("cluster snapshot {name}")));
        }
        warn!("rolling back to cluster snapshot {name}");
        return backend.rollback_to(&format!("clustersnap_{name}"));
    }

    if let Some(&newest) = commit_snaps.last() {
        if nosnap.exists() && !config.use_stale_snap {
            return Err(Error::Unsupported(
                "nosnap is set; refusing rollback that would lose new data".into(),
            ));
        }
        if nosnap.exists() {
            warn!("forced use of stale snapshot snap_{newest}");
        }
        info!("rolling back to consistent checkpoint snap_{newest}");
        backend.rollback_to(&format!("snap_{newest}"))?;
    } else {
        warn!("no consistent checkpoints found; store may be inconsistent");
    }
    let _ = std::fs::remove_file(&nosnap);
    Ok(())
}

fn read_op_seq(file: &File) -> Result<u64> {
    use std::io::Read;
    let mut clone = file.try_clone().map_err(|e| Error::from_io(e, "dup op_seq fd"))?;
    let mut text = String::new();
    clone
        .read_to_string(&mut text)
        .map_err(|e| Error::from_io(e, "read commit_op_seq"))?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| Error::Corrupt(format!("unparsable commit_op_seq {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyMode;
    use std::sync::mpsc;
    use tempfile::TempDir;

    // tmpfs on older kernels rejects user.* xattrs and the mount probe would
    // refuse it, so test stores live under the crate directory.
    fn store_dir() -> TempDir {
        tempfile::Builder::new()
            .prefix("kiln-store-test")
            .tempdir_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap()
    }

    fn test_config(dir: &TempDir) -> StoreConfig {
        let mut config = StoreConfig::new(dir.path());
        config.sync.min_interval = Duration::from_millis(20);
        config.sync.max_interval = Duration::from_millis(200);
        config.journal.size = 8 << 20;
        config
    }

    fn mounted(dir: &TempDir) -> KilnStore {
        let config = test_config(dir);
        KilnStore::mkfs(&config).unwrap();
        KilnStore::mount(config).unwrap()
    }

    fn mkcoll(store: &KilnStore, cid: &CollectionId) {
        let mut t = Transaction::new();
        t.create_collection(cid);
        store.apply_transaction(None, t).unwrap();
    }

    #[test]
    fn test_mkfs_and_remount_keep_identity() {
        let dir = store_dir();
        let config = test_config(&dir);
        KilnStore::mkfs(&config).unwrap();

        let fsid = {
            let store = KilnStore::mount(config.clone()).unwrap();
            let fsid = store.fsid();
            assert!(store.committed_seq() >= 1);
            store.umount();
            fsid
        };
        // mkfs over an existing store must not reformat it
        KilnStore::mkfs(&config).unwrap();
        let store = KilnStore::mount(config).unwrap();
        assert_eq!(store.fsid(), fsid);
    }

    #[test]
    fn test_double_mount_is_busy() {
        let dir = store_dir();
        let store = mounted(&dir);
        let err = KilnStore::mount(test_config(&dir)).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        drop(store);
    }

    #[test]
    fn test_write_then_read() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        mkcoll(&store, &cid);

        let mut t = Transaction::new();
        t.write(&cid, &oid, 0, Bytes::from_static(b"hello kiln"), 0);
        store.apply_transaction(None, t).unwrap();

        assert_eq!(store.read(&cid, &oid, 0, 0).unwrap(), Bytes::from_static(b"hello kiln"));
        assert_eq!(store.read(&cid, &oid, 6, 4).unwrap(), Bytes::from_static(b"kiln"));
        assert_eq!(store.stat(&cid, &oid).unwrap(), 10);
        assert!(store.exists(&cid, &oid));
    }

    #[test]
    fn test_journal_authoritative_bundle() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        mkcoll(&store, &cid);

        // touch-first makes this bundle journal-authoritative
        let mut t = Transaction::new();
        t.touch(&cid, &oid)
            .write(&cid, &oid, 0, Bytes::from_static(b"abcd"), 0)
            .setattr(&cid, &oid, "k", Bytes::from_static(b"v"));
        store.apply_transaction(None, t).unwrap();

        assert_eq!(store.read(&cid, &oid, 0, 0).unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(store.getattr(&cid, &oid, "k").unwrap(), Bytes::from_static(b"v"));
    }

    #[test]
    fn test_per_sequencer_completion_order() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        mkcoll(&store, &cid);
        let seq = store.sequencer("osd.0");

        let (readable_tx, readable_rx) = mpsc::channel();
        let (disk_tx, disk_rx) = mpsc::channel();
        let n = 16;
        for i in 0..n {
            let oid = ObjectId::new(format!("obj{i}"), 0, 0);
            let mut t = Transaction::new();
            t.write(&cid, &oid, 0, Bytes::from(vec![i as u8; 64]), 0);
            let rt = readable_tx.clone();
            let dt = disk_tx.clone();
            store
                .queue_transactions(
                    Some(&seq),
                    vec![t],
                    OpCallbacks {
                        ondisk: Some(Box::new(move |_| {
                            let _ = dt.send(i);
                        })),
                        onreadable: Some(Box::new(move |_| {
                            let _ = rt.send(i);
                        })),
                        onreadable_sync: None,
                    },
                )
                .unwrap();
        }
        store.flush();

        let readable: Vec<usize> = readable_rx.try_iter().collect();
        let disk: Vec<usize> = disk_rx.try_iter().collect();
        assert_eq!(readable, (0..n).collect::<Vec<_>>());
        assert_eq!(disk, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_xattr_spill_roundtrip() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        mkcoll(&store, &cid);

        // small value stays inline; a large one spills to the object map
        let big = Bytes::from(vec![0x42u8; 100_000]);
        let mut t = Transaction::new();
        t.touch(&cid, &oid)
            .setattr(&cid, &oid, "small", Bytes::from_static(b"inline"))
            .setattr(&cid, &oid, "big", big.clone());
        store.apply_transaction(None, t).unwrap();

        assert_eq!(store.getattr(&cid, &oid, "small").unwrap(), Bytes::from_static(b"inline"));
        assert_eq!(store.getattr(&cid, &oid, "big").unwrap(), big);
        let all = store.getattrs(&cid, &oid).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["big"], big);

        let mut t = Transaction::new();
        t.rmattr(&cid, &oid, "big").rmattr(&cid, &oid, "small");
        store.apply_transaction(None, t).unwrap();
        assert!(store.getattr(&cid, &oid, "big").unwrap_err().is_no_data());
        assert!(store.getattr(&cid, &oid, "small").unwrap_err().is_no_data());
        assert!(store.getattrs(&cid, &oid).unwrap().is_empty());
    }

    #[test]
    fn test_clone_equivalence() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let src = ObjectId::new("src", 0, 0);
        let dst = ObjectId::new("dst", 0, 0);
        mkcoll(&store, &cid);

        let payload = Bytes::from(vec![7u8; 8192]);
        let mut t = Transaction::new();
        t.write(&cid, &src, 0, payload.clone(), 0)
            .setattr(&cid, &src, "k", Bytes::from_static(b"v"))
            .setattr(&cid, &src, "huge", Bytes::from(vec![9u8; 50_000]));
        store.apply_transaction(None, t).unwrap();

        let mut t = Transaction::new();
        t.clone_object(&cid, &src, &dst);
        store.apply_transaction(None, t).unwrap();

        assert_eq!(store.read(&cid, &dst, 0, 0).unwrap(), store.read(&cid, &src, 0, 0).unwrap());
        assert_eq!(store.getattrs(&cid, &dst).unwrap(), store.getattrs(&cid, &src).unwrap());
    }

    #[test]
    fn test_zero_and_truncate() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        mkcoll(&store, &cid);

        let mut t = Transaction::new();
        t.write(&cid, &oid, 0, Bytes::from(vec![0xffu8; 4096]), 0)
            .zero(&cid, &oid, 1024, 512)
            .truncate(&cid, &oid, 2048);
        store.apply_transaction(None, t).unwrap();

        let data = store.read(&cid, &oid, 0, 0).unwrap();
        assert_eq!(data.len(), 2048);
        assert!(data[1024..1536].iter().all(|&b| b == 0));
        assert!(data[..1024].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_omap_roundtrip() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        mkcoll(&store, &cid);

        let mut t = Transaction::new();
        t.touch(&cid, &oid)
            .omap_setheader(&cid, &oid, Bytes::from_static(b"hdr"))
            .omap_setkeys(
                &cid,
                &oid,
                [
                    ("a".to_string(), Bytes::from_static(b"1")),
                    ("b".to_string(), Bytes::from_static(b"2")),
                    ("c".to_string(), Bytes::from_static(b"3")),
                ]
                .into(),
            )
            .omap_rmkeys(&cid, &oid, ["b".to_string()].into());
        store.apply_transaction(None, t).unwrap();

        let (header, map) = store.omap_get(&cid, &oid).unwrap();
        assert_eq!(header.unwrap(), Bytes::from_static(b"hdr"));
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], Bytes::from_static(b"1"));
        assert!(!map.contains_key("b"));

        let mut t = Transaction::new();
        t.omap_rmkeyrange(&cid, &oid, "a", "c").omap_clear(&cid, &oid);
        store.apply_transaction(None, t).unwrap();
        let (header, map) = store.omap_get(&cid, &oid).unwrap();
        assert!(header.is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_pgmeta_reads_merge_pending() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::pgmeta("pgmeta", 0, 0);
        mkcoll(&store, &cid);

        let mut t = Transaction::new();
        t.touch(&cid, &oid).omap_setkeys(
            &cid,
            &oid,
            [("k1".to_string(), Bytes::from_static(b"v1"))].into(),
        );
        store.apply_transaction(None, t).unwrap();

        // pending state serves reads before any commit flushes it
        let (_, map) = store.omap_get(&cid, &oid).unwrap();
        assert_eq!(map["k1"], Bytes::from_static(b"v1"));

        store.sync();
        let (_, map) = store.omap_get(&cid, &oid).unwrap();
        assert_eq!(map["k1"], Bytes::from_static(b"v1"));
        // after the commit the object map itself holds the keys
        assert_eq!(
            store.inner.omap.get_keys(&oid).unwrap(),
            vec!["k1".to_string()]
        );
    }

    #[test]
    fn test_remount_durability_and_commit_monotonicity() {
        let dir = store_dir();
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        let committed_before;
        {
            let store = mounted(&dir);
            mkcoll(&store, &cid);
            let mut t = Transaction::new();
            t.write(&cid, &oid, 0, Bytes::from_static(b"durable"), 0)
                .setattr(&cid, &oid, "k", Bytes::from_static(b"v"));
            store.apply_transaction(None, t).unwrap();
            store.sync();
            committed_before = store.committed_seq();
            assert!(committed_before > 1);
            store.umount();
        }
        let store = KilnStore::mount(test_config(&dir)).unwrap();
        assert_eq!(store.read(&cid, &oid, 0, 0).unwrap(), Bytes::from_static(b"durable"));
        assert_eq!(store.getattr(&cid, &oid, "k").unwrap(), Bytes::from_static(b"v"));
        // the persisted op_seq covers everything acknowledged before shutdown
        assert!(store.committed_seq() >= committed_before);
    }

    #[test]
    fn test_commit_cadence_advances_op_seq() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        mkcoll(&store, &cid);
        let before = read_op_seq(&store.inner.op_seq_file.lock()).unwrap();

        let mut t = Transaction::new();
        t.touch(&cid, &ObjectId::new("obj", 0, 0));
        store.apply_transaction(None, t).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let now = read_op_seq(&store.inner.op_seq_file.lock()).unwrap();
            if now > before {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "op_seq never advanced");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_replay_after_crash_mid_journal_authoritative_op() {
        let dir = store_dir();
        let config = test_config(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        {
            let store = mounted(&dir);
            mkcoll(&store, &cid);
            store.umount();
        }

        // hand-write a journal entry the way a crashed store would leave it:
        // journaled and acknowledged, but never applied or committed
        {
            let fsid = read_fsid_file(&dir.path().join("fsid")).unwrap();
            let journal = FileJournal::open(&config.journal_file(), fsid, &config.journal).unwrap();
            let committed = journal.committed_seq();
            let mut t = Transaction::new();
            t.touch(&cid, &oid)
                .write(&cid, &oid, 0, Bytes::from_static(b"abcd"), 0)
                .setattr(&cid, &oid, "k", Bytes::from_static(b"v"));
            let payload = encode_txn_list(&[t]);
            let entry = journal.prepare_entry(KIND_TXNS, &payload);
            journal.start();
            let (tx, rx) = mpsc::channel();
            journal
                .submit_entry(committed + 1, entry, Box::new(move || tx.send(()).unwrap()))
                .unwrap();
            rx.recv().unwrap();
            journal.stop();
        }

        let store = KilnStore::mount(config).unwrap();
        assert_eq!(store.read(&cid, &oid, 0, 0).unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(store.getattr(&cid, &oid, "k").unwrap(), Bytes::from_static(b"v"));
    }

    #[test]
    fn test_replay_after_crash_mid_write_ahead_data_op() {
        let dir = store_dir();
        let config = test_config(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        {
            let store = mounted(&dir);
            mkcoll(&store, &cid);
            store.umount();
        }

        // a lone write classifies as write-ahead-data; with no ack record in
        // the journal the data pass never became durable
        {
            let fsid = read_fsid_file(&dir.path().join("fsid")).unwrap();
            let journal = FileJournal::open(&config.journal_file(), fsid, &config.journal).unwrap();
            let committed = journal.committed_seq();
            let mut t = Transaction::new();
            t.write(&cid, &oid, 0, Bytes::from(vec![0xa5u8; 100_000]), 0);
            let payload = encode_txn_list(&[t]);
            let entry = journal.prepare_entry(KIND_TXNS, &payload);
            journal.start();
            let (tx, rx) = mpsc::channel();
            journal
                .submit_entry(committed + 1, entry, Box::new(move || tx.send(()).unwrap()))
                .unwrap();
            rx.recv().unwrap();
            journal.stop();
        }

        let store = KilnStore::mount(config).unwrap();
        // the object exists (touched) but carries none of the lost data
        assert!(store.exists(&cid, &oid));
        assert_eq!(store.stat(&cid, &oid).unwrap(), 0);
    }

    #[test]
    fn test_rename_replay_is_idempotent() {
        let dir = store_dir();
        let mut config = test_config(&dir);
        // keep the periodic commit out of the way; explicit syncs still work
        config.sync.max_interval = Duration::from_secs(3600);
        KilnStore::mkfs(&config).unwrap();
        let store = KilnStore::mount(config).unwrap();

        let c1 = CollectionId::new("c1");
        let c2 = CollectionId::new("c2");
        let o1 = ObjectId::new("o1", 0, 0);
        let o2 = ObjectId::new("o2", 0, 0);
        mkcoll(&store, &c1);
        mkcoll(&store, &c2);
        let mut t = Transaction::new();
        t.write(&c1, &o1, 0, Bytes::from_static(b"payload"), 0);
        store.apply_transaction(None, t).unwrap();
        store.flush();

        // replay the same rename+setattr stream twice, as a crashed journal
        // would after two failed mounts
        let mut rename = Transaction::new();
        rename.collection_move_rename(&c1, &o1, &c2, &o2);
        let mut setattr = Transaction::new();
        setattr.setattr(&c2, &o2, "k", Bytes::from_static(b"v"));
        let txns = vec![rename, setattr];
        let seq = *store.inner.next_seq.lock() + 1;

        store.inner.replaying.store(true, Ordering::SeqCst);
        store.inner.omap.set_replay_gating(true);
        for _ in 0..2 {
            let paused = store.inner.do_transactions(&txns, seq, 0, ApplyMode::Full);
            assert!(!paused);
        }
        store.inner.omap.set_replay_gating(false);
        store.inner.replaying.store(false, Ordering::SeqCst);

        assert!(!store.exists(&c1, &o1));
        assert_eq!(store.read(&c2, &o2, 0, 0).unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(store.getattr(&c2, &o2, "k").unwrap(), Bytes::from_static(b"v"));
    }

    #[test]
    fn test_collection_lifecycle_and_split() {
        let dir = store_dir();
        let store = mounted(&dir);
        let src = CollectionId::new("src");
        let dst = CollectionId::new("dst");
        mkcoll(&store, &src);
        mkcoll(&store, &dst);
        assert_eq!(store.list_collections().unwrap(), vec![dst.clone(), src.clone()]);

        let oids: Vec<ObjectId> = (0..16).map(|i| ObjectId::new(format!("o{i}"), 0, 0)).collect();
        let mut t = Transaction::new();
        for oid in &oids {
            t.touch(&src, oid);
        }
        store.apply_transaction(None, t).unwrap();

        let mut t = Transaction::new();
        t.split_collection(&src, 1, 0, &dst);
        store.apply_transaction(None, t).unwrap();

        let stayed = store.collection_list(&src).unwrap();
        let moved = store.collection_list(&dst).unwrap();
        assert_eq!(stayed.len() + moved.len(), oids.len());
        assert!(stayed.iter().all(|o| !o.match_split(1, 0)));
        assert!(moved.iter().all(|o| o.match_split(1, 0)));

        // an emptied collection can be removed
        let gone = CollectionId::new("gone");
        mkcoll(&store, &gone);
        let mut t = Transaction::new();
        t.remove_collection(&gone);
        store.apply_transaction(None, t).unwrap();
        assert!(!store.collection_exists(&gone));
    }

    #[test]
    fn test_remove_clears_object_state() {
        let dir = store_dir();
        let store = mounted(&dir);
        let cid = CollectionId::new("c1");
        let oid = ObjectId::new("obj", 0, 0);
        mkcoll(&store, &cid);

        let mut t = Transaction::new();
        t.write(&cid, &oid, 0, Bytes::from_static(b"data"), 0).omap_setkeys(
            &cid,
            &oid,
            [("k".to_string(), Bytes::from_static(b"v"))].into(),
        );
        store.apply_transaction(None, t).unwrap();

        let mut t = Transaction::new();
        t.remove(&cid, &oid);
        store.apply_transaction(None, t).unwrap();

        assert!(!store.exists(&cid, &oid));
        // the omap went with the last link
        assert!(store.inner.omap.get_keys(&oid).unwrap().is_empty());
    }

    #[test]
    fn test_reconfigure_applies_tunables() {
        let dir = store_dir();
        let store = mounted(&dir);
        let update = ConfigUpdate {
            queue_max_ops: Some(7),
            max_inline_xattr_size: Some(64),
            fd_cache_size: Some(4),
            ..Default::default()
        };
        store.reconfigure(&update);
        assert_eq!(store.inner.tunables.lock().queue_max_ops, 7);
        assert_eq!(store.inner.xattr_limits.lock().0, 64);
    }

    #[test]
    fn test_snapshot_refused_without_checkpoints() {
        let dir = store_dir();
        let store = mounted(&dir);
        assert!(matches!(store.snapshot("weekly"), Err(Error::Unsupported(_))));
    }
}
