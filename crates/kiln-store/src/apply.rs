//! Transaction decoding and application
//!
//! Walks an op's opcode stream and turns each opcode into filesystem and
//! object-map primitives. The same walker serves the live apply passes and
//! journal replay; an `ApplyMode` selects which opcodes run:
//!
//! - `Full`: every opcode (journal-authoritative ops, and their replay)
//! - `DataPrefix`: run up to and including the first data opcode, then pause
//!   (first pass of a write-ahead-data op)
//! - `MetadataTail`: skip data opcodes (optionally degrading the write to a
//!   touch) and run the rest (final pass of a write-ahead-data op, and its
//!   replay)
//!
//! Replay guards gate non-idempotent opcodes during replay; the error
//! tolerance table decides which failures replay may shrug off. Anything
//! else dumps the offending transaction and aborts before partial state can
//! spread.

use crate::backend::copy_range_best;
use crate::fdcache::FdRef;
use crate::fs_util;
use crate::guard::{
    check_guard, decode_guard, encode_guard, GuardCheck, GLOBAL_REPLAY_GUARD_XATTR,
    REPLAY_GUARD_XATTR, SPILL_OUT_NO, SPILL_OUT_XATTR, SPILL_OUT_YES,
};
use crate::store::StoreInner;
use crate::transaction::{Transaction, TxOp, WRITE_FLAG_DONTNEED};
use bytes::Bytes;
use kiln_common::{CollectionId, Error, ObjectId, Result, SeqPosition};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Which opcodes of a bundle an apply pass executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyMode {
    Full,
    DataPrefix,
    MetadataTail { touch_data: bool },
}

impl StoreInner {
    /// Apply a transaction list at `seq`. Returns true when a `DataPrefix`
    /// pass paused at its data opcode.
    pub(crate) fn do_transactions(
        &self,
        txns: &[Transaction],
        seq: u64,
        osr_id: u64,
        mode: ApplyMode,
    ) -> bool {
        for (trans_num, txn) in txns.iter().enumerate() {
            let paused = self.do_transaction(txn, seq, trans_num as u32, osr_id, mode);
            if paused {
                debug_assert_eq!(trans_num, 0);
                return true;
            }
        }
        false
    }

    fn do_transaction(
        &self,
        txn: &Transaction,
        seq: u64,
        trans_num: u32,
        osr_id: u64,
        mode: ApplyMode,
    ) -> bool {
        let ops = txn.ops();
        let mut i = 0;
        let mut op_num = 0u32;
        while i < ops.len() {
            let op = &ops[i];
            let spos = SeqPosition::new(seq, trans_num, op_num);
            self.inject_failure();

            let run = match mode {
                ApplyMode::Full | ApplyMode::DataPrefix => true,
                ApplyMode::MetadataTail { touch_data } => {
                    if op.is_data_op() {
                        if touch_data {
                            if let TxOp::Write { cid, oid, .. } = op {
                                if self.check_object_guard(cid, oid, &spos).should_apply() {
                                    self.report_apply_error(self.touch(cid, oid), op, txn, &spos);
                                }
                            }
                        }
                        false
                    } else {
                        true
                    }
                }
            };

            if run {
                // a paired add/remove spans two positions
                if let TxOp::CollAdd { cid, src_cid, oid } = op {
                    let followed = matches!(
                        ops.get(i + 1),
                        Some(TxOp::CollRemove { cid: rc, oid: ro }) if rc == src_cid && ro == oid
                    );
                    assert!(followed, "coll_add without its paired coll_remove");
                    let r = self.collection_add(cid, src_cid, oid, &spos);
                    let failed = r.is_err();
                    self.report_apply_error(r, op, txn, &spos);
                    op_num += 1;
                    if !failed {
                        let rm_spos = SeqPosition::new(seq, trans_num, op_num);
                        if self.check_object_guard(src_cid, oid, &rm_spos).should_apply() {
                            let r = self.remove(src_cid, oid, &rm_spos, osr_id, false);
                            self.report_apply_error(r, &ops[i + 1], txn, &rm_spos);
                        }
                    }
                    i += 2;
                    op_num += 1;
                    continue;
                }

                let r = self.apply_one(op, &spos, osr_id);
                self.report_apply_error(r, op, txn, &spos);
            }

            if matches!(mode, ApplyMode::DataPrefix) && op.is_data_op() {
                // data is on disk; the metadata tail waits for the journal
                return true;
            }
            i += 1;
            op_num += 1;
        }
        self.inject_failure();
        false
    }

    fn apply_one(&self, op: &TxOp, spos: &SeqPosition, osr_id: u64) -> Result<()> {
        match op {
            TxOp::Nop | TxOp::TrimCache | TxOp::WriteAhead => Ok(()),
            TxOp::StartSync => {
                // with a journal in front, a sync marker has nothing to do
                debug!("startsync is a no-op under journaling");
                Ok(())
            }
            TxOp::Touch { cid, oid } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.touch(cid, oid)
                } else {
                    Ok(())
                }
            }
            TxOp::Write { cid, oid, offset, data, flags } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.write(cid, oid, *offset, data, *flags, osr_id)
                } else {
                    Ok(())
                }
            }
            TxOp::Zero { cid, oid, offset, len } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.zero(cid, oid, *offset, *len, osr_id)
                } else {
                    Ok(())
                }
            }
            TxOp::Truncate { cid, oid, size } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.truncate(cid, oid, *size)
                } else {
                    Ok(())
                }
            }
            TxOp::Remove { cid, oid } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.remove(cid, oid, spos, osr_id, false)
                } else {
                    Ok(())
                }
            }
            TxOp::SetAttr { cid, oid, name, value } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    let mut attrs = BTreeMap::new();
                    attrs.insert(name.clone(), value.clone());
                    self.setattrs(cid, oid, &attrs, spos)
                } else {
                    Ok(())
                }
            }
            TxOp::SetAttrs { cid, oid, attrs } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.setattrs(cid, oid, attrs, spos)
                } else {
                    Ok(())
                }
            }
            TxOp::RmAttr { cid, oid, name } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.rmattr(cid, oid, name, spos)
                } else {
                    Ok(())
                }
            }
            TxOp::RmAttrs { cid, oid } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.rmattrs(cid, oid, spos)
                } else {
                    Ok(())
                }
            }
            TxOp::Clone { cid, src, dst } => self.clone_object(cid, src, dst, spos),
            TxOp::CloneRange { cid, src, dst, offset, len } => {
                self.clone_range(cid, src, dst, *offset, *len, *offset, spos)
            }
            TxOp::CloneRange2 { cid, src, dst, src_offset, len, dst_offset } => {
                self.clone_range(cid, src, dst, *src_offset, *len, *dst_offset, spos)
            }
            TxOp::MkColl { cid } => {
                if self.check_collection_guard(cid, spos).should_apply() {
                    self.create_collection(cid, spos)
                } else {
                    Ok(())
                }
            }
            TxOp::RmColl { cid } => {
                if self.check_collection_guard(cid, spos).should_apply() {
                    self.destroy_collection(cid)
                } else {
                    Ok(())
                }
            }
            TxOp::CollRemove { cid, oid } => {
                // normally consumed with its paired add; alone it is a remove
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.remove(cid, oid, spos, osr_id, false)
                } else {
                    Ok(())
                }
            }
            TxOp::CollAdd { .. } => unreachable!("handled with its paired remove"),
            TxOp::CollMove { cid, src_cid, oid } => {
                self.collection_add(cid, src_cid, oid, spos)?;
                if self.check_object_guard(src_cid, oid, spos).should_apply() {
                    self.remove(src_cid, oid, spos, osr_id, false)?;
                }
                Ok(())
            }
            TxOp::CollMoveRename { src_cid, src_oid, dst_cid, dst_oid } => {
                self.collection_move_rename(src_cid, src_oid, dst_cid, dst_oid, spos, osr_id)
            }
            TxOp::CollSetAttr { cid, name, value } => {
                if self.check_collection_guard(cid, spos).should_apply() {
                    self.collection_setattr(cid, name, value)
                } else {
                    Ok(())
                }
            }
            TxOp::CollRmAttr { cid, name } => {
                if self.check_collection_guard(cid, spos).should_apply() {
                    self.collection_rmattr(cid, name)
                } else {
                    Ok(())
                }
            }
            TxOp::CollRename { cid } => {
                Err(Error::Unsupported(format!("coll_rename {cid}")))
            }
            TxOp::CollHint { cid, hint_type, data } => {
                if self.check_collection_guard(cid, spos).should_apply() {
                    self.collection_hint(cid, *hint_type, data)
                } else {
                    Ok(())
                }
            }
            TxOp::OmapClear { cid, oid } => self.omap_clear_op(cid, oid, spos),
            TxOp::OmapSetKeys { cid, oid, kvs } => self.omap_setkeys_op(cid, oid, kvs, spos),
            TxOp::OmapRmKeys { cid, oid, keys } => self.omap_rmkeys_op(cid, oid, keys, spos),
            TxOp::OmapRmKeyRange { cid, oid, first, last } => {
                self.omap_rmkeyrange_op(cid, oid, first, last, spos)
            }
            TxOp::OmapSetHeader { cid, oid, data } => {
                self.omap_setheader_op(cid, oid, data, spos)
            }
            TxOp::PgMetaWrite { cid, oid, kvs } => {
                // replay-only path: straight to the object map
                self.index.lookup(cid, oid)?;
                self.omap.set_keys(oid, kvs, Some(spos))?;
                Ok(())
            }
            TxOp::SplitCollection { cid, bits, rem, dest } => {
                self.split_collection_create(cid, *bits, *rem, dest, spos)
            }
            TxOp::SplitCollection2 { cid, bits, rem, dest } => {
                self.split_collection(cid, *bits, *rem, dest, spos)
            }
            TxOp::SetAllocHint { cid, oid, expected_object_size, expected_write_size } => {
                if self.check_object_guard(cid, oid, spos).should_apply() {
                    self.set_alloc_hint(cid, oid, *expected_object_size, *expected_write_size)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Classify an apply failure; anything not tolerated aborts the process
    /// after dumping the transaction.
    fn report_apply_error(
        &self,
        r: Result<()>,
        op: &TxOp,
        txn: &Transaction,
        spos: &SeqPosition,
    ) {
        let Err(e) = r else { return };
        if self.error_tolerated(&e, op) {
            debug!("tolerating {e} on {} at {spos}", op.name());
            return;
        }
        self.fatal_apply_error(&e, op, txn, spos);
    }

    fn error_tolerated(&self, e: &Error, op: &TxOp) -> bool {
        let clone_family = matches!(
            op,
            TxOp::Clone { .. }
                | TxOp::CloneRange { .. }
                | TxOp::CloneRange2 { .. }
                | TxOp::CollAdd { .. }
        );
        if e.is_not_found() && !clone_family {
            return true;
        }
        if e.is_no_data() {
            return true;
        }
        if matches!(op, TxOp::SetAllocHint { .. }) {
            // advisory: unsupported or invalid hints are fine
            return true;
        }
        if self.is_replaying() && !self.backend.can_checkpoint() {
            if e.is_not_found() {
                return true;
            }
            if matches!(e, Error::Range(_)) {
                return true;
            }
            if e.is_exists()
                && matches!(
                    op,
                    TxOp::MkColl { .. }
                        | TxOp::CollAdd { .. }
                        | TxOp::CollMove { .. }
                        | TxOp::SplitCollection { .. }
                )
            {
                return true;
            }
        }
        if e.is_eio() && !self.tunables.lock().fail_eio {
            warn!("tolerating EIO on {}", op.name());
            return true;
        }
        false
    }

    fn fatal_apply_error(&self, e: &Error, op: &TxOp, txn: &Transaction, spos: &SeqPosition) -> ! {
        let msg = match e {
            Error::NoSpace => "ENOSPC: stopping before a partial apply can spread",
            Error::NotFound(_) => "unexpected missing object on a clone-family op",
            _ => "unexpected error applying transaction",
        };
        tracing::error!(
            "{msg}: {e} on {} at {spos}\ntransaction dump: {}",
            op.name(),
            txn.dump_json()
        );
        self.dump_transaction_blob(txn);
        std::process::abort();
    }

    // ---- replay guards ----

    /// Stamp the store-wide guard (on the data root) after forcing
    /// everything before it to disk. Split operations stamp this.
    pub(crate) fn set_global_replay_guard(&self, cid: &CollectionId, spos: &SeqPosition) {
        if self.backend.can_checkpoint() {
            return;
        }
        if let Err(e) = self.backend.syncfs() {
            tracing::error!("syncfs before global guard on {cid} failed: {e}");
            std::process::abort();
        }
        let dir = match File::open(&self.current_dir) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("open data root for global guard failed: {e}");
                std::process::abort();
            }
        };
        self.inject_failure();
        let v = spos.to_bytes();
        if let Err(e) = fs_util::fsetxattr(&dir, GLOBAL_REPLAY_GUARD_XATTR, &v) {
            tracing::error!("stamping global guard failed: {e}");
            std::process::abort();
        }
        let _ = dir.sync_all();
        self.inject_failure();
        debug!("global guard now {spos}");
    }

    fn check_global_replay_guard(&self, spos: &SeqPosition) -> GuardCheck {
        if !self.is_replaying() || self.backend.can_checkpoint() {
            return GuardCheck::Replay;
        }
        let Ok(dir) = File::open(&self.current_dir) else {
            return GuardCheck::Replay;
        };
        match fs_util::fgetxattr(&dir, GLOBAL_REPLAY_GUARD_XATTR) {
            Ok(v) => match SeqPosition::from_bytes(&v) {
                Some(stored) if *spos < stored => GuardCheck::Skip,
                _ => GuardCheck::Replay,
            },
            Err(_) => GuardCheck::Replay,
        }
    }

    /// Stamp a guard on an open object file or collection directory. The
    /// double fsync brackets make the stamp itself durable and ordered
    /// after the work it records.
    pub(crate) fn set_replay_guard_fd(
        &self,
        file: &File,
        oid: Option<&ObjectId>,
        spos: &SeqPosition,
        in_progress: bool,
    ) -> Result<()> {
        if self.backend.can_checkpoint() {
            return Ok(());
        }
        debug!("set_replay_guard {spos}{}", if in_progress { " START" } else { "" });
        self.inject_failure();
        file.sync_all().map_err(|e| Error::from_io(e, "fsync before guard"))?;
        if let Some(oid) = oid {
            if oid.is_pgmeta() {
                self.pgmeta.submit_object(oid)?;
            }
        }
        self.omap.sync(oid, Some(spos))?;
        self.inject_failure();
        fs_util::fsetxattr(file, REPLAY_GUARD_XATTR, &encode_guard(spos, in_progress))?;
        file.sync_all().map_err(|e| Error::from_io(e, "fsync after guard"))?;
        self.inject_failure();
        Ok(())
    }

    pub(crate) fn set_replay_guard_coll(
        &self,
        cid: &CollectionId,
        spos: &SeqPosition,
        in_progress: bool,
    ) -> Result<()> {
        if self.backend.can_checkpoint() {
            return Ok(());
        }
        let dir = File::open(self.index.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("open {cid}")))?;
        self.set_replay_guard_fd(&dir, None, spos, in_progress)
    }

    pub(crate) fn close_replay_guard_fd(&self, file: &File, spos: &SeqPosition) -> Result<()> {
        if self.backend.can_checkpoint() {
            return Ok(());
        }
        self.inject_failure();
        fs_util::fsetxattr(file, REPLAY_GUARD_XATTR, &encode_guard(spos, false))?;
        file.sync_all().map_err(|e| Error::from_io(e, "fsync after guard"))?;
        self.inject_failure();
        Ok(())
    }

    pub(crate) fn close_replay_guard_coll(&self, cid: &CollectionId, spos: &SeqPosition)
        -> Result<()> {
        if self.backend.can_checkpoint() {
            return Ok(());
        }
        let dir = File::open(self.index.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("open {cid}")))?;
        self.close_replay_guard_fd(&dir, spos)
    }

    /// Guard decision for an object position. Outside replay (or with
    /// checkpoints) everything applies.
    pub(crate) fn check_object_guard(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        spos: &SeqPosition,
    ) -> GuardCheck {
        if !self.is_replaying() || self.backend.can_checkpoint() {
            return GuardCheck::Replay;
        }
        if self.check_global_replay_guard(spos) == GuardCheck::Skip {
            return GuardCheck::Skip;
        }
        let Ok(fd) = self.lfn_open(cid, oid, false) else {
            // no file, no guard
            return GuardCheck::Replay;
        };
        self.check_guard_fd(fd.file(), spos)
    }

    pub(crate) fn check_collection_guard(&self, cid: &CollectionId, spos: &SeqPosition)
        -> GuardCheck {
        if !self.is_replaying() || self.backend.can_checkpoint() {
            return GuardCheck::Replay;
        }
        let Ok(dir) = File::open(self.index.collection_dir(cid)) else {
            return GuardCheck::Replay;
        };
        self.check_guard_fd(&dir, spos)
    }

    fn check_guard_fd(&self, file: &File, spos: &SeqPosition) -> GuardCheck {
        match fs_util::fgetxattr(file, REPLAY_GUARD_XATTR) {
            Ok(v) => match decode_guard(&v) {
                Some((stored, in_progress)) => {
                    let decision = check_guard(&stored, in_progress, spos);
                    debug!("guard {stored} (in_progress={in_progress}) vs {spos}: {decision:?}");
                    decision
                }
                None => GuardCheck::Replay,
            },
            Err(_) => GuardCheck::Replay,
        }
    }

    // ---- object primitives ----

    /// Open an object, optionally creating it. Freshly created files start
    /// with no spilled attributes.
    pub(crate) fn lfn_open(&self, cid: &CollectionId, oid: &ObjectId, create: bool)
        -> Result<FdRef> {
        if let Some(fd) = self.fdcache.lookup(oid) {
            return Ok(fd);
        }
        let path = self.index.object_path(cid, oid);
        let open_existing = || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::from_io(e, format!("open {cid}/{oid}")))
        };
        let file = match open_existing() {
            Ok(f) => f,
            Err(e) if e.is_not_found() && create => {
                if !self.index.collection_exists(cid) {
                    return Err(Error::NotFound(format!("collection {cid}")));
                }
                match std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                {
                    Ok(f) => {
                        fs_util::fsetxattr(&f, SPILL_OUT_XATTR, SPILL_OUT_NO)?;
                        f
                    }
                    // a concurrent creator won the race
                    Err(e2) if e2.kind() == std::io::ErrorKind::AlreadyExists => open_existing()?,
                    Err(e2) => return Err(Error::from_io(e2, format!("create {cid}/{oid}"))),
                }
            }
            Err(e) => return Err(e),
        };
        let mut existed = false;
        Ok(self.fdcache.add(oid, file, &mut existed))
    }

    pub(crate) fn touch(&self, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        debug!("touch {cid}/{oid}");
        self.lfn_open(cid, oid, true)?;
        Ok(())
    }

    pub(crate) fn write(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        data: &Bytes,
        flags: u32,
        osr_id: u64,
    ) -> Result<()> {
        debug!("write {cid}/{oid} {offset}~{}", data.len());
        let fd = self.lfn_open(cid, oid, true)?;
        fd.file()
            .write_all_at(data, offset)
            .map_err(|e| Error::from_io(e, format!("write {cid}/{oid}")))?;
        if self.tunables.lock().sloppy_crc {
            self.crc.update_write(oid, offset, data);
        }
        if !self.is_replaying() && self.wbthrottle.enabled() {
            self.wbthrottle.queue_wb(
                osr_id as usize,
                &fd,
                oid,
                offset,
                data.len() as u64,
                flags & WRITE_FLAG_DONTNEED != 0,
            );
        }
        Ok(())
    }

    pub(crate) fn zero(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        len: u64,
        osr_id: u64,
    ) -> Result<()> {
        debug!("zero {cid}/{oid} {offset}~{len}");
        let fd = self.lfn_open(cid, oid, false)?;
        match self.backend.punch_hole(fd.file(), offset, len) {
            Ok(()) => {
                if self.tunables.lock().sloppy_crc {
                    self.crc.update_zero(oid, offset, len);
                }
                Ok(())
            }
            Err(Error::Unsupported(_)) => {
                // old kernel or odd fs: write zeros the slow way
                let zeros = Bytes::from(vec![0u8; len as usize]);
                self.write(cid, oid, offset, &zeros, 0, osr_id)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn truncate(&self, cid: &CollectionId, oid: &ObjectId, size: u64) -> Result<()> {
        debug!("truncate {cid}/{oid} to {size}");
        let fd = self.lfn_open(cid, oid, false)?;
        fd.inc_truncate();
        let r = fd
            .file()
            .set_len(size)
            .map_err(|e| Error::from_io(e, format!("truncate {cid}/{oid}")));
        fd.dec_truncate();
        r?;
        if self.tunables.lock().sloppy_crc {
            self.crc.update_truncate(oid, size);
        }
        Ok(())
    }

    /// Unlink an object. When the last hard link drops, its omap rows,
    /// caches and pending write-back go with it.
    pub(crate) fn remove(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        spos: &SeqPosition,
        osr_id: u64,
        mut force_clear_omap: bool,
    ) -> Result<()> {
        debug!("remove {cid}/{oid}");
        let lock = self.index.lock(cid);
        let _guard = lock.write();
        let partition = osr_id as usize;

        if !force_clear_omap {
            match self.index.nlink(cid, oid) {
                Ok(1) => force_clear_omap = true,
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    self.wbthrottle.clear_object(partition, oid);
                    self.fdcache.clear(oid);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        if force_clear_omap {
            match self.omap.clear(oid, Some(spos)) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            self.wbthrottle.clear_object(partition, oid);
            self.fdcache.clear(oid);
            if oid.is_pgmeta() {
                self.pgmeta.discard_object(oid);
            }
            self.crc.drop_object(oid);
        } else if !self.backend.can_checkpoint() {
            // other links remain; replay of this unlink must still find the
            // object map intact
            if oid.is_pgmeta() {
                self.pgmeta.submit_object(oid)?;
            }
            self.omap.sync(Some(oid), Some(spos))?;
        }
        self.index.unlink(cid, oid)
    }

    pub(crate) fn clone_object(
        &self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        spos: &SeqPosition,
    ) -> Result<()> {
        debug!("clone {cid}/{src} -> {cid}/{dst}");
        if !self.check_object_guard(cid, dst, spos).should_apply() {
            return Ok(());
        }
        let src_fd = self.lfn_open(cid, src, false)?;
        let lock = self.index.lock(cid);
        let _guard = lock.write();
        let dst_fd = self.lfn_open(cid, dst, true)?;

        dst_fd
            .file()
            .set_len(0)
            .map_err(|e| Error::from_io(e, format!("truncate {cid}/{dst}")))?;
        let size = src_fd
            .file()
            .metadata()
            .map_err(|e| Error::from_io(e, "fstat"))?
            .len();
        copy_range_best(self.backend.as_ref(), src_fd.file(), dst_fd.file(), 0, size, 0)?;

        if src.is_pgmeta() {
            self.pgmeta.submit_object(src)?;
        }
        match self.omap.clone_object(src, dst, Some(spos)) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // inline attrs and the spill marker travel with the clone
        let spill = match fs_util::fgetxattr(src_fd.file(), SPILL_OUT_XATTR) {
            Ok(v) if v == SPILL_OUT_NO => SPILL_OUT_NO,
            _ => SPILL_OUT_YES,
        };
        fs_util::fsetxattr(dst_fd.file(), SPILL_OUT_XATTR, spill)?;
        for name in fs_util::list_attr_names(src_fd.file())? {
            let xname = fs_util::attr_xattr_name(&name);
            let value = fs_util::chain_getxattr(src_fd.file(), &xname)?;
            fs_util::chain_setxattr(dst_fd.file(), &xname, &value)?;
        }
        if self.tunables.lock().sloppy_crc {
            self.crc.clone_object(src, dst);
        }

        // clone is not idempotent; record that it happened
        self.set_replay_guard_fd(dst_fd.file(), Some(dst), spos, false)
    }

    pub(crate) fn clone_range(
        &self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        src_offset: u64,
        len: u64,
        dst_offset: u64,
        spos: &SeqPosition,
    ) -> Result<()> {
        debug!("clone_range {cid}/{src} -> {cid}/{dst} {src_offset}~{len} at {dst_offset}");
        if !self.check_object_guard(cid, dst, spos).should_apply() {
            return Ok(());
        }
        let src_fd = self.lfn_open(cid, src, false)?;
        let dst_fd = self.lfn_open(cid, dst, true)?;
        copy_range_best(
            self.backend.as_ref(),
            src_fd.file(),
            dst_fd.file(),
            src_offset,
            len,
            dst_offset,
        )?;
        self.set_replay_guard_fd(dst_fd.file(), Some(dst), spos, false)
    }

    pub(crate) fn set_alloc_hint(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        expected_object_size: u64,
        expected_write_size: u64,
    ) -> Result<()> {
        debug!(
            "set_alloc_hint {cid}/{oid} object_size {expected_object_size} write_size {expected_write_size}"
        );
        let fd = self.lfn_open(cid, oid, false)?;
        self.backend.set_alloc_hint(fd.file(), expected_write_size)
    }

    // ---- attributes ----

    fn read_spill_flag(file: &File) -> bool {
        match fs_util::fgetxattr(file, SPILL_OUT_XATTR) {
            Ok(v) if v == SPILL_OUT_NO => false,
            _ => true,
        }
    }

    pub(crate) fn setattrs(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        attrs: &BTreeMap<String, Bytes>,
        spos: &SeqPosition,
    ) -> Result<()> {
        let fd = self.lfn_open(cid, oid, false)?;
        let mut spilled = Self::read_spill_flag(fd.file());
        let mut inline_set: BTreeSet<String> =
            fs_util::list_attr_names(fd.file())?.into_iter().collect();
        let (max_size, max_count) = *self.xattr_limits.lock();

        let mut omap_set: BTreeMap<String, Bytes> = BTreeMap::new();
        let mut omap_remove: BTreeSet<String> = BTreeSet::new();

        for (name, value) in attrs {
            let xname = fs_util::attr_xattr_name(name);
            if value.len() > max_size {
                if inline_set.remove(name) {
                    fs_util::chain_removexattr(fd.file(), &xname)?;
                }
                omap_set.insert(name.clone(), value.clone());
                continue;
            }
            if !inline_set.contains(name) && inline_set.len() >= max_count {
                omap_set.insert(name.clone(), value.clone());
                continue;
            }
            if spilled {
                // the inline copy now wins; drop any spilled shadow
                omap_remove.insert(name.clone());
            }
            inline_set.insert(name.clone());
            fs_util::chain_setxattr(fd.file(), &xname, value)?;
        }

        if !spilled && !omap_set.is_empty() {
            fs_util::fsetxattr(fd.file(), SPILL_OUT_XATTR, SPILL_OUT_YES)?;
            spilled = true;
        }
        if spilled && !omap_remove.is_empty() {
            match self.omap.remove_xattrs(oid, &omap_remove, Some(spos)) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if !omap_set.is_empty() {
            self.omap.set_xattrs(oid, &omap_set, Some(spos))?;
        }
        debug!("setattrs {cid}/{oid}: {} attrs ({} spilled)", attrs.len(), omap_set.len());
        Ok(())
    }

    pub(crate) fn rmattr(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        name: &str,
        spos: &SeqPosition,
    ) -> Result<()> {
        debug!("rmattr {cid}/{oid} '{name}'");
        let fd = self.lfn_open(cid, oid, false)?;
        let spilled = Self::read_spill_flag(fd.file());
        match fs_util::chain_removexattr(fd.file(), &fs_util::attr_xattr_name(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_data() && spilled => {
                let mut names = BTreeSet::new();
                names.insert(name.to_string());
                let spilled_names = self.omap.get_xattrs(oid, &names)?;
                if spilled_names.is_empty() {
                    return Err(e);
                }
                self.omap.remove_xattrs(oid, &names, Some(spos))?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn rmattrs(&self, cid: &CollectionId, oid: &ObjectId, spos: &SeqPosition)
        -> Result<()> {
        debug!("rmattrs {cid}/{oid}");
        let fd = self.lfn_open(cid, oid, false)?;
        for name in fs_util::list_attr_names(fd.file())? {
            fs_util::chain_removexattr(fd.file(), &fs_util::attr_xattr_name(&name))?;
        }
        if Self::read_spill_flag(fd.file()) {
            let spilled = self.omap.get_all_xattr_names(oid)?;
            if !spilled.is_empty() {
                self.omap.remove_xattrs(oid, &spilled, Some(spos))?;
            }
            fs_util::fsetxattr(fd.file(), SPILL_OUT_XATTR, SPILL_OUT_NO)?;
        }
        Ok(())
    }

    // ---- omap family ----

    pub(crate) fn omap_clear_op(&self, cid: &CollectionId, oid: &ObjectId, spos: &SeqPosition)
        -> Result<()> {
        debug!("omap_clear {cid}/{oid}");
        self.index.lookup(cid, oid)?;
        if oid.is_pgmeta() {
            self.pgmeta.discard_object(oid);
        }
        self.omap.clear_keys_header(oid, Some(spos))?;
        Ok(())
    }

    pub(crate) fn omap_setkeys_op(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        kvs: &BTreeMap<String, Bytes>,
        spos: &SeqPosition,
    ) -> Result<()> {
        self.index.lookup(cid, oid)?;
        if oid.is_pgmeta() && !self.is_replaying() {
            if self.pgmeta.set_keys(oid, kvs, Some(spos))? {
                debug!("pgmeta shard flush triggered by {cid}/{oid}");
            }
        } else {
            self.omap.set_keys(oid, kvs, Some(spos))?;
        }
        Ok(())
    }

    pub(crate) fn omap_rmkeys_op(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &BTreeSet<String>,
        spos: &SeqPosition,
    ) -> Result<()> {
        self.index.lookup(cid, oid)?;
        if oid.is_pgmeta() {
            self.pgmeta.erase_keys(oid, keys, Some(spos));
        }
        self.omap.rm_keys(oid, keys, Some(spos))?;
        Ok(())
    }

    pub(crate) fn omap_rmkeyrange_op(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        first: &str,
        last: &str,
        spos: &SeqPosition,
    ) -> Result<()> {
        self.index.lookup(cid, oid)?;
        if oid.is_pgmeta() {
            // range semantics need the store view to be current
            self.pgmeta.submit_object(oid)?;
        }
        self.omap.rm_key_range(oid, first, last, Some(spos))?;
        Ok(())
    }

    pub(crate) fn omap_setheader_op(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        data: &Bytes,
        spos: &SeqPosition,
    ) -> Result<()> {
        self.index.lookup(cid, oid)?;
        self.omap.set_header(oid, data, Some(spos))?;
        Ok(())
    }

    // ---- collections ----

    pub(crate) fn create_collection(&self, cid: &CollectionId, spos: &SeqPosition) -> Result<()> {
        debug!("create_collection {cid}");
        match self.index.create_collection(cid) {
            Ok(()) => {}
            Err(e) if e.is_exists() && self.is_replaying() => {}
            Err(e) => return Err(e),
        }
        self.set_replay_guard_coll(cid, spos, false)
    }

    pub(crate) fn destroy_collection(&self, cid: &CollectionId) -> Result<()> {
        debug!("destroy_collection {cid}");
        let lock = self.index.lock(cid);
        let _guard = lock.write();
        self.index.destroy_collection(cid)
    }

    pub(crate) fn collection_hint(&self, cid: &CollectionId, hint_type: u32, data: &Bytes)
        -> Result<()> {
        if hint_type == 0 && data.len() >= 12 {
            let pg_num = u32::from_le_bytes(data[0..4].try_into().unwrap());
            let num_objs = u64::from_le_bytes(data[4..12].try_into().unwrap());
            debug!("collection {cid} expects ~{num_objs} objects across {pg_num} groups");
        } else {
            debug!("ignoring unrecognized collection hint type {hint_type} on {cid}");
        }
        if !self.index.collection_exists(cid) {
            return Err(Error::NotFound(format!("collection {cid}")));
        }
        Ok(())
    }

    pub(crate) fn collection_add(
        &self,
        cid: &CollectionId,
        src_cid: &CollectionId,
        oid: &ObjectId,
        spos: &SeqPosition,
    ) -> Result<()> {
        debug!("collection_add {cid}/{oid} from {src_cid}");
        let dst_check = self.check_object_guard(cid, oid, spos);
        if dst_check == GuardCheck::Skip {
            return Ok(());
        }
        // the source may carry a newer guard; never clobber it
        if self.check_object_guard(src_cid, oid, spos) == GuardCheck::Skip {
            return Ok(());
        }
        let fd = match self.lfn_open(src_cid, oid, false) {
            Ok(fd) => fd,
            Err(e) if e.is_not_found() && self.is_replaying() => {
                debug!("collection_add source gone, continuing replay");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if dst_check == GuardCheck::Replay {
            // conditional means an earlier attempt already opened the guard
            self.set_replay_guard_fd(fd.file(), Some(oid), spos, true)?;
        }
        match self.index.link(src_cid, cid, oid, oid) {
            Ok(()) => {}
            Err(e)
                if e.is_exists() && self.is_replaying() && !self.backend.can_checkpoint() => {}
            Err(e) => return Err(e),
        }
        self.inject_failure();
        self.close_replay_guard_fd(fd.file(), spos)
    }

    pub(crate) fn collection_move_rename(
        &self,
        src_cid: &CollectionId,
        src_oid: &ObjectId,
        dst_cid: &CollectionId,
        dst_oid: &ObjectId,
        spos: &SeqPosition,
        osr_id: u64,
    ) -> Result<()> {
        debug!("collection_move_rename {src_cid}/{src_oid} -> {dst_cid}/{dst_oid}");
        let remove_src = |this: &Self| -> Result<()> {
            if this.check_object_guard(src_cid, src_oid, spos).should_apply() {
                this.remove(src_cid, src_oid, spos, osr_id, true)
            } else {
                Ok(())
            }
        };

        if self.is_replaying() && !self.index.collection_exists(dst_cid) {
            // destination vanished later in the journal; drop the source
            return remove_src(self);
        }
        let dst_check = self.check_object_guard(dst_cid, dst_oid, spos);
        if dst_check == GuardCheck::Skip {
            return remove_src(self);
        }
        if self.check_object_guard(src_cid, src_oid, spos) == GuardCheck::Skip {
            return Ok(());
        }

        let fd = match self.lfn_open(src_cid, src_oid, false) {
            Ok(fd) => fd,
            Err(e) if e.is_not_found() && self.is_replaying() => {
                debug!("collection_move_rename source gone, continuing replay");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if dst_check == GuardCheck::Replay {
            self.set_replay_guard_fd(fd.file(), Some(dst_oid), spos, true)?;
        }
        match self.index.link(src_cid, dst_cid, src_oid, dst_oid) {
            Ok(()) => {}
            Err(e)
                if e.is_exists() && self.is_replaying() && !self.backend.can_checkpoint() => {}
            Err(e) => return Err(e),
        }
        self.inject_failure();

        // the name changed; the object map content moves with it
        if src_oid.is_pgmeta() {
            self.pgmeta.submit_object(src_oid)?;
        }
        match self.omap.clone_object(src_oid, dst_oid, Some(spos)) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.inject_failure();
        drop(fd);

        self.remove(src_cid, src_oid, spos, osr_id, true)?;
        let dst_fd = self.lfn_open(dst_cid, dst_oid, false)?;
        self.close_replay_guard_fd(dst_fd.file(), spos)
    }

    pub(crate) fn collection_setattr(&self, cid: &CollectionId, name: &str, value: &Bytes)
        -> Result<()> {
        debug!("collection_setattr {cid} '{name}'");
        let dir = File::open(self.index.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("open {cid}")))?;
        fs_util::chain_setxattr(&dir, &fs_util::attr_xattr_name(name), value)
    }

    pub(crate) fn collection_rmattr(&self, cid: &CollectionId, name: &str) -> Result<()> {
        debug!("collection_rmattr {cid} '{name}'");
        let dir = File::open(self.index.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("open {cid}")))?;
        fs_util::chain_removexattr(&dir, &fs_util::attr_xattr_name(name))
    }

    pub(crate) fn split_collection(
        &self,
        cid: &CollectionId,
        bits: u32,
        rem: u32,
        dest: &CollectionId,
        spos: &SeqPosition,
    ) -> Result<()> {
        debug!("split_collection {cid} bits {bits} rem {rem} -> {dest}");
        if !self.index.collection_exists(cid) || !self.index.collection_exists(dest) {
            assert!(self.is_replaying(), "split of a missing collection outside replay");
            return Ok(());
        }
        if self.check_collection_guard(dest, spos) == GuardCheck::Skip {
            return Ok(());
        }
        if self.check_collection_guard(cid, spos) == GuardCheck::Skip {
            return Ok(());
        }

        self.set_global_replay_guard(cid, spos);
        self.set_replay_guard_coll(cid, spos, true)?;
        self.set_replay_guard_coll(dest, spos, true)?;

        {
            let from_lock = self.index.lock(cid);
            let to_lock = self.index.lock(dest);
            let _from = from_lock.write();
            let _to = to_lock.write();
            let moved = self.index.split(cid, bits, rem, dest)?;
            debug!("split_collection moved {moved} objects");
        }

        self.close_replay_guard_coll(cid, spos)?;
        self.close_replay_guard_coll(dest, spos)
    }

    /// Old split form that creates the destination itself.
    pub(crate) fn split_collection_create(
        &self,
        cid: &CollectionId,
        bits: u32,
        rem: u32,
        dest: &CollectionId,
        spos: &SeqPosition,
    ) -> Result<()> {
        debug!("split_collection_create {cid} bits {bits} rem {rem} -> {dest}");
        match self.index.create_collection(dest) {
            Ok(()) => {}
            Err(e) if e.is_exists() && self.is_replaying() => {}
            Err(e) => return Err(e),
        }
        if self.check_collection_guard(cid, spos) == GuardCheck::Skip {
            return Ok(());
        }
        if self.check_collection_guard(dest, spos) == GuardCheck::Skip {
            return Ok(());
        }
        self.set_replay_guard_coll(cid, spos, true)?;
        self.set_replay_guard_coll(dest, spos, true)?;
        {
            let from_lock = self.index.lock(cid);
            let to_lock = self.index.lock(dest);
            let _from = from_lock.write();
            let _to = to_lock.write();
            self.index.split(cid, bits, rem, dest)?;
        }
        self.close_replay_guard_coll(cid, spos)?;
        self.close_replay_guard_coll(dest, spos)
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }
}
