//! Completion queues
//!
//! `poll` walks the hardware ring while the toggle bit of the entry at the
//! consumer matches the expected epoch, reconciling each record against the
//! owning QP's shadow ring. One record may retire several WQEs (unsignaled
//! ones are covered by the next signaled completion); only signaled WQEs
//! and errors produce a `Cqe`.
//!
//! QPs that entered the error state sit on the CQ's flush lists until they
//! are destroyed or reset. `flush_list_process` reports their outstanding
//! WQEs as FLUSHED.
//!
//! Lock order: ring → flush → QP send/receive queue. Only one CQ's flush
//! lock is held at a time.

use crate::device::Device;
use crate::doorbell::{DoorbellInfo, DoorbellType};
use crate::hsi::{self, HwCqe, ResKind, CQE_CONS_NONE, CQE_SIZE, DB_OFFSET_CQ};
use crate::hwq::{HardwareQueue, HwqAttr, HwqType};
use crate::qp::{QpType, QueuePair, SendQueue, FENCE_WRID};
use crate::rcfw::cmd::CreateCqReq;
use crate::rcfw::{Command, ControlChannel, SendOptions};
use crate::reftbl::ReferenceTable;
use crate::{QplibError, Result};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Completion notification callback; receives the CQ id
pub type CqHandler = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyArm {
    /// Next solicited or error completion
    Solicited,
    /// Next completion of any kind
    NextCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeOpcode {
    /// Requester (send queue) completion
    Req,
    RecvRc,
    RecvUd,
    RecvRaw,
}

impl CqeOpcode {
    fn for_recv(qp_type: QpType) -> Self {
        match qp_type {
            QpType::Rc => CqeOpcode::RecvRc,
            QpType::Ud => CqeOpcode::RecvUd,
            QpType::Gsi => CqeOpcode::RecvRaw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeStatus {
    Success,
    BadResponse,
    LocalLength,
    LocalQpOperation,
    LocalProtection,
    LocalAccess,
    MemoryManagement,
    RemoteInvalidRequest,
    RemoteAccess,
    RemoteOperation,
    RnrRetryExceeded,
    TransportRetryExceeded,
    Flushed,
    HwFlush,
    Other(u8),
}

impl CqeStatus {
    pub fn from_req(raw: u8) -> Self {
        match raw {
            hsi::CQE_REQ_STATUS_OK => Self::Success,
            hsi::CQE_REQ_STATUS_BAD_RESPONSE => Self::BadResponse,
            hsi::CQE_REQ_STATUS_LOCAL_LENGTH => Self::LocalLength,
            hsi::CQE_REQ_STATUS_LOCAL_QP_OPERATION => Self::LocalQpOperation,
            hsi::CQE_REQ_STATUS_LOCAL_PROTECTION => Self::LocalProtection,
            hsi::CQE_REQ_STATUS_MEMORY_MGT_OPERATION => Self::MemoryManagement,
            hsi::CQE_REQ_STATUS_REMOTE_INVALID_REQUEST => Self::RemoteInvalidRequest,
            hsi::CQE_REQ_STATUS_REMOTE_ACCESS => Self::RemoteAccess,
            hsi::CQE_REQ_STATUS_REMOTE_OPERATION => Self::RemoteOperation,
            hsi::CQE_REQ_STATUS_RNR_NAK_RETRY_CNT => Self::RnrRetryExceeded,
            hsi::CQE_REQ_STATUS_TRANSPORT_RETRY_CNT => Self::TransportRetryExceeded,
            hsi::CQE_REQ_STATUS_WORK_REQUEST_FLUSHED => Self::Flushed,
            other => Self::Other(other),
        }
    }

    pub fn from_res(raw: u8) -> Self {
        match raw {
            hsi::CQE_RES_STATUS_OK => Self::Success,
            hsi::CQE_RES_STATUS_LOCAL_ACCESS => Self::LocalAccess,
            hsi::CQE_RES_STATUS_LOCAL_LENGTH => Self::LocalLength,
            hsi::CQE_RES_STATUS_LOCAL_PROTECTION => Self::LocalProtection,
            hsi::CQE_RES_STATUS_LOCAL_QP_OPERATION => Self::LocalQpOperation,
            hsi::CQE_RES_STATUS_MEMORY_MGT_OPERATION => Self::MemoryManagement,
            hsi::CQE_RES_STATUS_REMOTE_INVALID_REQUEST => Self::RemoteInvalidRequest,
            hsi::CQE_RES_STATUS_WORK_REQUEST_FLUSHED => Self::Flushed,
            hsi::CQE_RES_STATUS_HW_FLUSH => Self::HwFlush,
            other => Self::Other(other),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Success
    }
}

/// One logical completion handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cqe {
    pub wr_id: u64,
    pub qp_id: u32,
    pub opcode: CqeOpcode,
    pub status: CqeStatus,
    /// Bytes received (responder completions)
    pub length: u32,
    /// Immediate data or invalidated rkey, per `flags`
    pub imm_or_inv: u32,
    /// `hsi::CQE_RES_FLAG_*`
    pub flags: u16,
    pub src_qp: u32,
}

impl Cqe {
    fn send(qp_id: u32, wr_id: u64, status: CqeStatus) -> Self {
        Self {
            wr_id,
            qp_id,
            opcode: CqeOpcode::Req,
            status,
            length: 0,
            imm_or_inv: 0,
            flags: 0,
            src_qp: qp_id,
        }
    }
}

/// What one `poll` produced
#[derive(Default)]
pub struct PollResult {
    pub cqes: Vec<Cqe>,
    /// QP whose send queue must get a phantom fence WQE before its
    /// completions can be finalized
    pub needs_phantom: Option<Arc<QueuePair>>,
}

struct CqRing {
    hwq: HardwareQueue,
    /// New ring of a resize, swapped in at the CUT_OFF record
    pending: Option<HardwareQueue>,
    db: DoorbellInfo,
}

#[derive(Default)]
struct FlushLists {
    sq: Vec<Arc<QueuePair>>,
    rq: Vec<Arc<QueuePair>>,
}

/// Result of handling one hardware record
enum Step {
    /// Record fully handled; advance the consumer
    Consumed,
    /// Stop polling and come back to this record later
    Again,
}

/// Phantom workaround verdict for the WQE about to complete
enum Phantom {
    Proceed,
    Wait,
    SendFence,
}

pub struct CompletionQueue {
    id: u32,
    ring: Mutex<CqRing>,
    flush: Mutex<FlushLists>,
    qps: Arc<ReferenceTable<QueuePair>>,
    phantom_workaround: bool,
    rcfw: Arc<ControlChannel>,
    handler: RwLock<Option<CqHandler>>,
    destroyed: AtomicBool,
    /// Set by a firmware CQ error event
    errored: AtomicBool,
    notifications: AtomicU64,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl CompletionQueue {
    pub(crate) fn create(dev: &Device, cqe_count: u32) -> Result<Arc<Self>> {
        if cqe_count == 0 {
            return Err(QplibError::InvalidArgument("CQ needs at least one entry".into()));
        }
        let hwq = HardwareQueue::allocate(
            dev.dma.as_ref(),
            &HwqAttr::ring(cqe_count, CQE_SIZE as u32, HwqType::Completion),
        )?;
        let req = CreateCqReq {
            table: hwq.page_table(),
            cqe_count: hwq.depth(),
        };
        let resp = dev.rcfw.send(&Command::CreateCq(req), SendOptions::default())?;
        let id = resp.xid;

        let db = DoorbellInfo::new(Arc::clone(&dev.db), DB_OFFSET_CQ, id);
        db.ring(DoorbellType::CqArmEna, 0, false, 0);

        let cq = Arc::new(Self {
            id,
            ring: Mutex::new(CqRing {
                hwq,
                pending: None,
                db,
            }),
            flush: Mutex::new(FlushLists::default()),
            qps: Arc::clone(&dev.qps),
            phantom_workaround: dev.config().caps.needs_phantom_workaround(),
            rcfw: Arc::clone(&dev.rcfw),
            handler: RwLock::new(None),
            destroyed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            notifications: AtomicU64::new(0),
        });

        if let Err(e) = dev.cqs.insert(id, &cq) {
            if let Err(undo) = dev.rcfw.send(&Command::DestroyCq { cq_id: id }, SendOptions::default()) {
                warn!("CQ 0x{:x}: destroy after failed registration: {}", id, undo);
            }
            return Err(e);
        }
        info!("Created CQ 0x{:x} with {} entries", id, cqe_count);
        Ok(cq)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn depth(&self) -> u32 {
        self.ring.lock().hwq.depth()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    /// Firmware reported the CQ broken; wake the consumer so it notices
    pub(crate) fn mark_error(&self, reason: u8) {
        if !self.errored.swap(true, Ordering::AcqRel) {
            error!("CQ 0x{:x} marked errored, reason 0x{:x}", self.id, reason);
        }
        self.notify();
    }

    pub fn resize_in_progress(&self) -> bool {
        self.ring.lock().pending.is_some()
    }

    pub fn set_handler(&self, handler: CqHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Notifications delivered so far
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Acquire)
    }

    /// Deliver a completion notification to the registered handler
    pub fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::AcqRel);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(self.id);
        }
    }

    /// Arm the CQ for one notification
    pub fn request_notify(&self, arm: NotifyArm) {
        let ring = self.ring.lock();
        let kind = match arm {
            NotifyArm::Solicited => DoorbellType::CqArmSe,
            NotifyArm::NextCompletion => DoorbellType::CqArmAll,
        };
        ring.db.ring(kind, ring.hwq.cons(), ring.hwq.cons_epoch(), 0);
    }

    pub(crate) fn destroy(self: &Arc<Self>, table: &ReferenceTable<CompletionQueue>) -> Result<()> {
        if self.is_destroyed() {
            return Err(QplibError::AlreadyDestroyed(self.id));
        }
        let handle = table.remove(self.id)?;
        if let Err(e) = self
            .rcfw
            .send(&Command::DestroyCq { cq_id: self.id }, SendOptions::default())
        {
            table.restore(self.id, handle);
            return Err(e);
        }
        {
            let mut flush = self.flush.lock();
            if !flush.sq.is_empty() || !flush.rq.is_empty() {
                warn!(
                    "CQ 0x{:x} destroyed with {} QPs still flushing",
                    self.id,
                    flush.sq.len() + flush.rq.len()
                );
            }
            flush.sq.clear();
            flush.rq.clear();
        }
        self.destroyed.store(true, Ordering::Release);
        info!("Destroyed CQ 0x{:x}", self.id);
        Ok(())
    }

    /// Start moving to a ring of `cqe_count` entries. The swap happens when
    /// `poll` reaches the CUT_OFF record firmware writes into the old ring.
    pub fn resize(&self, dma: &dyn crate::dma::DmaAllocator, cqe_count: u32) -> Result<()> {
        let table = {
            let mut ring = self.ring.lock();
            if ring.pending.is_some() {
                return Err(QplibError::Busy(format!("CQ 0x{:x} resize in progress", self.id)));
            }
            let hwq = HardwareQueue::allocate(
                dma,
                &HwqAttr::ring(cqe_count, CQE_SIZE as u32, HwqType::Completion),
            )?;
            let table = hwq.page_table();
            ring.pending = Some(hwq);
            table
        };

        let cmd = Command::ResizeCq {
            cq_id: self.id,
            table,
            cqe_count: table.depth,
        };
        if let Err(e) = self.rcfw.send(&cmd, SendOptions::default()) {
            self.ring.lock().pending = None;
            return Err(e);
        }
        debug!("CQ 0x{:x}: resize to {} requested", self.id, table.depth);
        Ok(())
    }

    pub(crate) fn add_sq_flush(&self, qp: Arc<QueuePair>) {
        self.flush.lock().sq.push(qp);
    }

    pub(crate) fn add_rq_flush(&self, qp: Arc<QueuePair>) {
        self.flush.lock().rq.push(qp);
    }

    pub(crate) fn remove_sq_flush(&self, qp_id: u32) {
        self.flush.lock().sq.retain(|qp| qp.id() != qp_id);
    }

    pub(crate) fn remove_rq_flush(&self, qp_id: u32) {
        self.flush.lock().rq.retain(|qp| qp.id() != qp_id);
    }

    /// QPs currently on the (send, receive) flush lists
    pub fn flush_list_len(&self) -> (usize, usize) {
        let flush = self.flush.lock();
        (flush.sq.len(), flush.rq.len())
    }

    /// Overwrite the QP id of pending records that name `qp_id`, so a later
    /// QP reusing the id never sees them
    pub(crate) fn neutralize_qp(&self, qp_id: u32) {
        let ring = self.ring.lock();
        let depth = ring.hwq.depth();
        let mut expected = ring.hwq.expected_toggle();
        let mut raw = [0u8; CQE_SIZE];
        let mut cleared = 0;
        for k in 0..depth {
            let idx = ring.hwq.cons() + k;
            if idx == depth {
                expected = !expected;
            }
            if ring.hwq.read_slot(idx, &mut raw).is_err() || HwCqe::toggle(&raw) != expected {
                break;
            }
            let names_qp = match HwCqe::decode(&raw) {
                HwCqe::Req { qp_id: id, .. }
                | HwCqe::Res { qp_id: id, .. }
                | HwCqe::Terminal { qp_id: id, .. } => id == qp_id,
                _ => false,
            };
            if names_qp {
                let invalid = hsi::CQE_QP_ID_INVALID.to_le_bytes();
                if ring.hwq.write_slot(idx, hsi::CQE_QP_ID_OFFSET, &invalid).is_ok() {
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            debug!("CQ 0x{:x}: neutralized {} records of QP 0x{:x}", self.id, cleared, qp_id);
        }
    }

    /// Reap up to `budget` completions from the hardware ring.
    ///
    /// A record is only consumed once every WQE it covers has been
    /// reported; when the budget runs out mid-record the rest is picked up
    /// by the next call.
    pub fn poll(&self, budget: usize) -> PollResult {
        let mut result = PollResult::default();
        let mut ring = self.ring.lock();
        let mut consumed = 0u32;
        let mut raw = [0u8; CQE_SIZE];

        while result.cqes.len() < budget {
            let cons = ring.hwq.cons();
            if ring.hwq.read_slot(cons, &mut raw).is_err()
                || HwCqe::toggle(&raw) != ring.hwq.expected_toggle()
            {
                break;
            }
            let room = budget - result.cqes.len();
            let step = match HwCqe::decode(&raw) {
                HwCqe::Req {
                    status,
                    qp_id,
                    sq_cons_idx,
                } => self.process_req(&ring, status, qp_id, sq_cons_idx, room, &mut result),
                HwCqe::Res {
                    kind,
                    status,
                    qp_id,
                    flags,
                    length,
                    imm_or_inv,
                    wr_id_idx,
                    src_qp,
                } => self.process_res(
                    kind,
                    status,
                    qp_id,
                    flags,
                    length,
                    imm_or_inv,
                    wr_id_idx,
                    src_qp,
                    &mut result.cqes,
                ),
                HwCqe::Terminal {
                    status,
                    qp_id,
                    sq_cons_idx,
                    ..
                } => self.process_terminal(&ring, status, qp_id, sq_cons_idx, room, &mut result),
                HwCqe::Cutoff { .. } => {
                    if self.finish_resize(&mut ring) {
                        // Nothing left to acknowledge on the old ring
                        consumed = 0;
                        continue;
                    }
                    Step::Consumed
                }
                HwCqe::Unknown { kind } => {
                    error!("CQ 0x{:x}: unknown record type 0x{:x} skipped", self.id, kind);
                    Step::Consumed
                }
            };
            match step {
                Step::Consumed => {
                    ring.hwq.advance_consumer(1);
                    consumed += 1;
                }
                Step::Again => break,
            }
        }

        if consumed > 0 {
            ring.db
                .ring(DoorbellType::Cq, ring.hwq.cons(), ring.hwq.cons_epoch(), 0);
        }
        result
    }

    fn lookup_qp(&self, qp_id: u32) -> Option<Arc<QueuePair>> {
        if qp_id == hsi::CQE_QP_ID_INVALID {
            return None;
        }
        let qp = self.qps.lookup(qp_id);
        if qp.is_none() {
            debug!("CQ 0x{:x}: record for unknown QP 0x{:x} skipped", self.id, qp_id);
        }
        qp
    }

    fn process_req(
        &self,
        ring: &CqRing,
        status: u8,
        qp_id: u32,
        sq_cons_idx: u16,
        room: usize,
        result: &mut PollResult,
    ) -> Step {
        let Some(qp) = self.lookup_qp(qp_id) else {
            return Step::Consumed;
        };
        if qp.sq_flushed() {
            debug!("QP 0x{:x} is flushing, REQ record ignored", qp_id);
            return Step::Consumed;
        }

        let mut sq = qp.sq.lock();
        let target = sq_cons_idx as u32 % sq.shadow_len();
        let mut room = room;
        let mut failed = false;
        let mut stopped = false;

        while room > 0 && sq.swq_cons() != target {
            let idx = sq.swq_cons();
            let entry = sq.entry(idx).clone();
            let last = (idx + 1) % sq.shadow_len() == target;

            if last && status != hsi::CQE_REQ_STATUS_OK {
                let status = CqeStatus::from_req(status);
                error!("QP 0x{:x}: send wr_id 0x{:x} completed with {:?}", qp_id, entry.wr_id, status);
                result.cqes.push(Cqe::send(qp_id, entry.wr_id, status));
                room -= 1;
                failed = true;
            } else if entry.signaled {
                if self.phantom_workaround {
                    match self.check_phantom(ring, &qp, &mut sq, idx) {
                        Phantom::Proceed => {}
                        Phantom::Wait => {
                            stopped = true;
                            break;
                        }
                        Phantom::SendFence => {
                            result.needs_phantom = Some(Arc::clone(&qp));
                            stopped = true;
                            break;
                        }
                    }
                }
                if entry.wr_id != FENCE_WRID {
                    result.cqes.push(Cqe::send(qp_id, entry.wr_id, CqeStatus::Success));
                    room -= 1;
                }
            }

            sq.pop_front();
            if sq.single {
                break;
            }
        }

        if stopped || sq.swq_cons() != target {
            return Step::Again;
        }
        // Back to normal mode only once this record is fully reported
        sq.single = false;
        drop(sq);

        if failed {
            qp.mark_error();
        }
        Step::Consumed
    }

    /// Older silicon can report a completion before the data it covers is
    /// visible. The adapter marks such WQEs in the PSN search table; the
    /// driver then posts a fence and holds completions until the fence's
    /// own completion shows up in the ring.
    fn check_phantom(&self, ring: &CqRing, qp: &QueuePair, sq: &mut SendQueue, idx: u32) -> Phantom {
        if sq.condition {
            let depth = ring.hwq.depth();
            let cons = ring.hwq.cons();
            let mut expected = ring.hwq.expected_toggle();
            let mut raw = [0u8; CQE_SIZE];
            for k in 0..depth {
                if cons + k == depth {
                    expected = !expected;
                }
                if ring.hwq.read_slot(cons + k, &mut raw).is_err() || HwCqe::toggle(&raw) != expected {
                    return Phantom::Wait;
                }
                if let HwCqe::Req {
                    qp_id, sq_cons_idx, ..
                } = HwCqe::decode(&raw)
                {
                    let len = sq.shadow_len();
                    let covered = (sq_cons_idx as u32 + len - 1) % len;
                    if qp_id == qp.id() && sq.entry(covered).wr_id == FENCE_WRID {
                        debug!("QP 0x{:x}: phantom completion seen", qp.id());
                        sq.condition = false;
                        sq.single = true;
                        return Phantom::Proceed;
                    }
                }
            }
            warn!("CQ 0x{:x}: no phantom completion in a full ring", self.id);
            return Phantom::Wait;
        }

        if sq.phantom_marked(idx) {
            if let Err(e) = sq.clear_phantom_mark(idx) {
                warn!("QP 0x{:x}: clearing phantom mark failed: {}", qp.id(), e);
            }
            sq.condition = true;
            sq.send_phantom = true;
            ring.db
                .ring(DoorbellType::CqArmAll, ring.hwq.cons(), ring.hwq.cons_epoch(), 0);
            debug!("QP 0x{:x}: WQE {} needs a phantom fence", qp.id(), idx);
            return Phantom::SendFence;
        }
        Phantom::Proceed
    }

    #[allow(clippy::too_many_arguments)]
    fn process_res(
        &self,
        kind: ResKind,
        status: u8,
        qp_id: u32,
        flags: u16,
        length: u32,
        imm_or_inv: u32,
        wr_id_idx: u32,
        src_qp: u32,
        out: &mut Vec<Cqe>,
    ) -> Step {
        let Some(qp) = self.lookup_qp(qp_id) else {
            return Step::Consumed;
        };

        let wr_id = if flags & hsi::CQE_RES_FLAG_SRQ != 0 {
            let Some(srq) = qp.srq() else {
                warn!("QP 0x{:x}: SRQ completion on a QP without an SRQ", qp_id);
                return Step::Consumed;
            };
            match srq.release(wr_id_idx) {
                Some(wr_id) => wr_id,
                None => {
                    error!("SRQ 0x{:x}: completion for idle entry {}", srq.id(), wr_id_idx);
                    return Step::Consumed;
                }
            }
        } else {
            if qp.rq_flushed() {
                debug!("QP 0x{:x} is flushing, RES record ignored", qp_id);
                return Step::Consumed;
            }
            let Some(rq) = &qp.rq else {
                warn!("QP 0x{:x}: receive completion without a receive queue", qp_id);
                return Step::Consumed;
            };
            let mut rq = rq.lock();
            if wr_id_idx != rq.cons() {
                error!(
                    "QP 0x{:x}: receive completion for entry {} while {} is oldest",
                    qp_id,
                    wr_id_idx,
                    rq.cons()
                );
                return Step::Consumed;
            }
            match rq.pop_front() {
                Some((_, wr_id)) => wr_id,
                None => return Step::Consumed,
            }
        };

        let status = CqeStatus::from_res(status);
        let opcode = match kind {
            ResKind::Rc => CqeOpcode::RecvRc,
            ResKind::Ud => CqeOpcode::RecvUd,
            ResKind::RawQp1 => CqeOpcode::RecvRaw,
        };
        out.push(Cqe {
            wr_id,
            qp_id,
            opcode,
            status,
            length,
            imm_or_inv,
            flags,
            src_qp,
        });
        if !status.is_ok() {
            error!("QP 0x{:x}: receive wr_id 0x{:x} completed with {:?}", qp_id, wr_id, status);
            qp.mark_error();
        }
        Step::Consumed
    }

    /// Terminal records end a QP: WQEs up to the reported index completed
    /// fine, everything after is flushed
    fn process_terminal(
        &self,
        ring: &CqRing,
        status: u8,
        qp_id: u32,
        sq_cons_idx: u16,
        room: usize,
        result: &mut PollResult,
    ) -> Step {
        let Some(qp) = self.lookup_qp(qp_id) else {
            return Step::Consumed;
        };
        if status != hsi::CQE_REQ_STATUS_OK {
            warn!("QP 0x{:x}: terminal record with status 0x{:x}", qp_id, status);
        }

        if sq_cons_idx != CQE_CONS_NONE && !qp.sq_flushed() {
            let mut sq = qp.sq.lock();
            let target = sq_cons_idx as u32 % sq.shadow_len();
            let mut room = room;
            if self.phantom_workaround && sq.swq_cons() != target {
                let idx = sq.swq_cons();
                match self.check_phantom(ring, &qp, &mut sq, idx) {
                    Phantom::Proceed => {}
                    Phantom::Wait => return Step::Again,
                    Phantom::SendFence => {
                        result.needs_phantom = Some(Arc::clone(&qp));
                        return Step::Again;
                    }
                }
            }
            while room > 0 && sq.swq_cons() != target {
                let Some(entry) = sq.pop_front() else {
                    break;
                };
                if entry.signaled && entry.wr_id != FENCE_WRID {
                    result.cqes.push(Cqe::send(qp_id, entry.wr_id, CqeStatus::Success));
                    room -= 1;
                }
            }
            if sq.swq_cons() != target {
                return Step::Again;
            }
        }

        qp.mark_error();
        Step::Consumed
    }

    /// Swap in the resized ring. Returns false for a stray CUT_OFF record.
    fn finish_resize(&self, ring: &mut CqRing) -> bool {
        match ring.pending.take() {
            Some(hwq) => {
                let old_depth = ring.hwq.depth();
                ring.hwq = hwq;
                ring.db.ring(DoorbellType::CqCutoffAck, 0, false, 0);
                info!(
                    "CQ 0x{:x} resized: {} -> {} entries",
                    self.id,
                    old_depth,
                    ring.hwq.depth()
                );
                true
            }
            None => {
                warn!("CQ 0x{:x}: CUT_OFF record without a resize", self.id);
                false
            }
        }
    }

    /// Report the outstanding WQEs of every QP on the flush lists as
    /// FLUSHED, in posting order, up to `budget` completions
    pub fn flush_list_process(&self, budget: usize) -> Vec<Cqe> {
        let flush = self.flush.lock();
        let mut out = Vec::new();

        for qp in &flush.sq {
            let mut sq = qp.sq.lock();
            while out.len() < budget {
                let Some(entry) = sq.pop_front() else {
                    break;
                };
                if entry.wr_id == FENCE_WRID {
                    sq.cancel_phantom();
                    continue;
                }
                out.push(Cqe::send(qp.id(), entry.wr_id, CqeStatus::Flushed));
            }
        }

        for qp in &flush.rq {
            let Some(rq) = &qp.rq else {
                continue;
            };
            let mut rq = rq.lock();
            while out.len() < budget {
                let Some((_, wr_id)) = rq.pop_front() else {
                    break;
                };
                out.push(Cqe {
                    wr_id,
                    qp_id: qp.id(),
                    opcode: CqeOpcode::for_recv(qp.qp_type()),
                    status: CqeStatus::Flushed,
                    length: 0,
                    imm_or_inv: 0,
                    flags: 0,
                    src_qp: 0,
                });
            }
        }

        if !out.is_empty() {
            debug!("CQ 0x{:x}: {} flushed completions", self.id, out.len());
        }
        out
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        debug!(
            "Dropping CQ 0x{:x} (destroyed: {})",
            self.id,
            self.destroyed.load(Ordering::Acquire)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(CqeStatus::from_req(0), CqeStatus::Success);
        assert_eq!(
            CqeStatus::from_req(hsi::CQE_REQ_STATUS_WORK_REQUEST_FLUSHED),
            CqeStatus::Flushed
        );
        assert_eq!(
            CqeStatus::from_req(hsi::CQE_REQ_STATUS_RNR_NAK_RETRY_CNT),
            CqeStatus::RnrRetryExceeded
        );
        assert_eq!(
            CqeStatus::from_res(hsi::CQE_RES_STATUS_WORK_REQUEST_FLUSHED),
            CqeStatus::Flushed
        );
        assert_eq!(
            CqeStatus::from_res(hsi::CQE_RES_STATUS_LOCAL_LENGTH),
            CqeStatus::LocalLength
        );
        assert_eq!(CqeStatus::from_req(0x40), CqeStatus::Other(0x40));
        assert!(!CqeStatus::Flushed.is_ok());
    }

    #[test]
    fn test_recv_opcode_by_qp_type() {
        assert_eq!(CqeOpcode::for_recv(QpType::Rc), CqeOpcode::RecvRc);
        assert_eq!(CqeOpcode::for_recv(QpType::Ud), CqeOpcode::RecvUd);
        assert_eq!(CqeOpcode::for_recv(QpType::Gsi), CqeOpcode::RecvRaw);
    }
}
