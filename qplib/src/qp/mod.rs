//! Queue pairs
//!
//! Life cycle (create/modify/query/destroy) goes through the control
//! channel; posting writes WQEs straight into the rings and leaves the
//! doorbell to `post_send_db`/`post_recv_db` so callers can batch.
//!
//! A QP in the error state still accepts posts: the WQE is recorded in the
//! shadow ring without touching hardware and the owning CQ is notified from
//! the worker pool, so the caller observes a FLUSHED completion for it.

mod queue;
pub mod types;
pub mod wqe;

pub use queue::SeqTable;
pub use types::{filter_modify, ModifyMask, QpAttrs, QpState, QpType, DEFAULT_PATH_MTU};
pub use wqe::{Payload, RecvWqe, SendOp, SendWqe, Sge, UdDest, WqeFlags, FENCE_WRID};

pub(crate) use queue::{RecvQueue, SendQueue};

use crate::cq::CompletionQueue;
use crate::device::Device;
use crate::doorbell::DoorbellInfo;
use crate::hsi::{WireReader, DB_OFFSET_QUEUE, PSN_MASK, PSN_SEARCH_SIZE, SLOT_SIZE};
use crate::hwq::{HardwareQueue, HwqAttr, HwqType};
use crate::rcfw::cmd::CreateQpReq;
use crate::rcfw::{Command, ControlChannel, SendOptions};
use crate::reftbl::ReferenceTable;
use crate::srq::SharedReceiveQueue;
use crate::worker::WorkerHandle;
use crate::{QplibError, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Requested QP shape
#[derive(Clone)]
pub struct QpInitAttrs {
    pub qp_type: QpType,
    pub pd_id: u32,
    pub max_send_wr: u32,
    pub max_send_sge: u32,
    pub max_inline: u32,
    pub max_recv_wr: u32,
    pub max_recv_sge: u32,
    pub send_cq: Arc<CompletionQueue>,
    pub recv_cq: Arc<CompletionQueue>,
    pub srq: Option<Arc<SharedReceiveQueue>>,
    /// Initial send PSN; random when absent
    pub sq_psn: Option<u32>,
}

impl QpInitAttrs {
    /// RC QP with `depth` send and receive WQEs and two SGEs per side
    pub fn rc(send_cq: &Arc<CompletionQueue>, recv_cq: &Arc<CompletionQueue>, depth: u32) -> Self {
        Self {
            qp_type: QpType::Rc,
            pd_id: 0,
            max_send_wr: depth,
            max_send_sge: 2,
            max_inline: 0,
            max_recv_wr: depth,
            max_recv_sge: 2,
            send_cq: Arc::clone(send_cq),
            recv_cq: Arc::clone(recv_cq),
            srq: None,
            sq_psn: None,
        }
    }
}

pub struct QueuePair {
    id: u32,
    qp_type: QpType,
    pd_id: u32,
    state: AtomicU8,
    attrs: Mutex<QpAttrs>,
    pub(crate) sq: Mutex<SendQueue>,
    pub(crate) rq: Option<Mutex<RecvQueue>>,
    scq: Weak<CompletionQueue>,
    rcq: Weak<CompletionQueue>,
    srq: Option<Arc<SharedReceiveQueue>>,
    sq_flushed: AtomicBool,
    rq_flushed: AtomicBool,
    destroyed: AtomicBool,
    rcfw: Arc<ControlChannel>,
    worker: WorkerHandle,
}

impl QueuePair {
    /// Size and allocate the rings, create the QP in firmware and register
    /// it for event dispatch.
    pub(crate) fn create(dev: &Device, init: QpInitAttrs) -> Result<Arc<Self>> {
        let config = dev.config();
        if init.max_inline > config.queues.max_inline {
            return Err(QplibError::InvalidArgument(format!(
                "inline limit {} above the configured {}",
                init.max_inline, config.queues.max_inline
            )));
        }
        if init.srq.is_none() && init.max_recv_wr == 0 {
            return Err(QplibError::InvalidArgument(
                "QP without an SRQ needs receive WQEs".into(),
            ));
        }
        if init.send_cq.is_destroyed() || init.recv_cq.is_destroyed() {
            return Err(QplibError::InvalidState("completion queue destroyed".into()));
        }

        let headroom = config.queues.sq_headroom_slots;
        let sizing = wqe::size_sq(
            init.max_send_wr,
            init.max_send_sge,
            init.max_inline,
            headroom,
            config.queues.wqe_mode,
        )?;
        let seq_table = match init.qp_type {
            QpType::Rc if config.caps.hw_retransmission => SeqTable::Msn,
            QpType::Rc => SeqTable::Psn,
            _ => SeqTable::None,
        };
        let sq_hwq = HardwareQueue::allocate(
            dev.dma.as_ref(),
            &HwqAttr {
                depth: sizing.ring_slots,
                stride: SLOT_SIZE as u32,
                aux_depth: if seq_table == SeqTable::None { 0 } else { sizing.shadow_len },
                aux_stride: PSN_SEARCH_SIZE as u32,
                kind: HwqType::Queue,
            },
        )?;

        let rq_shape = if init.srq.is_none() {
            let shadow_len = init.max_recv_wr + 1;
            let slots_per_wqe = wqe::rq_slots_per_wqe(init.max_recv_sge);
            let hwq = HardwareQueue::allocate(
                dev.dma.as_ref(),
                &HwqAttr::ring(shadow_len * slots_per_wqe, SLOT_SIZE as u32, HwqType::Queue),
            )?;
            Some((hwq, shadow_len, slots_per_wqe))
        } else {
            None
        };

        let req = CreateQpReq {
            qp_type: init.qp_type as u8,
            pd_id: init.pd_id,
            sq: sq_hwq.page_table(),
            rq: rq_shape.as_ref().map(|(hwq, _, _)| hwq.page_table()),
            sq_wqes: sizing.shadow_len,
            rq_wqes: rq_shape.as_ref().map(|(_, len, _)| *len).unwrap_or(0),
            sq_sge: init.max_send_sge,
            rq_sge: init.max_recv_sge,
            scq_id: init.send_cq.id(),
            rcq_id: init.recv_cq.id(),
            srq_id: init.srq.as_ref().map(|srq| srq.id()),
            max_inline: init.max_inline,
            variable_wqe: config.queues.wqe_mode == crate::config::WqeMode::Variable,
            msn_table: seq_table == SeqTable::Msn,
        };
        let resp = dev.rcfw.send(&Command::CreateQp(req), SendOptions::default())?;
        let id = resp.xid;

        let sq_psn = init
            .sq_psn
            .unwrap_or_else(|| rand::thread_rng().gen::<u32>())
            & PSN_MASK;
        let sq = SendQueue::new(
            sq_hwq,
            DoorbellInfo::new(Arc::clone(&dev.db), DB_OFFSET_QUEUE, id),
            config.queues.wqe_mode,
            sizing,
            headroom,
            init.max_send_sge,
            init.max_inline,
            seq_table,
            sq_psn,
        );
        let rq = rq_shape.map(|(hwq, shadow_len, slots_per_wqe)| {
            Mutex::new(RecvQueue::new(
                hwq,
                DoorbellInfo::new(Arc::clone(&dev.db), DB_OFFSET_QUEUE, id),
                shadow_len,
                slots_per_wqe,
                init.max_recv_sge,
            ))
        });

        let qp = Arc::new(Self {
            id,
            qp_type: init.qp_type,
            pd_id: init.pd_id,
            state: AtomicU8::new(QpState::Reset as u8),
            attrs: Mutex::new(QpAttrs {
                sq_psn,
                path_mtu: DEFAULT_PATH_MTU,
                ..Default::default()
            }),
            sq: Mutex::new(sq),
            rq,
            scq: Arc::downgrade(&init.send_cq),
            rcq: Arc::downgrade(&init.recv_cq),
            srq: init.srq,
            sq_flushed: AtomicBool::new(false),
            rq_flushed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            rcfw: Arc::clone(&dev.rcfw),
            worker: dev.worker(),
        });

        if let Err(e) = dev.qps.insert(id, &qp) {
            if let Err(undo) = dev.rcfw.send(&Command::DestroyQp { qp_id: id }, SendOptions::default()) {
                warn!("QP 0x{:x}: destroy after failed registration: {}", id, undo);
            }
            return Err(e);
        }

        info!(
            "Created {:?} QP 0x{:x}: sq {} WQEs, rq {} WQEs, scq 0x{:x}, rcq 0x{:x}",
            qp.qp_type,
            id,
            init.max_send_wr,
            init.max_recv_wr,
            init.send_cq.id(),
            init.recv_cq.id()
        );
        Ok(qp)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    pub fn pd_id(&self) -> u32 {
        self.pd_id
    }

    pub fn state(&self) -> QpState {
        QpState::from_raw(self.state.load(Ordering::Acquire)).unwrap_or(QpState::Err)
    }

    fn set_state(&self, state: QpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Last attributes applied by `modify` (state tracks the live value)
    pub fn attrs(&self) -> QpAttrs {
        let mut attrs = self.attrs.lock().clone();
        attrs.state = self.state();
        attrs
    }

    pub fn send_cq(&self) -> Option<Arc<CompletionQueue>> {
        self.scq.upgrade()
    }

    pub fn recv_cq(&self) -> Option<Arc<CompletionQueue>> {
        self.rcq.upgrade()
    }

    pub fn srq(&self) -> Option<&Arc<SharedReceiveQueue>> {
        self.srq.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Send WQEs posted but not yet completed or flushed
    pub fn sq_outstanding(&self) -> u32 {
        self.sq.lock().outstanding()
    }

    pub fn rq_outstanding(&self) -> u32 {
        self.rq.as_ref().map(|rq| rq.lock().outstanding()).unwrap_or(0)
    }

    pub fn sq_psn(&self) -> u32 {
        self.sq.lock().psn()
    }

    pub(crate) fn sq_flushed(&self) -> bool {
        self.sq_flushed.load(Ordering::Acquire)
    }

    pub(crate) fn rq_flushed(&self) -> bool {
        self.rq_flushed.load(Ordering::Acquire)
    }

    /// Apply `attrs` selected by `mask`.
    ///
    /// The mask is first adjusted for the current → requested transition.
    /// A timeout while moving to ERR still counts as success: the QP is
    /// treated as errored locally either way.
    pub fn modify(self: &Arc<Self>, mask: ModifyMask, attrs: &QpAttrs) -> Result<()> {
        if self.is_destroyed() {
            return Err(QplibError::AlreadyDestroyed(self.id));
        }
        let current = self.state();
        let mut attrs = attrs.clone();
        let mask = filter_modify(current, mask, &mut attrs);
        let to_error = mask.contains(ModifyMask::STATE) && attrs.state == QpState::Err;

        let cmd = Command::ModifyQp {
            qp_id: self.id,
            mask,
            attrs: attrs.clone(),
        };
        match self.rcfw.send(&cmd, SendOptions::default()) {
            Ok(_) => {}
            Err(QplibError::Timeout(_)) if to_error => {
                warn!("QP 0x{:x}: modify to ERR timed out, treating as done", self.id);
            }
            Err(e) => return Err(e),
        }

        self.attrs.lock().apply(mask, &attrs);
        {
            let mut sq = self.sq.lock();
            if mask.contains(ModifyMask::SQ_PSN) {
                sq.set_psn(attrs.sq_psn);
            }
            if mask.contains(ModifyMask::PATH_MTU) {
                sq.set_mtu(attrs.path_mtu);
            }
        }

        if mask.contains(ModifyMask::STATE) {
            debug!("QP 0x{:x}: {:?} -> {:?}", self.id, current, attrs.state);
            match attrs.state {
                QpState::Err => self.mark_error(),
                QpState::Reset => {
                    self.clean();
                    self.sq.lock().reset();
                    if let Some(rq) = &self.rq {
                        rq.lock().reset();
                    }
                    self.set_state(QpState::Reset);
                }
                state => self.set_state(state),
            }
        }
        Ok(())
    }

    /// Read state and attributes back from firmware
    pub fn query(&self) -> Result<QpAttrs> {
        let resp = self
            .rcfw
            .send(&Command::QueryQp { qp_id: self.id }, SendOptions::default())?;
        let sbuf = resp.sbuf.unwrap_or_default();
        let attrs = QpAttrs::decode(&mut WireReader::new(&sbuf));
        if self.state() != QpState::Err {
            self.set_state(attrs.state);
        }
        Ok(attrs)
    }

    /// Destroy in firmware, then drop the QP from its CQs.
    ///
    /// The table entry goes first so no event is dispatched to a QP being
    /// torn down; it is put back if firmware refuses.
    pub(crate) fn destroy(self: &Arc<Self>, table: &ReferenceTable<QueuePair>) -> Result<()> {
        if self.is_destroyed() {
            return Err(QplibError::AlreadyDestroyed(self.id));
        }
        let handle = table.remove(self.id)?;
        if let Err(e) = self
            .rcfw
            .send(&Command::DestroyQp { qp_id: self.id }, SendOptions::default())
        {
            table.restore(self.id, handle);
            return Err(e);
        }

        self.clean();
        self.set_state(QpState::Reset);
        self.destroyed.store(true, Ordering::Release);
        info!("Destroyed QP 0x{:x}", self.id);
        Ok(())
    }

    /// Forget pending completions and flush-list membership
    fn clean(self: &Arc<Self>) {
        self.remove_from_flush_lists();
        let scq = self.scq.upgrade();
        let rcq = self.rcq.upgrade();
        if let Some(cq) = &scq {
            cq.neutralize_qp(self.id);
        }
        if let Some(cq) = &rcq {
            if scq.as_ref().map(|s| s.id()) != Some(cq.id()) {
                cq.neutralize_qp(self.id);
            }
        }
    }

    /// Move to ERR and queue the QP on its CQs' flush lists
    pub fn mark_error(self: &Arc<Self>) {
        self.set_state(QpState::Err);
        self.sq.lock().cancel_phantom();
        self.add_to_flush_lists();
    }

    fn add_to_flush_lists(self: &Arc<Self>) {
        if let Some(scq) = self.scq.upgrade() {
            if !self.sq_flushed.swap(true, Ordering::AcqRel) {
                scq.add_sq_flush(Arc::clone(self));
                debug!("QP 0x{:x} added to SQ flush list of CQ 0x{:x}", self.id, scq.id());
            }
        }
        if self.rq.is_none() {
            return;
        }
        if let Some(rcq) = self.rcq.upgrade() {
            if !self.rq_flushed.swap(true, Ordering::AcqRel) {
                rcq.add_rq_flush(Arc::clone(self));
                debug!("QP 0x{:x} added to RQ flush list of CQ 0x{:x}", self.id, rcq.id());
            }
        }
    }

    fn remove_from_flush_lists(&self) {
        if self.sq_flushed.swap(false, Ordering::AcqRel) {
            if let Some(scq) = self.scq.upgrade() {
                scq.remove_sq_flush(self.id);
            }
        }
        if self.rq_flushed.swap(false, Ordering::AcqRel) {
            if let Some(rcq) = self.rcq.upgrade() {
                rcq.remove_rq_flush(self.id);
            }
        }
    }

    /// Notify `cq` from the worker pool
    fn schedule_notify(&self, cq: &Weak<CompletionQueue>) {
        if let Some(cq) = cq.upgrade() {
            debug!("QP 0x{:x} in error, scheduling notification on CQ 0x{:x}", self.id, cq.id());
            self.worker.submit(move || cq.notify());
        }
    }

    /// Queue a send WQE; the doorbell is rung by `post_send_db`.
    ///
    /// # Returns
    /// `QueueFull` when the shadow ring or the hardware ring (plus headroom)
    /// has no room; producer and consumer are then untouched
    pub fn post_send(&self, wqe: &SendWqe) -> Result<()> {
        let state = self.state();
        let encode = match state {
            QpState::Rts | QpState::Sqd => true,
            QpState::Err => false,
            other => {
                return Err(QplibError::InvalidState(format!(
                    "QP 0x{:x} cannot send in {:?}",
                    self.id, other
                )))
            }
        };
        let datagram = self.qp_type.is_datagram();
        if datagram {
            if wqe.ud.is_none() || !wqe.op.allowed_on_datagram() {
                return Err(QplibError::InvalidArgument(format!(
                    "{:?} QP needs a datagram SEND with a destination",
                    self.qp_type
                )));
            }
        } else if wqe.ud.is_some() {
            return Err(QplibError::InvalidArgument(
                "destination given for a connected QP".into(),
            ));
        }

        self.sq.lock().post(wqe, encode, datagram)?;
        if !encode {
            self.schedule_notify(&self.scq);
        }
        Ok(())
    }

    pub fn post_send_db(&self) {
        self.sq.lock().ring_doorbell();
    }

    /// Queue a receive WQE; the doorbell is rung by `post_recv_db`
    pub fn post_recv(&self, wqe: &RecvWqe) -> Result<()> {
        let Some(rq) = &self.rq else {
            return Err(QplibError::InvalidState(format!(
                "QP 0x{:x} receives through an SRQ",
                self.id
            )));
        };
        let state = self.state();
        if state == QpState::Reset {
            return Err(QplibError::InvalidState(format!(
                "QP 0x{:x} cannot receive in RESET",
                self.id
            )));
        }
        let encode = state != QpState::Err;
        rq.lock().post(wqe, encode)?;
        if !encode {
            self.schedule_notify(&self.rcq);
        }
        Ok(())
    }

    pub fn post_recv_db(&self) {
        if let Some(rq) = &self.rq {
            rq.lock().ring_doorbell();
        }
    }

    /// Post the fence WQE the phantom-completion workaround asked for.
    ///
    /// # Returns
    /// Whether a fence was posted
    pub(crate) fn post_phantom(&self) -> Result<bool> {
        let mut sq = self.sq.lock();
        if !sq.send_phantom {
            return Ok(false);
        }
        sq.post(&SendWqe::phantom_fence(), true, false)?;
        sq.send_phantom = false;
        sq.ring_doorbell();
        debug!("QP 0x{:x}: phantom fence posted", self.id);
        Ok(true)
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        debug!(
            "Dropping QP 0x{:x} (destroyed: {})",
            self.id,
            self.destroyed.load(Ordering::Acquire)
        );
    }
}
