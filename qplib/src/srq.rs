//! Shared receive queues
//!
//! Receive WQEs posted here can be consumed by any QP attached to the SRQ.
//! Completion records name the shadow entry ("tag") a WQE was posted
//! under, so tags come from a free list instead of ring order.

use crate::device::Device;
use crate::doorbell::{DoorbellInfo, DoorbellType};
use crate::hsi::{WireReader, DB_OFFSET_QUEUE, SLOT_SIZE};
use crate::hwq::{HardwareQueue, HwqAttr, HwqType};
use crate::qp::wqe::rq_slots_per_wqe;
use crate::qp::RecvWqe;
use crate::rcfw::cmd::CreateSrqReq;
use crate::rcfw::{Command, ControlChannel, SendOptions};
use crate::reftbl::ReferenceTable;
use crate::{QplibError, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrqInitAttrs {
    pub pd_id: u32,
    pub max_wr: u32,
    pub max_sge: u32,
    /// Arm limit; 0 leaves the SRQ unarmed
    pub limit: u32,
    /// CQ that receives the SRQ's limit notifications, if any
    pub cq_id: Option<u32>,
}

impl SrqInitAttrs {
    pub fn new(max_wr: u32, max_sge: u32) -> Self {
        Self {
            pd_id: 0,
            max_wr,
            max_sge,
            limit: 0,
            cq_id: None,
        }
    }
}

/// Firmware's view of an SRQ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrqQuery {
    pub limit: u32,
    pub max_wr: u32,
}

struct SrqRing {
    hwq: HardwareQueue,
    db: DoorbellInfo,
    slots_per_wqe: u32,
    shadow: Vec<Option<u64>>,
    free: VecDeque<u32>,
    limit: u32,
    armed: bool,
}

impl SrqRing {
    fn posted(&self) -> u32 {
        self.shadow.len() as u32 - self.free.len() as u32
    }

    fn arm_if_due(&mut self) {
        if self.armed && self.posted() > self.limit {
            self.armed = false;
            self.db.ring(DoorbellType::SrqArm, self.limit, false, 0);
            debug!("SRQ 0x{:x} armed at limit {}", self.db.xid(), self.limit);
        }
    }
}

pub struct SharedReceiveQueue {
    id: u32,
    pd_id: u32,
    max_sge: u32,
    ring: Mutex<SrqRing>,
    rcfw: Arc<ControlChannel>,
    destroyed: AtomicBool,
}

impl SharedReceiveQueue {
    pub(crate) fn create(dev: &Device, init: SrqInitAttrs) -> Result<Arc<Self>> {
        if init.max_wr == 0 {
            return Err(QplibError::InvalidArgument("SRQ needs at least one WQE".into()));
        }
        if init.limit > init.max_wr {
            return Err(QplibError::InvalidArgument(format!(
                "SRQ limit {} above depth {}",
                init.limit, init.max_wr
            )));
        }
        let slots_per_wqe = rq_slots_per_wqe(init.max_sge);
        let hwq = HardwareQueue::allocate(
            dev.dma.as_ref(),
            &HwqAttr::ring(init.max_wr * slots_per_wqe, SLOT_SIZE as u32, HwqType::Queue),
        )?;
        let req = CreateSrqReq {
            pd_id: init.pd_id,
            table: hwq.page_table(),
            wqes: init.max_wr,
            max_sge: init.max_sge,
            limit: init.limit,
            cq_id: init.cq_id.unwrap_or(0),
        };
        let resp = dev.rcfw.send(&Command::CreateSrq(req), SendOptions::default())?;
        let id = resp.xid;

        let srq = Arc::new(Self {
            id,
            pd_id: init.pd_id,
            max_sge: init.max_sge,
            ring: Mutex::new(SrqRing {
                hwq,
                db: DoorbellInfo::new(Arc::clone(&dev.db), DB_OFFSET_QUEUE, id),
                slots_per_wqe,
                shadow: vec![None; init.max_wr as usize],
                free: (0..init.max_wr).collect(),
                limit: init.limit,
                armed: init.limit > 0,
            }),
            rcfw: Arc::clone(&dev.rcfw),
            destroyed: AtomicBool::new(false),
        });

        if let Err(e) = dev.srqs.insert(id, &srq) {
            if let Err(undo) = dev
                .rcfw
                .send(&Command::DestroySrq { srq_id: id }, SendOptions::default())
            {
                warn!("SRQ 0x{:x}: destroy after failed registration: {}", id, undo);
            }
            return Err(e);
        }
        info!("Created SRQ 0x{:x} with {} WQEs", id, init.max_wr);
        Ok(srq)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pd_id(&self) -> u32 {
        self.pd_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Receive WQEs currently posted
    pub fn posted(&self) -> u32 {
        self.ring.lock().posted()
    }

    pub fn is_armed(&self) -> bool {
        self.ring.lock().armed
    }

    /// Post one receive WQE and ring the SRQ doorbell
    pub fn post_recv(&self, wqe: &RecvWqe) -> Result<()> {
        if self.is_destroyed() {
            return Err(QplibError::AlreadyDestroyed(self.id));
        }
        if wqe.sges.len() as u32 > self.max_sge {
            return Err(QplibError::InvalidArgument(format!(
                "{} SGEs exceed the SRQ limit of {}",
                wqe.sges.len(),
                self.max_sge
            )));
        }
        let mut ring = self.ring.lock();
        let spw = ring.slots_per_wqe;
        if ring.hwq.is_full(spw) {
            return Err(QplibError::QueueFull);
        }
        let Some(tag) = ring.free.pop_front() else {
            return Err(QplibError::QueueFull);
        };

        let start = ring.hwq.prod();
        let bytes = wqe.encode(tag, spw);
        for (i, chunk) in bytes.chunks(SLOT_SIZE).enumerate() {
            if let Err(e) = ring.hwq.write_slot(start + i as u32, 0, chunk) {
                ring.free.push_front(tag);
                return Err(e);
            }
        }
        ring.shadow[tag as usize] = Some(wqe.wr_id);
        ring.hwq.advance_producer(spw);
        ring.db
            .ring(DoorbellType::Srq, ring.hwq.prod(), ring.hwq.prod_epoch(), 0);
        ring.arm_if_due();
        Ok(())
    }

    /// Give back the entry a completion consumed
    ///
    /// # Returns
    /// The work-request id posted under `tag`, or `None` if the tag was idle
    pub(crate) fn release(&self, tag: u32) -> Option<u64> {
        let mut ring = self.ring.lock();
        let wr_id = ring.shadow.get_mut(tag as usize)?.take()?;
        let spw = ring.slots_per_wqe;
        ring.hwq.advance_consumer(spw);
        ring.free.push_back(tag);
        Some(wr_id)
    }

    /// Firmware reported the SRQ dropped below its limit
    pub(crate) fn limit_reached(&self) {
        self.ring.lock().armed = false;
        debug!("SRQ 0x{:x} limit reached", self.id);
    }

    /// Set a new arm limit. The adapter raises a limit event once the
    /// posted count falls below it.
    pub fn modify(&self, limit: u32) -> Result<()> {
        let depth = self.ring.lock().shadow.len() as u32;
        if limit > depth {
            return Err(QplibError::InvalidArgument(format!(
                "SRQ limit {} above depth {}",
                limit, depth
            )));
        }
        self.rcfw.send(
            &Command::ModifySrq {
                srq_id: self.id,
                limit,
            },
            SendOptions::default(),
        )?;
        let mut ring = self.ring.lock();
        ring.limit = limit;
        ring.armed = limit > 0;
        ring.arm_if_due();
        Ok(())
    }

    pub fn query(&self) -> Result<SrqQuery> {
        let resp = self
            .rcfw
            .send(&Command::QuerySrq { srq_id: self.id }, SendOptions::default())?;
        let sbuf = resp.sbuf.unwrap_or_default();
        let mut r = WireReader::new(&sbuf);
        Ok(SrqQuery {
            limit: r.u32(),
            max_wr: r.u32(),
        })
    }

    pub(crate) fn destroy(self: &Arc<Self>, table: &ReferenceTable<SharedReceiveQueue>) -> Result<()> {
        if self.is_destroyed() {
            return Err(QplibError::AlreadyDestroyed(self.id));
        }
        let handle = table.remove(self.id)?;
        if let Err(e) = self
            .rcfw
            .send(&Command::DestroySrq { srq_id: self.id }, SendOptions::default())
        {
            table.restore(self.id, handle);
            return Err(e);
        }
        self.destroyed.store(true, Ordering::Release);
        info!("Destroyed SRQ 0x{:x}", self.id);
        Ok(())
    }
}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        debug!("Dropping SRQ 0x{:x}", self.id);
    }
}
