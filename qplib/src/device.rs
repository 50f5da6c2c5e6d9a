//! Device context
//!
//! Owns everything one driver instance needs: the control channel, the
//! reference tables used for event dispatch, the deferred-task pool and
//! the collaborators (DMA, control and doorbell regions, interrupt line).
//! No state lives in statics; two devices in one process are independent.

use crate::config::QplibConfig;
use crate::cq::{CompletionQueue, Cqe};
use crate::dma::DmaAllocator;
use crate::doorbell::DoorbellRegion;
use crate::hsi::FUNC_EVENT_SRQ_LIMIT;
use crate::qp::{QpInitAttrs, QueuePair};
use crate::rcfw::{AsyncEvent, AsyncHandler, ControlChannel};
use crate::reftbl::ReferenceTable;
use crate::srq::{SharedReceiveQueue, SrqInitAttrs};
use crate::worker::{WorkerHandle, WorkerPool};
use crate::{QplibError, Result};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub use crate::sp::DeviceAttributes;

/// Receives adapter interrupts
pub trait EventSink: Send + Sync {
    /// The firmware event ring has new entries
    fn creq_interrupt(&self);
    /// An armed CQ produced a completion
    fn cq_notification(&self, cq_id: u32);
}

/// Interrupt delivery facility of the platform
pub trait InterruptLine: Send + Sync {
    fn attach(&self, sink: Weak<dyn EventSink>);
}

/// What the platform hands the library
#[derive(Clone)]
pub struct Collaborators {
    pub dma: Arc<dyn DmaAllocator>,
    /// Control-channel register region
    pub ctrl: Arc<dyn DoorbellRegion>,
    /// Data-path doorbell region
    pub db: Arc<dyn DoorbellRegion>,
    /// Without one, commands complete by self-polling
    pub irq: Option<Arc<dyn InterruptLine>>,
}

struct DeviceEvents {
    rcfw: Weak<ControlChannel>,
    cqs: Weak<ReferenceTable<CompletionQueue>>,
}

impl EventSink for DeviceEvents {
    fn creq_interrupt(&self) {
        if let Some(rcfw) = self.rcfw.upgrade() {
            rcfw.service_creq();
        }
    }

    fn cq_notification(&self, cq_id: u32) {
        let Some(cqs) = self.cqs.upgrade() else {
            return;
        };
        match cqs.lookup(cq_id) {
            Some(cq) => cq.notify(),
            None => debug!("Notification for unknown CQ 0x{:x}", cq_id),
        }
    }
}

pub struct Device {
    pub(crate) rcfw: Arc<ControlChannel>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) db: Arc<dyn DoorbellRegion>,
    pub(crate) qps: Arc<ReferenceTable<QueuePair>>,
    pub(crate) cqs: Arc<ReferenceTable<CompletionQueue>>,
    pub(crate) srqs: Arc<ReferenceTable<SharedReceiveQueue>>,
    worker: WorkerPool,
    config: QplibConfig,
    attributes: DeviceAttributes,
    _events: Arc<dyn EventSink>,
    event_handler: Arc<RwLock<Option<AsyncHandler>>>,
    shut_down: AtomicBool,
}

impl Device {
    /// Bring up the control channel and firmware.
    ///
    /// # Arguments
    /// * `config` - Tunables; zero resource limits are replaced by defaults
    /// * `collab` - DMA allocator, register regions and interrupt line
    ///
    /// # Returns
    /// A device with firmware initialized and attributes queried
    pub fn open(config: QplibConfig, collab: Collaborators) -> Result<Self> {
        let config = config.normalized();
        info!(
            "Opening device: cmdq={} creq={} workers={} phantom_workaround={}",
            config.rcfw.cmdq_depth,
            config.rcfw.creq_depth,
            config.worker_threads,
            config.caps.needs_phantom_workaround()
        );

        let rcfw = Arc::new(ControlChannel::new(
            config.rcfw.clone(),
            Arc::clone(&collab.dma),
            Arc::clone(&collab.ctrl),
        )?);
        let qps = Arc::new(ReferenceTable::new("QP", config.max_qp));
        let cqs = Arc::new(ReferenceTable::new("CQ", config.max_cq));
        let srqs = Arc::new(ReferenceTable::new("SRQ", config.max_srq));
        let worker = WorkerPool::new("qplib-worker", config.worker_threads)
            .map_err(|e| QplibError::OutOfMemory(format!("worker pool: {}", e)))?;

        let event_handler: Arc<RwLock<Option<AsyncHandler>>> = Arc::new(RwLock::new(None));
        rcfw.set_async_handler(async_dispatch(
            Arc::clone(&qps),
            Arc::clone(&cqs),
            Arc::clone(&srqs),
            Arc::clone(&event_handler),
        ));

        let events: Arc<dyn EventSink> = Arc::new(DeviceEvents {
            rcfw: Arc::downgrade(&rcfw),
            cqs: Arc::downgrade(&cqs),
        });
        if let Some(irq) = &collab.irq {
            irq.attach(Arc::downgrade(&events));
            rcfw.enable_interrupts();
        }

        let mut dev = Self {
            rcfw,
            dma: collab.dma,
            db: collab.db,
            qps,
            cqs,
            srqs,
            worker,
            config,
            attributes: DeviceAttributes::default(),
            _events: events,
            event_handler,
            shut_down: AtomicBool::new(false),
        };

        dev.rcfw.initialize_firmware()?;
        dev.attributes = dev.query_device()?;
        info!(
            "Device ready: firmware {}, max_qp={} max_cq={}",
            dev.attributes.fw_version_string(),
            dev.attributes.max_qp,
            dev.attributes.max_cq
        );
        Ok(dev)
    }

    pub fn config(&self) -> &QplibConfig {
        &self.config
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    pub fn control_channel(&self) -> &Arc<ControlChannel> {
        &self.rcfw
    }

    pub(crate) fn worker(&self) -> WorkerHandle {
        self.worker.handle()
    }

    /// Forward unsolicited firmware events (after the library has acted on
    /// them) to `handler`
    pub fn set_event_handler(&self, handler: AsyncHandler) {
        *self.event_handler.write() = Some(handler);
    }

    pub fn create_cq(&self, cqe_count: u32) -> Result<Arc<CompletionQueue>> {
        CompletionQueue::create(self, cqe_count)
    }

    pub fn destroy_cq(&self, cq: &Arc<CompletionQueue>) -> Result<()> {
        cq.destroy(&self.cqs)
    }

    pub fn resize_cq(&self, cq: &Arc<CompletionQueue>, cqe_count: u32) -> Result<()> {
        cq.resize(self.dma.as_ref(), cqe_count)
    }

    pub fn create_qp(&self, init: QpInitAttrs) -> Result<Arc<QueuePair>> {
        QueuePair::create(self, init)
    }

    pub fn destroy_qp(&self, qp: &Arc<QueuePair>) -> Result<()> {
        qp.destroy(&self.qps)
    }

    pub fn create_srq(&self, init: SrqInitAttrs) -> Result<Arc<SharedReceiveQueue>> {
        SharedReceiveQueue::create(self, init)
    }

    pub fn destroy_srq(&self, srq: &Arc<SharedReceiveQueue>) -> Result<()> {
        srq.destroy(&self.srqs)
    }

    pub fn lookup_qp(&self, qp_id: u32) -> Option<Arc<QueuePair>> {
        self.qps.lookup(qp_id)
    }

    pub fn lookup_cq(&self, cq_id: u32) -> Option<Arc<CompletionQueue>> {
        self.cqs.lookup(cq_id)
    }

    /// Poll hardware completions, then flushed ones, up to `budget` total.
    /// Posts the phantom fence WQE when the completion path asked for one.
    pub fn poll_cq(&self, cq: &CompletionQueue, budget: usize) -> Vec<Cqe> {
        let result = cq.poll(budget);
        if let Some(qp) = result.needs_phantom {
            match qp.post_phantom() {
                Ok(true) => {}
                Ok(false) => debug!("QP 0x{:x}: phantom fence already posted", qp.id()),
                Err(e) => warn!("QP 0x{:x}: posting phantom fence failed: {}", qp.id(), e),
            }
        }
        let mut cqes = result.cqes;
        if cqes.len() < budget {
            let room = budget - cqes.len();
            cqes.extend(cq.flush_list_process(room));
        }
        cqes
    }

    /// Wait for deferred notifications queued so far
    pub fn drain_deferred(&self) {
        self.worker.drain();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Deinitialize firmware, disable the channel and stop the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.rcfw.deinitialize_firmware() {
            error!("Firmware deinitialization failed: {}", e);
        }
        self.rcfw.disable();
        self.worker.shutdown();
        info!("Device shut down");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!("Dropping device");
        self.shutdown();
    }
}

/// Act on firmware events, then pass them on to the user handler
fn async_dispatch(
    qps: Arc<ReferenceTable<QueuePair>>,
    cqs: Arc<ReferenceTable<CompletionQueue>>,
    srqs: Arc<ReferenceTable<SharedReceiveQueue>>,
    user: Arc<RwLock<Option<AsyncHandler>>>,
) -> AsyncHandler {
    Arc::new(move |event| {
        match event {
            AsyncEvent::QpError {
                xid,
                req_err,
                res_err,
            } => match qps.lookup(xid) {
                Some(qp) => {
                    error!(
                        "QP 0x{:x} error event: req_err=0x{:x} res_err=0x{:x}",
                        xid, req_err, res_err
                    );
                    qp.mark_error();
                    if let Some(cq) = qp.send_cq() {
                        cq.notify();
                    }
                }
                None => warn!("Error event for unknown QP 0x{:x}", xid),
            },
            AsyncEvent::CqError { xid, reason } => match cqs.lookup(xid) {
                Some(cq) => cq.mark_error(reason),
                None => warn!("Error event for unknown CQ 0x{:x}", xid),
            },
            AsyncEvent::Function { event, data } if event == FUNC_EVENT_SRQ_LIMIT => {
                match srqs.lookup(data) {
                    Some(srq) => srq.limit_reached(),
                    None => warn!("Limit event for unknown SRQ 0x{:x}", data),
                }
            }
            AsyncEvent::Function { event, data } => {
                debug!("Function event 0x{:x} data 0x{:x}", event, data);
            }
        }
        let handler = user.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    })
}
