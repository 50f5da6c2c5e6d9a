//! Software model of the adapter side
//!
//! Plays firmware and data path against the driver through the same
//! surfaces real hardware uses: register writes arrive on a device thread,
//! rings and side buffers are reached by walking page tables over the bus
//! (`HostDma`), and responses, completions and events are written back
//! into host rings. Interrupts are delivered to the `EventSink` attached
//! through the emulated interrupt line.
//!
//! Fault injection hooks let tests drop, hold, reorder or fail command
//! responses, raise error events and plant raw completion records.

mod datapath;
mod firmware;
mod ring;

use crate::device::{Collaborators, EventSink, InterruptLine};
use crate::dma::{DmaAllocator, HostDma};
use crate::doorbell::DoorbellRegion;
use crate::hsi::{CreqEntry, HwCqe};
use crate::qp::QpState;
use crate::rcfw::Opcode;
use crate::sp::DeviceAttributes;
use crate::{QplibError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) use firmware::EmuState;
pub use firmware::{
    default_attributes, CQ_ERROR_OVERFLOW, FW_STATUS_BUSY, FW_STATUS_INVALID, FW_STATUS_NOT_FOUND,
    FW_STATUS_NO_RESOURCE, FW_STATUS_OK,
};

/// Register writes reaching the device
enum Msg {
    Ctrl { offset: u64, value: u64 },
    Data { offset: u64, value: u64 },
    Sync(Sender<()>),
    Stop,
}

/// Interrupts raised while handling one event, delivered after the state
/// lock is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Note {
    Creq,
    Cq(u32),
}

struct Shared {
    state: Mutex<EmuState>,
    sink: RwLock<Option<Weak<dyn EventSink>>>,
}

impl Shared {
    fn with_state<R>(&self, f: impl FnOnce(&mut EmuState) -> R) -> R {
        let (result, notes) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.take_notes())
        };
        self.deliver(notes);
        result
    }

    fn deliver(&self, notes: Vec<Note>) {
        if notes.is_empty() {
            return;
        }
        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        let Some(sink) = sink else {
            return;
        };
        if notes.contains(&Note::Creq) {
            sink.creq_interrupt();
        }
        for note in notes {
            if let Note::Cq(cq_id) = note {
                sink.cq_notification(cq_id);
            }
        }
    }
}

/// Which register window a region writes to
#[derive(Debug, Clone, Copy)]
enum Window {
    Ctrl,
    Data,
}

struct EmuRegion {
    tx: Sender<Msg>,
    window: Window,
}

impl DoorbellRegion for EmuRegion {
    fn write64(&self, offset: u64, value: u64) {
        let msg = match self.window {
            Window::Ctrl => Msg::Ctrl { offset, value },
            Window::Data => Msg::Data { offset, value },
        };
        if self.tx.send(msg).is_err() {
            debug!("Emulator stopped, register write at 0x{:x} dropped", offset);
        }
    }
}

struct EmuInterruptLine {
    shared: Arc<Shared>,
}

impl InterruptLine for EmuInterruptLine {
    fn attach(&self, sink: Weak<dyn EventSink>) {
        *self.shared.sink.write() = Some(sink);
        debug!("Emulator interrupt line attached");
    }
}

pub struct Emulator {
    dma: Arc<HostDma>,
    shared: Arc<Shared>,
    tx: Sender<Msg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Emulator {
    pub fn new() -> Result<Self> {
        Self::with_attributes(firmware::default_attributes())
    }

    /// Emulate a function reporting `attrs`
    pub fn with_attributes(attrs: DeviceAttributes) -> Result<Self> {
        let dma = HostDma::new();
        let shared = Arc::new(Shared {
            state: Mutex::new(EmuState::new(Arc::clone(&dma), attrs)),
            sink: RwLock::new(None),
        });
        let (tx, rx) = unbounded();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("qplib-emu".into())
            .spawn(move || device_loop(thread_shared, rx))
            .map_err(|e| QplibError::OutOfMemory(format!("emulator thread: {}", e)))?;
        info!("Adapter emulator started");
        Ok(Self {
            dma,
            shared,
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn dma(&self) -> Arc<HostDma> {
        Arc::clone(&self.dma)
    }

    /// Collaborators for `Device::open`; with `interrupts` false the
    /// driver completes commands by self-polling
    pub fn collaborators(&self, interrupts: bool) -> Collaborators {
        let irq: Option<Arc<dyn InterruptLine>> = if interrupts {
            Some(Arc::new(EmuInterruptLine {
                shared: Arc::clone(&self.shared),
            }))
        } else {
            None
        };
        Collaborators {
            dma: Arc::clone(&self.dma) as Arc<dyn DmaAllocator>,
            ctrl: Arc::new(EmuRegion {
                tx: self.tx.clone(),
                window: Window::Ctrl,
            }),
            db: Arc::new(EmuRegion {
                tx: self.tx.clone(),
                window: Window::Data,
            }),
            irq,
        }
    }

    /// Wait until every register write issued so far has been handled
    pub fn quiesce(&self) {
        let (tx, rx) = bounded(1);
        if self.tx.send(Msg::Sync(tx)).is_err() {
            return;
        }
        if rx.recv_timeout(Duration::from_secs(10)).is_err() {
            warn!("Emulator did not quiesce");
        }
    }

    /// Consume commands without ever answering
    pub fn set_silent(&self, silent: bool) {
        self.shared.with_state(|st| st.faults.silent = silent);
    }

    /// Swallow the responses of the next `count` commands of `opcode`
    pub fn drop_responses(&self, opcode: Opcode, count: u32) {
        self.shared
            .with_state(|st| *st.faults.drop.entry(opcode).or_default() += count);
    }

    /// Execute commands of `opcode` but keep their responses until released
    pub fn hold_responses(&self, opcode: Opcode) {
        self.shared.with_state(|st| {
            st.faults.hold.insert(opcode);
        });
    }

    /// Stop holding; responses already held stay held
    pub fn stop_holding(&self, opcode: Opcode) {
        self.shared.with_state(|st| {
            st.faults.hold.remove(&opcode);
        });
    }

    pub fn held_count(&self) -> usize {
        self.shared.with_state(|st| st.faults.held.len())
    }

    /// Write held responses in the given order (indices into the hold list
    /// in the order responses were held); unnamed ones stay held
    pub fn release_held(&self, order: &[usize]) {
        self.shared.with_state(|st| st.release_held(order));
    }

    /// Fail the next command of `opcode` with firmware `status`
    pub fn fail_next(&self, opcode: Opcode, status: u8) {
        self.shared
            .with_state(|st| st.faults.fail_next.entry(opcode).or_default().push_back(status));
    }

    /// Move the QP to ERR and report it the way the adapter does
    pub fn raise_qp_error(&self, qp_id: u32, req_err: u8, res_err: u8) {
        self.shared.with_state(|st| {
            st.set_qp_error(qp_id);
            st.push_creq(CreqEntry::QpError {
                xid: qp_id,
                req_err,
                res_err,
            });
        });
    }

    pub fn raise_cq_error(&self, cq_id: u32, reason: u8) {
        self.shared
            .with_state(|st| st.push_creq(CreqEntry::CqError { xid: cq_id, reason }));
    }

    pub fn raise_function_event(&self, event: u8, data: u32) {
        self.shared
            .with_state(|st| st.push_creq(CreqEntry::FuncEvent { event, data }));
    }

    /// Flag the next signaled send WQE of `qp_id` as needing a phantom fence
    pub fn mark_phantom(&self, qp_id: u32) {
        self.shared.with_state(|st| {
            if let Some(qp) = st.qps.get_mut(&qp_id) {
                qp.mark_phantom = true;
            }
        });
    }

    /// Write a raw completion record into a CQ
    pub fn inject_cqe(&self, cq_id: u32, cqe: HwCqe) {
        self.shared.with_state(|st| st.push_cqe(cq_id, cqe, true));
    }

    pub fn qp_state(&self, qp_id: u32) -> Option<QpState> {
        self.shared.with_state(|st| st.qps.get(&qp_id).map(|qp| qp.state))
    }

    /// Commands executed so far
    pub fn commands_executed(&self) -> u64 {
        self.shared.with_state(|st| st.commands_executed)
    }

    /// Send WQEs executed so far
    pub fn wqes_executed(&self) -> u64 {
        self.shared.with_state(|st| st.wqes_executed)
    }

    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(Msg::Stop);
        if thread.join().is_err() {
            warn!("Emulator thread panicked");
        }
        info!("Adapter emulator stopped");
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn device_loop(shared: Arc<Shared>, rx: Receiver<Msg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Ctrl { offset, value } => shared.with_state(|st| st.ctrl_write(offset, value)),
            Msg::Data { offset, value } => shared.with_state(|st| st.doorbell(offset, value)),
            Msg::Sync(reply) => {
                let _ = reply.send(());
            }
            Msg::Stop => break,
        }
    }
    debug!("Emulator device loop exited");
}
