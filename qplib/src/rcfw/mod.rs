//! Firmware control channel (RCFW)
//!
//! A command ring (host → firmware) and an event ring (firmware → host).
//! Each command is tagged with a cookie; the event-ring service routine
//! matches responses back to their command slots, wakes waiters, and hands
//! unsolicited error events to the registered async handler.
//!
//! Fail-fast conditions: a detached device fails every command except the
//! teardown opcodes (which report success), and a channel that has timed
//! out repeatedly without forward progress is marked stalled and refuses
//! all further commands.

pub mod cmd;
pub mod wait;

pub use cmd::{Command, CommandResponse, Opcode};
pub use wait::{WaitOutcome, WaitQueue, WaitStrategy};

use crate::config::RcfwConfig;
use crate::dma::{DmaAllocator, DmaBlock};
use crate::doorbell::{DoorbellRegion, DoorbellType, DoorbellWord};
use crate::hsi::{self, CmdqHeader, CreqEntry, WireWriter, CMDQE_SIZE, CREQE_SIZE};
use crate::hwq::{HardwareQueue, HwqAttr, HwqType, PageTableInfo};
use crate::{QplibError, Result};
use bitflags::bitflags;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wait::Semaphore;

/// Cookie bit marking a command whose submitter spins
pub const COOKIE_BLOCKING: u16 = 0x8000;
pub const COOKIE_MASK: u16 = 0x7fff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        const ENABLED = 1 << 0;
        const INITIALIZED = 1 << 1;
        const DETACHED = 1 << 2;
        const STALLED = 1 << 3;
        const INTERRUPTS = 1 << 4;
    }
}

/// Unsolicited firmware events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    QpError { xid: u32, req_err: u8, res_err: u8 },
    CqError { xid: u32, reason: u8 },
    Function { event: u8, data: u32 },
}

pub type AsyncHandler = Arc<dyn Fn(AsyncEvent) + Send + Sync>;

/// Where the response of an in-flight command lands
#[derive(Default)]
struct ResponseCell {
    response: Mutex<Option<CommandResponse>>,
}

impl ResponseCell {
    fn is_filled(&self) -> bool {
        self.response.lock().is_some()
    }
}

/// Per in-flight command record, indexed by cookie
#[derive(Default)]
struct CommandSlot {
    opcode: Option<Opcode>,
    cookie: u16,
    in_use: bool,
    waiter_alive: bool,
    submitted_at: Option<Instant>,
    req_slots: u32,
    cell: Option<Arc<ResponseCell>>,
    sbuf: Option<DmaBlock>,
}

struct CmdqState {
    hwq: HardwareQueue,
    seq: u16,
    slots: Vec<CommandSlot>,
}

impl CmdqState {
    fn slot_index(&self, cookie: u16) -> usize {
        (cookie & COOKIE_MASK) as usize % self.slots.len()
    }

    /// Free slots whose waiter gave up at least `grace` ago, returning their
    /// ring space. A response arriving afterwards no longer matches a slot.
    fn reclaim_abandoned(&mut self, grace: Duration) {
        for i in 0..self.slots.len() {
            let slot = &self.slots[i];
            let aged = slot.submitted_at.is_some_and(|t| t.elapsed() >= grace);
            if !slot.in_use || slot.waiter_alive || !aged {
                continue;
            }
            let slot = std::mem::take(&mut self.slots[i]);
            warn!(
                "Reclaiming command slot {} of abandoned {:?} (cookie 0x{:x})",
                i, slot.opcode, slot.cookie
            );
            self.hwq.advance_consumer(slot.req_slots);
        }
    }

    /// Move `seq` to the next cookie whose slot is free
    fn next_free_slot(&mut self) -> Option<usize> {
        for _ in 0..self.slots.len() {
            let idx = self.slot_index(self.seq & COOKIE_MASK);
            if !self.slots[idx].in_use {
                return Some(idx);
            }
            self.seq = self.seq.wrapping_add(1);
        }
        None
    }
}

struct CreqState {
    hwq: HardwareQueue,
}

/// Options for one submission
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Spin for completion instead of sleeping
    pub blocking: bool,
}

impl SendOptions {
    pub fn blocking() -> Self {
        Self { blocking: true }
    }
}

pub struct ControlChannel {
    config: RcfwConfig,
    dma: Arc<dyn DmaAllocator>,
    ctrl: Arc<dyn DoorbellRegion>,
    cmdq: Mutex<CmdqState>,
    creq: Mutex<CreqState>,
    waitq: WaitQueue,
    flags: AtomicU32,
    inflight: Semaphore,
    /// Event-ring entries consumed so far; stall detection watches it
    progress: AtomicU64,
    consecutive_timeouts: AtomicU32,
    async_handler: RwLock<Option<AsyncHandler>>,
}

impl ControlChannel {
    /// Allocate both rings and program their locations into the control
    /// region. The channel accepts only pre-initialization opcodes until
    /// `initialize_firmware` succeeds.
    pub fn new(
        config: RcfwConfig,
        dma: Arc<dyn DmaAllocator>,
        ctrl: Arc<dyn DoorbellRegion>,
    ) -> Result<Self> {
        let cmdq_hwq = HardwareQueue::allocate(
            dma.as_ref(),
            &HwqAttr::ring(config.cmdq_depth, CMDQE_SIZE as u32, HwqType::Queue),
        )?;
        let creq_hwq = HardwareQueue::allocate(
            dma.as_ref(),
            &HwqAttr::ring(config.creq_depth, CREQE_SIZE as u32, HwqType::Completion),
        )?;

        let table_len = cmdq_hwq.depth() as usize;
        let channel = Self {
            inflight: Semaphore::new(config.non_blocking_shadow_qd.max(1)),
            config,
            dma,
            ctrl,
            cmdq: Mutex::new(CmdqState {
                hwq: cmdq_hwq,
                seq: 0,
                slots: (0..table_len).map(|_| CommandSlot::default()).collect(),
            }),
            creq: Mutex::new(CreqState { hwq: creq_hwq }),
            waitq: WaitQueue::new(),
            flags: AtomicU32::new(0),
            progress: AtomicU64::new(0),
            consecutive_timeouts: AtomicU32::new(0),
            async_handler: RwLock::new(None),
        };
        channel.enable();
        Ok(channel)
    }

    fn enable(&self) {
        let cmdq = self.cmdq.lock().hwq.page_table();
        let creq = self.creq.lock().hwq.page_table();

        self.ctrl.write64(hsi::CTRL_CMDQ_ROOT, cmdq.root);
        self.ctrl
            .write64(hsi::CTRL_CMDQ_GEOM, hsi::encode_geometry(cmdq.depth, cmdq.level));
        self.ctrl.write64(hsi::CTRL_CREQ_ROOT, creq.root);
        self.ctrl
            .write64(hsi::CTRL_CREQ_GEOM, hsi::encode_geometry(creq.depth, creq.level));
        self.set_flag(ChannelFlags::ENABLED);

        info!(
            "Control channel enabled: cmdq depth={} ({:?}), creq depth={} ({:?})",
            cmdq.depth, cmdq.level, creq.depth, creq.level
        );
    }

    /// Stop the channel; subsequent submissions fail
    pub fn disable(&self) {
        if self.flags().contains(ChannelFlags::ENABLED) {
            self.clear_flag(ChannelFlags::ENABLED | ChannelFlags::INTERRUPTS);
            self.ctrl.write64(hsi::CTRL_DISABLE, 1);
            info!("Control channel disabled");
        }
    }

    pub fn flags(&self) -> ChannelFlags {
        ChannelFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: ChannelFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: ChannelFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn config(&self) -> &RcfwConfig {
        &self.config
    }

    pub fn is_stalled(&self) -> bool {
        self.flags().contains(ChannelFlags::STALLED)
    }

    pub fn is_detached(&self) -> bool {
        self.flags().contains(ChannelFlags::DETACHED)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags().contains(ChannelFlags::INITIALIZED)
    }

    /// Device went away; from now on only teardown commands "succeed"
    pub fn mark_detached(&self) {
        warn!("Control channel: device detached");
        self.set_flag(ChannelFlags::DETACHED);
        self.waitq.notify_all();
    }

    /// Event ring is now serviced from an interrupt callback
    pub fn enable_interrupts(&self) {
        if self.config.use_interrupts {
            self.set_flag(ChannelFlags::INTERRUPTS);
        }
    }

    pub fn set_async_handler(&self, handler: AsyncHandler) {
        *self.async_handler.write() = Some(handler);
    }

    pub fn cmdq_table(&self) -> PageTableInfo {
        self.cmdq.lock().hwq.page_table()
    }

    pub fn creq_table(&self) -> PageTableInfo {
        self.creq.lock().hwq.page_table()
    }

    /// Free slots in the command ring
    pub fn cmdq_free_slots(&self) -> u32 {
        self.cmdq.lock().hwq.free_slots()
    }

    /// Commands whose slot has not been released yet
    pub fn outstanding(&self) -> usize {
        self.cmdq.lock().slots.iter().filter(|s| s.in_use).count()
    }

    pub fn initialize_firmware(&self) -> Result<()> {
        self.send(&Command::InitializeFw, SendOptions::blocking())?;
        self.set_flag(ChannelFlags::INITIALIZED);
        info!("Firmware initialized");
        Ok(())
    }

    pub fn deinitialize_firmware(&self) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        let result = self.send(&Command::DeinitializeFw, SendOptions::blocking());
        self.clear_flag(ChannelFlags::INITIALIZED);
        result.map(|_| info!("Firmware deinitialized"))
    }

    fn strategy_for(&self, options: SendOptions) -> WaitStrategy {
        if options.blocking {
            WaitStrategy::Block
        } else if self.flags().contains(ChannelFlags::INTERRUPTS) {
            WaitStrategy::Interrupt
        } else {
            WaitStrategy::SelfPoll
        }
    }

    /// Submit `cmd` and wait for its response.
    ///
    /// # Returns
    /// The firmware response, or an error for a full ring, a non-zero
    /// firmware status (GID updates exempt), a timeout, a stalled channel
    /// or a detached device
    pub fn send(&self, cmd: &Command, options: SendOptions) -> Result<CommandResponse> {
        let opcode = cmd.opcode();
        let flags = self.flags();

        if flags.contains(ChannelFlags::DETACHED) {
            if opcode.succeeds_when_detached() {
                debug!("{:?} on detached device reported as done", opcode);
                return Ok(CommandResponse::detached_noop(opcode));
            }
            return Err(QplibError::Detached);
        }
        if flags.contains(ChannelFlags::STALLED) {
            return Err(QplibError::Stalled);
        }
        if !flags.contains(ChannelFlags::ENABLED) {
            return Err(QplibError::InvalidState("control channel disabled".into()));
        }
        if !flags.contains(ChannelFlags::INITIALIZED) && !opcode.allowed_before_init() {
            return Err(QplibError::NotInitialized(opcode));
        }

        let strategy = self.strategy_for(options);
        let _permit = if options.blocking {
            None
        } else {
            Some(
                self.inflight
                    .acquire_timeout(self.config.admission_timeout())
                    .ok_or_else(|| QplibError::Busy("non-blocking command window full".into()))?,
            )
        };

        let progress_at_submit = self.progress.load(Ordering::Acquire);
        let (cookie, cell) = self.post(cmd, options.blocking)?;

        let done = || cell.is_filled();
        let service = || {
            self.service_creq();
        };
        let outcome = match strategy {
            WaitStrategy::Block => wait::wait_block(
                &done,
                &service,
                self.config.blocking_ceiling(),
                Duration::from_micros(1),
            ),
            WaitStrategy::Interrupt => wait::wait_interrupt(
                &self.waitq,
                &done,
                &service,
                self.config.cmd_timeout(),
                self.config.nudge_interval(),
            ),
            WaitStrategy::SelfPoll => wait::wait_self_poll(
                &done,
                &service,
                self.config.cmd_timeout(),
                self.config.poll_interval(),
            ),
        };

        let response = match outcome {
            WaitOutcome::Completed => cell.response.lock().take(),
            WaitOutcome::TimedOut => None,
        };

        let Some(response) = response else {
            if self.is_detached() {
                self.abandon(cookie);
                return if opcode.succeeds_when_detached() {
                    Ok(CommandResponse::detached_noop(opcode))
                } else {
                    Err(QplibError::Detached)
                };
            }
            self.on_timeout(cookie, opcode, progress_at_submit);
            return Err(QplibError::Timeout(opcode));
        };

        self.consecutive_timeouts.store(0, Ordering::Release);

        if !response.is_ok() {
            if opcode.failure_exempt() {
                warn!(
                    "{:?} failed with status 0x{:x}, ignored",
                    opcode, response.status
                );
                return Ok(response);
            }
            error!(
                "Firmware failed {:?} (cookie 0x{:x}) with status 0x{:x}",
                opcode, cookie, response.status
            );
            return Err(QplibError::Firmware {
                opcode,
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Place `cmd` in the command ring and ring the doorbell
    fn post(&self, cmd: &Command, blocking: bool) -> Result<(u16, Arc<ResponseCell>)> {
        let opcode = cmd.opcode();
        let body = cmd.encode_body();
        let sbuf = match cmd.sbuf_size() {
            0 => None,
            size => Some(self.dma.alloc(size)?),
        };
        let cmd_bytes = (CMDQE_SIZE + body.len()).div_ceil(CMDQE_SIZE) * CMDQE_SIZE;
        let req_slots = (cmd_bytes / CMDQE_SIZE) as u32;

        let mut cmdq = self.cmdq.lock();
        let grace = self.config.blocking_ceiling().min(self.config.cmd_timeout());
        cmdq.reclaim_abandoned(grace);
        if cmdq.hwq.is_full(req_slots) {
            warn!(
                "Command ring full: {:?} needs {} slots, {} free",
                opcode,
                req_slots,
                cmdq.hwq.free_slots()
            );
            return Err(QplibError::QueueFull);
        }

        // Slots of timed-out commands younger than the grace period are skipped
        let Some(idx) = cmdq.next_free_slot() else {
            return Err(QplibError::Busy("no free command slot".into()));
        };
        let mut cookie = cmdq.seq & COOKIE_MASK;
        if blocking {
            cookie |= COOKIE_BLOCKING;
        }
        cmdq.seq = cmdq.seq.wrapping_add(1);

        let header = CmdqHeader {
            opcode: opcode as u8,
            cmd_slots: req_slots as u8,
            flags: 0,
            cookie,
            sbuf_slots: sbuf
                .as_ref()
                .map(|b| (b.len().div_ceil(CMDQE_SIZE)) as u16)
                .unwrap_or(0),
            sbuf_addr: sbuf.as_ref().map(DmaBlock::bus_addr).unwrap_or(0),
        };
        let mut w = WireWriter::new();
        header.encode(&mut w);
        w.bytes(&body).pad_to(CMDQE_SIZE);
        let bytes = w.finish();

        let prod = cmdq.hwq.prod();
        for (i, chunk) in bytes.chunks(CMDQE_SIZE).enumerate() {
            cmdq.hwq.write_slot(prod + i as u32, 0, chunk)?;
        }

        let cell = Arc::new(ResponseCell::default());
        cmdq.slots[idx] = CommandSlot {
            opcode: Some(opcode),
            cookie,
            in_use: true,
            waiter_alive: true,
            submitted_at: Some(Instant::now()),
            req_slots,
            cell: Some(Arc::clone(&cell)),
            sbuf,
        };

        cmdq.hwq.advance_producer(req_slots);
        let word = DoorbellWord {
            xid: 0,
            kind: DoorbellType::Cmdq,
            index: cmdq.hwq.prod(),
            epoch: cmdq.hwq.prod_epoch(),
            toggle: 0,
        };
        self.ctrl.write64(hsi::CTRL_CMDQ_DB, word.encode());

        debug!(
            "Posted {:?}: cookie=0x{:x}, slots={}, prod={}",
            opcode,
            cookie,
            req_slots,
            cmdq.hwq.prod()
        );
        Ok((cookie, cell))
    }

    /// The waiter gave up: a late response must be dropped, not delivered
    fn abandon(&self, cookie: u16) {
        let mut cmdq = self.cmdq.lock();
        let idx = cmdq.slot_index(cookie);
        let slot = &mut cmdq.slots[idx];
        if slot.in_use && slot.cookie == cookie {
            slot.waiter_alive = false;
            slot.cell = None;
        }
    }

    fn on_timeout(&self, cookie: u16, opcode: Opcode, progress_at_submit: u64) {
        self.abandon(cookie);

        let progressed = self.progress.load(Ordering::Acquire) != progress_at_submit;
        if progressed {
            warn!(
                "{:?} (cookie 0x{:x}) timed out while firmware is still answering",
                opcode, cookie
            );
            self.consecutive_timeouts.store(0, Ordering::Release);
            return;
        }

        let count = self.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        let (prod, cons) = {
            let cmdq = self.cmdq.lock();
            (cmdq.hwq.prod(), cmdq.hwq.cons())
        };
        error!(
            "{:?} (cookie 0x{:x}) timed out, no firmware progress ({}/{}), cmdq prod={} cons={}",
            opcode, cookie, count, self.config.stall_threshold, prod, cons
        );
        if count >= self.config.stall_threshold.max(1) {
            error!("Firmware stall detected, failing all further commands");
            self.set_flag(ChannelFlags::STALLED);
        }
    }

    /// Drain the event ring: complete commands and dispatch async events.
    /// Called from the interrupt path and by waiting submitters.
    ///
    /// # Returns
    /// Number of entries consumed
    pub fn service_creq(&self) -> usize {
        let mut events = Vec::new();
        let mut completed = 0usize;
        let mut consumed = 0usize;

        {
            let mut creq = self.creq.lock();
            let budget = creq.hwq.depth() as usize;
            let mut raw = [0u8; CREQE_SIZE];
            while consumed < budget {
                let cons = creq.hwq.cons();
                if creq.hwq.read_slot(cons, &mut raw).is_err() {
                    break;
                }
                if CreqEntry::toggle(&raw) != creq.hwq.expected_toggle() {
                    break;
                }

                match CreqEntry::decode(&raw) {
                    CreqEntry::CmdResponse {
                        status,
                        cookie,
                        opcode,
                        xid,
                        data,
                    } => {
                        if self.complete(cookie, opcode, status, xid, data) {
                            completed += 1;
                        }
                    }
                    CreqEntry::QpError {
                        xid,
                        req_err,
                        res_err,
                    } => events.push(AsyncEvent::QpError {
                        xid,
                        req_err,
                        res_err,
                    }),
                    CreqEntry::CqError { xid, reason } => {
                        events.push(AsyncEvent::CqError { xid, reason })
                    }
                    CreqEntry::FuncEvent { event, data } => {
                        events.push(AsyncEvent::Function { event, data })
                    }
                    CreqEntry::Unknown { kind } => {
                        warn!("Unknown event ring entry type 0x{:x}", kind);
                    }
                }
                creq.hwq.advance_consumer(1);
                consumed += 1;
            }

            if consumed > 0 {
                let word = DoorbellWord {
                    xid: 0,
                    kind: DoorbellType::Creq,
                    index: creq.hwq.cons(),
                    epoch: creq.hwq.cons_epoch(),
                    toggle: 0,
                };
                self.ctrl.write64(hsi::CTRL_CREQ_DB, word.encode());
            }
        }

        if consumed > 0 {
            self.progress.fetch_add(consumed as u64, Ordering::AcqRel);
        }
        if completed > 0 {
            self.waitq.notify_all();
        }
        if !events.is_empty() {
            let handler = self.async_handler.read().clone();
            for event in events {
                debug!("Async event: {:?}", event);
                match &handler {
                    Some(handler) => handler(event),
                    None => warn!("Async event {:?} with no handler", event),
                }
            }
        }
        consumed
    }

    /// Match a response to its slot, fill the waiter's cell and free the slot
    fn complete(&self, cookie: u16, raw_opcode: u8, status: u8, xid: u32, data: u32) -> bool {
        let mut cmdq = self.cmdq.lock();
        let idx = cmdq.slot_index(cookie);
        let slot = &mut cmdq.slots[idx];

        if !slot.in_use || slot.cookie != cookie {
            warn!(
                "Response for unknown cookie 0x{:x} (opcode 0x{:x}) dropped",
                cookie, raw_opcode
            );
            return false;
        }

        let slot = std::mem::take(slot);
        let opcode = match slot.opcode {
            Some(op) => op,
            None => return false,
        };
        if opcode as u8 != raw_opcode {
            warn!(
                "Cookie 0x{:x}: response opcode 0x{:x} for {:?}",
                cookie, raw_opcode, opcode
            );
        }
        cmdq.hwq.advance_consumer(slot.req_slots);

        if !slot.waiter_alive {
            let age = slot.submitted_at.map(|t| t.elapsed()).unwrap_or_default();
            warn!(
                "Late response for {:?} (cookie 0x{:x}) after {:?}, discarded",
                opcode, cookie, age
            );
            return false;
        }

        let sbuf = slot.sbuf.as_ref().and_then(|block| {
            let mut buf = vec![0u8; block.len()];
            block.read(0, &mut buf).ok().map(|_| buf)
        });
        if let Some(cell) = slot.cell {
            *cell.response.lock() = Some(CommandResponse {
                opcode,
                status,
                cookie,
                xid,
                data,
                sbuf,
            });
        }
        true
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        debug!(
            "Dropping control channel, {} commands outstanding",
            self.outstanding()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::RecordingDoorbell;
    use crate::dma::HostDma;
    use crate::hwq::translate;
    use proptest::prelude::*;
    use std::thread;

    /// Firmware stand-in driven by the test thread
    struct ScriptedFirmware {
        dma: Arc<HostDma>,
        cmdq: PageTableInfo,
        creq: PageTableInfo,
        cmdq_cons: u32,
        creq_prod: u32,
        creq_epoch: bool,
    }

    impl ScriptedFirmware {
        fn new(dma: Arc<HostDma>, channel: &ControlChannel) -> Self {
            Self {
                dma,
                cmdq: channel.cmdq_table(),
                creq: channel.creq_table(),
                cmdq_cons: 0,
                creq_prod: 0,
                creq_epoch: false,
            }
        }

        /// Pull the next command off the ring: (header, body)
        fn next_command(&mut self) -> (CmdqHeader, Vec<u8>) {
            let mut raw = [0u8; CMDQE_SIZE];
            let addr = translate(&self.dma, &self.cmdq, self.cmdq_cons as u64 * 16).unwrap();
            self.dma.read_bus(addr, &mut raw).unwrap();
            let header = CmdqHeader::decode(&raw);
            let mut body = Vec::new();
            for i in 1..header.cmd_slots as u32 {
                let idx = (self.cmdq_cons + i) % self.cmdq.depth;
                let addr = translate(&self.dma, &self.cmdq, idx as u64 * 16).unwrap();
                self.dma.read_bus(addr, &mut raw).unwrap();
                body.extend_from_slice(&raw);
            }
            self.cmdq_cons = (self.cmdq_cons + header.cmd_slots as u32) % self.cmdq.depth;
            (header, body)
        }

        fn push_event(&mut self, entry: CreqEntry) {
            let raw = entry.encode(!self.creq_epoch);
            let addr = translate(&self.dma, &self.creq, self.creq_prod as u64 * 16).unwrap();
            self.dma.write_bus(addr, &raw).unwrap();
            self.creq_prod += 1;
            if self.creq_prod == self.creq.depth {
                self.creq_prod = 0;
                self.creq_epoch = !self.creq_epoch;
            }
        }

        fn respond(&mut self, header: &CmdqHeader, status: u8, xid: u32) {
            self.push_event(CreqEntry::CmdResponse {
                status,
                cookie: header.cookie,
                opcode: header.opcode,
                xid,
                data: 0,
            });
        }
    }

    fn channel(config: RcfwConfig) -> (Arc<ControlChannel>, Arc<HostDma>, Arc<RecordingDoorbell>) {
        let dma = HostDma::new();
        let ctrl = RecordingDoorbell::new();
        let channel = ControlChannel::new(config, dma.clone(), ctrl.clone()).unwrap();
        (Arc::new(channel), dma, ctrl)
    }

    fn polling_config() -> RcfwConfig {
        RcfwConfig {
            cmdq_depth: 64,
            creq_depth: 16,
            cmd_timeout_ms: 2_000,
            blocking_ceiling_ms: 2_000,
            poll_interval_us: 20,
            use_interrupts: false,
            ..Default::default()
        }
    }

    fn wait_for_posts(ctrl: &RecordingDoorbell, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctrl
            .writes()
            .iter()
            .filter(|(offset, _)| *offset == hsi::CTRL_CMDQ_DB)
            .count()
            < n
        {
            assert!(Instant::now() < deadline, "commands were not posted");
            thread::sleep(Duration::from_micros(50));
        }
    }

    #[test]
    fn test_enable_programs_control_region() {
        let (channel, _dma, ctrl) = channel(polling_config());
        let writes = ctrl.writes();
        assert_eq!(writes[0], (hsi::CTRL_CMDQ_ROOT, channel.cmdq_table().root));
        assert_eq!(writes[2], (hsi::CTRL_CREQ_ROOT, channel.creq_table().root));
        assert!(channel.flags().contains(ChannelFlags::ENABLED));
    }

    #[test]
    fn test_not_initialized_gate() {
        let (channel, _dma, _ctrl) = channel(polling_config());
        let err = channel
            .send(&Command::DestroyCq { cq_id: 1 }, SendOptions::blocking())
            .unwrap_err();
        assert_eq!(err, QplibError::NotInitialized(Opcode::DestroyCq));
        // Nothing touched the ring
        assert_eq!(channel.cmdq_free_slots(), 64);
    }

    #[test]
    fn test_blocking_roundtrip() {
        let (channel, dma, ctrl) = channel(polling_config());
        let mut fw = ScriptedFirmware::new(dma, &channel);

        let submitter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.send(&Command::QueryVersion, SendOptions::blocking()))
        };
        wait_for_posts(&ctrl, 1);
        let (header, _) = fw.next_command();
        assert_eq!(header.opcode, Opcode::QueryVersion as u8);
        assert_ne!(header.cookie & COOKIE_BLOCKING, 0);
        fw.respond(&header, 0, 0x77);

        let response = submitter.join().unwrap().unwrap();
        assert_eq!(response.xid, 0x77);
        assert_eq!(channel.outstanding(), 0);
        assert_eq!(channel.cmdq_free_slots(), 64);
    }

    #[test]
    fn test_firmware_status_and_gid_exemption() {
        let (channel, dma, ctrl) = channel(polling_config());
        channel.set_flag(ChannelFlags::INITIALIZED);
        let mut fw = ScriptedFirmware::new(dma, &channel);

        let c = Arc::clone(&channel);
        let failing = thread::spawn(move || {
            c.send(&Command::DestroyAh { ah_id: 3 }, SendOptions::default())
        });
        wait_for_posts(&ctrl, 1);
        let (header, _) = fw.next_command();
        fw.respond(&header, 0x5, 0);
        assert_eq!(
            failing.join().unwrap().unwrap_err(),
            QplibError::Firmware {
                opcode: Opcode::DestroyAh,
                status: 0x5
            }
        );

        let c = Arc::clone(&channel);
        let exempt = thread::spawn(move || {
            c.send(&Command::DeleteGid { index: 2 }, SendOptions::default())
        });
        wait_for_posts(&ctrl, 2);
        let (header, _) = fw.next_command();
        fw.respond(&header, 0x5, 0);
        let response = exempt.join().unwrap().unwrap();
        assert_eq!(response.status, 0x5);
    }

    #[test]
    fn test_timeouts_stall_after_threshold() {
        let (channel, _dma, _ctrl) = channel(RcfwConfig {
            blocking_ceiling_ms: 20,
            stall_threshold: 2,
            ..polling_config()
        });
        channel.set_flag(ChannelFlags::INITIALIZED);

        let err = channel
            .send(&Command::QueryQp { qp_id: 1 }, SendOptions::blocking())
            .unwrap_err();
        assert_eq!(err, QplibError::Timeout(Opcode::QueryQp));
        assert!(!channel.is_stalled());

        let err = channel
            .send(&Command::QueryQp { qp_id: 1 }, SendOptions::blocking())
            .unwrap_err();
        assert_eq!(err, QplibError::Timeout(Opcode::QueryQp));
        assert!(channel.is_stalled());

        let free_before = channel.cmdq_free_slots();
        let err = channel
            .send(&Command::QueryQp { qp_id: 1 }, SendOptions::blocking())
            .unwrap_err();
        assert_eq!(err, QplibError::Stalled);
        assert_eq!(channel.cmdq_free_slots(), free_before);
    }

    #[test]
    fn test_late_response_discarded() {
        let (channel, dma, _ctrl) = channel(RcfwConfig {
            blocking_ceiling_ms: 10,
            stall_threshold: 10,
            ..polling_config()
        });
        channel.set_flag(ChannelFlags::INITIALIZED);
        let mut fw = ScriptedFirmware::new(dma, &channel);

        assert!(channel
            .send(&Command::QueryQp { qp_id: 9 }, SendOptions::blocking())
            .is_err());
        assert_eq!(channel.outstanding(), 1);

        let (header, _) = fw.next_command();
        fw.respond(&header, 0, 9);
        assert_eq!(channel.service_creq(), 1);
        // Slot released and ring space returned, nobody received it
        assert_eq!(channel.outstanding(), 0);
        assert_eq!(channel.cmdq_free_slots(), 64);
    }

    #[test]
    fn test_abandoned_slot_reclaimed_by_next_submission() {
        let (channel, dma, ctrl) = channel(RcfwConfig {
            blocking_ceiling_ms: 10,
            stall_threshold: 10,
            ..polling_config()
        });
        channel.set_flag(ChannelFlags::INITIALIZED);
        let mut fw = ScriptedFirmware::new(dma, &channel);

        assert!(channel
            .send(&Command::QueryQp { qp_id: 9 }, SendOptions::blocking())
            .is_err());
        let (lost, _) = fw.next_command();
        assert_eq!(channel.outstanding(), 1);

        let submitter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.send(&Command::QueryVersion, SendOptions::blocking()))
        };
        wait_for_posts(&ctrl, 2);
        let (header, _) = fw.next_command();
        assert_ne!(header.cookie, lost.cookie);
        fw.respond(&header, 0, 1);
        submitter.join().unwrap().unwrap();
        assert_eq!(channel.outstanding(), 0);
        assert_eq!(channel.cmdq_free_slots(), 64);

        // Its slot is gone, so the answer releases nothing twice
        fw.respond(&lost, 0, 9);
        assert_eq!(channel.service_creq(), 1);
        assert_eq!(channel.cmdq_free_slots(), 64);
    }

    #[test]
    fn test_detached_teardown_succeeds() {
        let (channel, _dma, ctrl) = channel(polling_config());
        channel.set_flag(ChannelFlags::INITIALIZED);
        channel.mark_detached();
        ctrl.clear();

        let response = channel
            .send(&Command::DestroyQp { qp_id: 4 }, SendOptions::blocking())
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(
            channel
                .send(&Command::QueryQp { qp_id: 4 }, SendOptions::blocking())
                .unwrap_err(),
            QplibError::Detached
        );
        assert!(ctrl.writes().is_empty());
    }

    #[test]
    fn test_async_events_dispatched() {
        let (channel, dma, _ctrl) = channel(polling_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            channel.set_async_handler(Arc::new(move |event| seen.lock().push(event)));
        }
        let mut fw = ScriptedFirmware::new(dma, &channel);
        fw.push_event(CreqEntry::QpError {
            xid: 7,
            req_err: 1,
            res_err: 0,
        });
        fw.push_event(CreqEntry::CqError { xid: 3, reason: 2 });

        assert_eq!(channel.service_creq(), 2);
        assert_eq!(
            *seen.lock(),
            vec![
                AsyncEvent::QpError {
                    xid: 7,
                    req_err: 1,
                    res_err: 0
                },
                AsyncEvent::CqError { xid: 3, reason: 2 }
            ]
        );
    }

    #[test]
    fn test_event_ring_wraps() {
        let (channel, dma, _ctrl) = channel(polling_config());
        channel.set_async_handler(Arc::new(|_| {}));
        let mut fw = ScriptedFirmware::new(dma, &channel);
        for round in 0..3 {
            for _ in 0..10 {
                fw.push_event(CreqEntry::FuncEvent { event: round, data: 0 });
            }
            assert_eq!(channel.service_creq(), 10);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn responses_route_to_their_submitters(
            order in Just((0u16..6).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let (channel, dma, ctrl) = channel(polling_config());
            channel.set_flag(ChannelFlags::INITIALIZED);
            let mut fw = ScriptedFirmware::new(dma, &channel);

            let submitters: Vec<_> = (0u16..6)
                .map(|index| {
                    let channel = Arc::clone(&channel);
                    thread::spawn(move || {
                        let response = channel
                            .send(&Command::DeleteGid { index }, SendOptions::default())
                            .unwrap();
                        (index, response)
                    })
                })
                .collect();

            wait_for_posts(&ctrl, 6);
            let mut posted = Vec::new();
            for _ in 0..6 {
                let (header, body) = fw.next_command();
                let index = u16::from_le_bytes([body[0], body[1]]);
                posted.push((index, header));
            }
            posted.sort_by_key(|(index, _)| *index);

            for &i in &order {
                let (index, header) = &posted[i as usize];
                fw.respond(header, 0, *index as u32);
            }

            for submitter in submitters {
                let (index, response) = submitter.join().unwrap();
                prop_assert_eq!(response.xid, index as u32);
                let expected_cookie = posted[index as usize].1.cookie;
                prop_assert_eq!(response.cookie, expected_cookie);
            }
            prop_assert_eq!(channel.outstanding(), 0);
        }
    }
}
