//! Firmware side of the model: control registers, command execution and
//! the resource tables commands act on

use super::ring::Cursor;
use super::Note;
use crate::dma::HostDma;
use crate::doorbell::DoorbellWord;
use crate::hsi::{
    self, CmdqHeader, CreqEntry, HwCqe, WireWriter, CMDQE_SIZE, CQE_CONS_NONE, CQE_REQ_STATUS_OK,
    CREQE_SIZE,
};
use crate::hwq::PageTableInfo;
use crate::qp::wqe::rq_slots_per_wqe;
use crate::qp::{ModifyMask, QpAttrs, QpState, QpType};
use crate::rcfw::cmd::{CreateAhReq, CreateQpReq, CreateSrqReq};
use crate::rcfw::{Command, Opcode};
use crate::sp::DeviceAttributes;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

// Command response status codes
pub const FW_STATUS_OK: u8 = 0x00;
pub const FW_STATUS_INVALID: u8 = 0x01;
pub const FW_STATUS_NO_RESOURCE: u8 = 0x02;
pub const FW_STATUS_BUSY: u8 = 0x03;
pub const FW_STATUS_NOT_FOUND: u8 = 0x04;

/// CQ error reason: a completion found the ring full
pub const CQ_ERROR_OVERFLOW: u8 = 0x01;

/// Attributes the emulated function reports unless told otherwise
pub fn default_attributes() -> DeviceAttributes {
    DeviceAttributes {
        fw_version: 0x0114_0200,
        max_qp: 1024,
        max_qp_wqes: 4095,
        max_sge: 6,
        max_cq: 1024,
        max_cqe: 65536,
        max_srq: 256,
        max_srq_wqes: 4095,
        max_mr: 4096,
        max_ah: 1024,
        max_gid: 32,
        max_inline: 96,
        max_rd_atomic: 16,
    }
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub silent: bool,
    pub drop: HashMap<Opcode, u32>,
    pub hold: HashSet<Opcode>,
    pub held: Vec<CreqEntry>,
    pub fail_next: HashMap<Opcode, VecDeque<u8>>,
}

/// Receive ring of a QP or SRQ as the adapter tracks it
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvRing {
    pub cursor: Cursor,
    /// Producer position from the last doorbell
    pub tail: (u32, bool),
}

impl RecvRing {
    fn new(table: PageTableInfo) -> Self {
        Self {
            cursor: Cursor::new(table),
            tail: (0, false),
        }
    }

    pub fn pending_slots(&self) -> u32 {
        self.cursor.pending_to(self.tail.0, self.tail.1)
    }

    fn reset(&mut self) {
        *self = Self::new(self.cursor.table);
    }
}

#[derive(Debug)]
pub(crate) struct EmuQp {
    pub qp_type: QpType,
    pub state: QpState,
    pub attrs: QpAttrs,
    pub sq: Cursor,
    pub sq_tail: (u32, bool),
    /// Shadow entries; completion indices wrap at this
    pub sq_wqes: u32,
    /// The send queue's auxiliary area holds PSN search entries
    pub psn_table: bool,
    pub rq: Option<RecvRing>,
    pub srq_id: Option<u32>,
    pub scq: u32,
    pub rcq: u32,
    /// Index following the last executed but unreported (unsignaled) WQE
    pub unreported: Option<u16>,
    pub mark_phantom: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arm {
    None,
    Solicited,
    All,
}

#[derive(Debug)]
pub(crate) struct EmuCq {
    pub prod: Cursor,
    pub cons: (u32, bool),
    pub arm: Arm,
}

#[derive(Debug)]
pub(crate) struct EmuSrq {
    pub ring: RecvRing,
    pub slots_per_wqe: u32,
    pub max_wr: u32,
    pub limit: u32,
    pub armed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EmuKey {
    /// (va, length, access) once registered
    pub region: Option<(u64, u64, u32)>,
}

/// What a command produced
struct Outcome {
    status: u8,
    xid: u32,
    data: u32,
    sbuf: Option<Vec<u8>>,
}

impl Outcome {
    fn ok(xid: u32) -> Self {
        Self {
            status: FW_STATUS_OK,
            xid,
            data: 0,
            sbuf: None,
        }
    }

    fn fail(status: u8) -> Self {
        Self {
            status,
            xid: 0,
            data: 0,
            sbuf: None,
        }
    }

    fn with_sbuf(xid: u32, sbuf: Vec<u8>) -> Self {
        Self {
            sbuf: Some(sbuf),
            ..Self::ok(xid)
        }
    }
}

/// Lowest id in `first..limit` not present in `used`
fn free_id<T>(used: &HashMap<u32, T>, first: u32, limit: u32) -> Option<u32> {
    (first..limit).find(|id| !used.contains_key(id))
}

fn valid_transition(from: QpState, to: QpState) -> bool {
    use QpState::*;
    matches!(
        (from, to),
        (_, Reset)
            | (_, Err)
            | (Reset, Init)
            | (Init, Init)
            | (Init, Rtr)
            | (Rtr, Rts)
            | (Rts, Rts)
            | (Rts, Sqd)
            | (Sqd, Rts)
            | (Sqd, Sqd)
            | (Sqe, Rts)
    )
}

pub(crate) struct EmuState {
    pub dma: Arc<HostDma>,
    pub attrs: DeviceAttributes,
    pub faults: Faults,
    pub qps: HashMap<u32, EmuQp>,
    pub cqs: HashMap<u32, EmuCq>,
    pub srqs: HashMap<u32, EmuSrq>,
    pub keys: HashMap<u32, EmuKey>,
    ahs: HashMap<u32, CreateAhReq>,
    gids: Vec<Option<([u8; 16], u16)>>,
    next_key: u32,
    initialized: bool,
    cmdq_root: u64,
    creq_root: u64,
    cmdq: Option<Cursor>,
    creq: Option<Cursor>,
    creq_cons: (u32, bool),
    notes: Vec<Note>,
    pub commands_executed: u64,
    pub wqes_executed: u64,
}

impl EmuState {
    pub fn new(dma: Arc<HostDma>, attrs: DeviceAttributes) -> Self {
        Self {
            dma,
            gids: vec![None; attrs.max_gid as usize],
            attrs,
            faults: Faults::default(),
            qps: HashMap::new(),
            cqs: HashMap::new(),
            srqs: HashMap::new(),
            keys: HashMap::new(),
            ahs: HashMap::new(),
            next_key: 0x100,
            initialized: false,
            cmdq_root: 0,
            creq_root: 0,
            cmdq: None,
            creq: None,
            creq_cons: (0, false),
            notes: Vec::new(),
            commands_executed: 0,
            wqes_executed: 0,
        }
    }

    pub fn take_notes(&mut self) -> Vec<Note> {
        std::mem::take(&mut self.notes)
    }

    /// Forget every resource; the function was disabled
    fn reset(&mut self) {
        self.qps.clear();
        self.cqs.clear();
        self.srqs.clear();
        self.keys.clear();
        self.ahs.clear();
        self.gids.iter_mut().for_each(|gid| *gid = None);
        self.faults.held.clear();
        self.initialized = false;
        self.cmdq = None;
        self.creq = None;
        self.creq_cons = (0, false);
    }

    fn ring_table(root: u64, geometry: u64, stride: u32) -> Option<PageTableInfo> {
        let (depth, level) = hsi::decode_geometry(geometry);
        let level = level?;
        if depth == 0 {
            return None;
        }
        Some(PageTableInfo {
            root,
            level,
            depth,
            stride,
            aux_offset: depth as u64 * stride as u64,
        })
    }

    /// A write to the control region
    pub fn ctrl_write(&mut self, offset: u64, value: u64) {
        match offset {
            hsi::CTRL_CMDQ_ROOT => self.cmdq_root = value,
            hsi::CTRL_CREQ_ROOT => self.creq_root = value,
            hsi::CTRL_CMDQ_GEOM => {
                self.cmdq = Self::ring_table(self.cmdq_root, value, CMDQE_SIZE as u32).map(Cursor::new);
                debug!("Emulator: command ring programmed: {:?}", self.cmdq.map(|c| c.table));
            }
            hsi::CTRL_CREQ_GEOM => {
                self.creq = Self::ring_table(self.creq_root, value, CREQE_SIZE as u32).map(Cursor::new);
                self.creq_cons = (0, false);
                debug!("Emulator: event ring programmed: {:?}", self.creq.map(|c| c.table));
            }
            hsi::CTRL_CMDQ_DB => match DoorbellWord::decode(value) {
                Some(word) => self.process_commands(word.index, word.epoch),
                None => warn!("Emulator: malformed command doorbell 0x{:x}", value),
            },
            hsi::CTRL_CREQ_DB => {
                if let Some(word) = DoorbellWord::decode(value) {
                    self.creq_cons = (word.index, word.epoch);
                }
            }
            hsi::CTRL_DISABLE => {
                info!("Emulator: function disabled");
                self.reset();
            }
            other => warn!("Emulator: write to unknown control register 0x{:x}", other),
        }
    }

    fn process_commands(&mut self, prod: u32, epoch: bool) {
        let Some(mut cursor) = self.cmdq else {
            warn!("Emulator: command doorbell before the ring was programmed");
            return;
        };
        let mut raw = [0u8; CMDQE_SIZE];
        while !cursor.at(prod, epoch) {
            if let Err(e) = cursor.read(&self.dma, 0, &mut raw) {
                error!("Emulator: reading command ring: {}", e);
                break;
            }
            let header = CmdqHeader::decode(&raw);
            let slots = (header.cmd_slots as u32).max(1);
            let bytes = match cursor.read_slots(&self.dma, slots) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Emulator: reading command body: {}", e);
                    break;
                }
            };
            cursor.advance(slots);
            self.run_command(&header, &bytes[CMDQE_SIZE..]);
        }
        self.cmdq = Some(cursor);
    }

    fn run_command(&mut self, header: &CmdqHeader, body: &[u8]) {
        if self.faults.silent {
            debug!("Emulator: silently consumed opcode 0x{:x}", header.opcode);
            return;
        }
        self.commands_executed += 1;

        let opcode = Opcode::from_raw(header.opcode);
        let injected = opcode.and_then(|op| self.faults.fail_next.get_mut(&op)?.pop_front());
        let outcome = match (opcode, injected) {
            (_, Some(status)) => Outcome::fail(status),
            (None, None) => {
                warn!("Emulator: unknown opcode 0x{:x}", header.opcode);
                Outcome::fail(FW_STATUS_INVALID)
            }
            (Some(op), None) => match Command::decode(op, body) {
                Some(cmd) => self.execute(cmd),
                None => Outcome::fail(FW_STATUS_INVALID),
            },
        };
        if let Some(sbuf) = &outcome.sbuf {
            self.write_sbuf(header, sbuf);
        }

        let entry = CreqEntry::CmdResponse {
            status: outcome.status,
            cookie: header.cookie,
            opcode: header.opcode,
            xid: outcome.xid,
            data: outcome.data,
        };
        if let Some(op) = opcode {
            if let Some(count) = self.faults.drop.get_mut(&op).filter(|count| **count > 0) {
                *count -= 1;
                debug!("Emulator: dropped response to {:?} cookie 0x{:x}", op, header.cookie);
                return;
            }
            if self.faults.hold.contains(&op) {
                debug!("Emulator: holding response to {:?} cookie 0x{:x}", op, header.cookie);
                self.faults.held.push(entry);
                return;
            }
        }
        self.push_creq(entry);
    }

    fn write_sbuf(&mut self, header: &CmdqHeader, sbuf: &[u8]) {
        if header.sbuf_addr == 0 {
            warn!("Emulator: opcode 0x{:x} has a response payload but no side buffer", header.opcode);
            return;
        }
        let len = sbuf.len().min(header.sbuf_slots as usize * CMDQE_SIZE);
        if let Err(e) = self.dma.write_bus(header.sbuf_addr, &sbuf[..len]) {
            error!("Emulator: writing side buffer: {}", e);
        }
    }

    pub fn release_held(&mut self, order: &[usize]) {
        let held = std::mem::take(&mut self.faults.held);
        let mut released = vec![false; held.len()];
        for &i in order {
            match held.get(i) {
                Some(entry) if !released[i] => {
                    released[i] = true;
                    self.push_creq(*entry);
                }
                _ => warn!("Emulator: no held response at {}", i),
            }
        }
        self.faults.held = held
            .into_iter()
            .zip(released)
            .filter(|(_, done)| !done)
            .map(|(entry, _)| entry)
            .collect();
    }

    pub fn push_creq(&mut self, entry: CreqEntry) {
        let Some(cursor) = self.creq.as_mut() else {
            warn!("Emulator: event ring not programmed, {:?} lost", entry);
            return;
        };
        if cursor.distance_from(self.creq_cons.0, self.creq_cons.1) >= cursor.depth() {
            error!("Emulator: event ring full, {:?} lost", entry);
            return;
        }
        if let Err(e) = cursor.write(&self.dma, &entry.encode(cursor.toggle())) {
            error!("Emulator: writing event ring: {}", e);
            return;
        }
        cursor.advance(1);
        self.notes.push(Note::Creq);
    }

    /// Write a completion record, raising the CQ's notification if it is
    /// armed for this kind of completion
    pub fn push_cqe(&mut self, cq_id: u32, cqe: HwCqe, solicited: bool) {
        let Some(cq) = self.cqs.get_mut(&cq_id) else {
            warn!("Emulator: completion for unknown CQ 0x{:x} dropped", cq_id);
            return;
        };
        if cq.prod.distance_from(cq.cons.0, cq.cons.1) >= cq.prod.depth() {
            error!("Emulator: CQ 0x{:x} overflow", cq_id);
            self.push_creq(CreqEntry::CqError {
                xid: cq_id,
                reason: CQ_ERROR_OVERFLOW,
            });
            return;
        }
        if let Err(e) = cq.prod.write(&self.dma, &cqe.encode(cq.prod.toggle())) {
            error!("Emulator: writing CQ 0x{:x}: {}", cq_id, e);
            return;
        }
        cq.prod.advance(1);
        let fire = match cq.arm {
            Arm::All => true,
            Arm::Solicited => solicited,
            Arm::None => false,
        };
        if fire {
            cq.arm = Arm::None;
            self.notes.push(Note::Cq(cq_id));
        }
    }

    /// Move a QP to ERR, reporting executed but unreported send WQEs
    pub fn set_qp_error(&mut self, qp_id: u32) {
        let Some(qp) = self.qps.get_mut(&qp_id) else {
            warn!("Emulator: error for unknown QP 0x{:x}", qp_id);
            return;
        };
        qp.state = QpState::Err;
        let scq = qp.scq;
        if let Some(sq_cons_idx) = qp.unreported.take() {
            self.push_cqe(
                scq,
                HwCqe::Terminal {
                    status: CQE_REQ_STATUS_OK,
                    qp_id,
                    sq_cons_idx,
                    rq_cons_idx: CQE_CONS_NONE,
                },
                true,
            );
        }
    }

    fn execute(&mut self, cmd: Command) -> Outcome {
        let opcode = cmd.opcode();
        if !self.initialized && !opcode.allowed_before_init() {
            warn!("Emulator: {:?} before initialization", opcode);
            return Outcome::fail(FW_STATUS_INVALID);
        }
        debug!("Emulator: executing {:?}", opcode);
        match cmd {
            Command::InitializeFw => {
                self.initialized = true;
                Outcome::ok(0)
            }
            Command::DeinitializeFw => {
                self.initialized = false;
                Outcome::ok(0)
            }
            Command::QueryFunc => {
                let mut w = WireWriter::new();
                self.attrs.encode(&mut w);
                Outcome::with_sbuf(0, w.finish())
            }
            Command::QueryVersion => Outcome {
                data: self.attrs.fw_version,
                ..Outcome::ok(0)
            },
            Command::CreateQp(req) => self.create_qp(req),
            Command::DestroyQp { qp_id } => match self.qps.remove(&qp_id) {
                Some(_) => Outcome::ok(qp_id),
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::ModifyQp { qp_id, mask, attrs } => self.modify_qp(qp_id, mask, &attrs),
            Command::QueryQp { qp_id } => match self.qps.get(&qp_id) {
                Some(qp) => {
                    let mut attrs = qp.attrs.clone();
                    attrs.state = qp.state;
                    let mut w = WireWriter::new();
                    attrs.encode(&mut w);
                    Outcome::with_sbuf(qp_id, w.finish())
                }
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::CreateSrq(req) => self.create_srq(req),
            Command::DestroySrq { srq_id } => {
                if self.qps.values().any(|qp| qp.srq_id == Some(srq_id)) {
                    return Outcome::fail(FW_STATUS_BUSY);
                }
                match self.srqs.remove(&srq_id) {
                    Some(_) => Outcome::ok(srq_id),
                    None => Outcome::fail(FW_STATUS_NOT_FOUND),
                }
            }
            Command::ModifySrq { srq_id, limit } => match self.srqs.get_mut(&srq_id) {
                Some(srq) if limit <= srq.max_wr => {
                    srq.limit = limit;
                    Outcome::ok(srq_id)
                }
                Some(_) => Outcome::fail(FW_STATUS_INVALID),
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::QuerySrq { srq_id } => match self.srqs.get(&srq_id) {
                Some(srq) => {
                    let mut w = WireWriter::new();
                    w.u32(srq.limit).u32(srq.max_wr);
                    Outcome::with_sbuf(srq_id, w.finish())
                }
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::CreateCq(req) => {
                if req.cqe_count > self.attrs.max_cqe {
                    return Outcome::fail(FW_STATUS_INVALID);
                }
                let Some(id) = free_id(&self.cqs, 1, self.attrs.max_cq) else {
                    return Outcome::fail(FW_STATUS_NO_RESOURCE);
                };
                self.cqs.insert(
                    id,
                    EmuCq {
                        prod: Cursor::new(req.table),
                        cons: (0, false),
                        arm: Arm::None,
                    },
                );
                Outcome::ok(id)
            }
            Command::DestroyCq { cq_id } => {
                if self.qps.values().any(|qp| qp.scq == cq_id || qp.rcq == cq_id) {
                    return Outcome::fail(FW_STATUS_BUSY);
                }
                match self.cqs.remove(&cq_id) {
                    Some(_) => Outcome::ok(cq_id),
                    None => Outcome::fail(FW_STATUS_NOT_FOUND),
                }
            }
            Command::ResizeCq {
                cq_id,
                table,
                cqe_count,
            } => self.resize_cq(cq_id, table, cqe_count),
            Command::AllocateMrw { .. } => {
                if self.keys.len() as u32 >= self.attrs.max_mr {
                    return Outcome::fail(FW_STATUS_NO_RESOURCE);
                }
                let key = self.next_key;
                self.next_key = self.next_key.wrapping_add(1).max(0x100);
                self.keys.insert(key, EmuKey::default());
                Outcome::ok(key)
            }
            Command::DeallocateKey { key } => match self.keys.remove(&key) {
                Some(_) => Outcome::ok(key),
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::RegisterMr(req) => match self.keys.get_mut(&req.key) {
                Some(entry) => {
                    entry.region = Some((req.va, req.length, req.access));
                    Outcome::ok(req.key)
                }
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::DeregisterMr { key } => match self.keys.get_mut(&key) {
                Some(entry) => {
                    entry.region = None;
                    Outcome::ok(key)
                }
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::AddGid { gid, vlan_id } => {
                if self.gids.iter().flatten().any(|(g, v)| *g == gid && *v == vlan_id) {
                    return Outcome::fail(FW_STATUS_INVALID);
                }
                match self.gids.iter().position(Option::is_none) {
                    Some(index) => {
                        self.gids[index] = Some((gid, vlan_id));
                        Outcome {
                            data: index as u32,
                            ..Outcome::ok(0)
                        }
                    }
                    None => Outcome::fail(FW_STATUS_NO_RESOURCE),
                }
            }
            Command::DeleteGid { index } => match self.gids.get_mut(index as usize) {
                Some(slot) if slot.is_some() => {
                    *slot = None;
                    Outcome::ok(0)
                }
                _ => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::QueryGid { index } => match self.gids.get(index as usize) {
                Some(Some((gid, vlan_id))) => {
                    let mut w = WireWriter::new();
                    w.bytes(gid).u16(*vlan_id);
                    Outcome::with_sbuf(0, w.finish())
                }
                _ => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
            Command::CreateAh(req) => match free_id(&self.ahs, 1, self.attrs.max_ah) {
                Some(id) => {
                    self.ahs.insert(id, req);
                    Outcome::ok(id)
                }
                None => Outcome::fail(FW_STATUS_NO_RESOURCE),
            },
            Command::DestroyAh { ah_id } => match self.ahs.remove(&ah_id) {
                Some(_) => Outcome::ok(ah_id),
                None => Outcome::fail(FW_STATUS_NOT_FOUND),
            },
        }
    }

    fn create_qp(&mut self, req: CreateQpReq) -> Outcome {
        let Some(qp_type) = QpType::from_raw(req.qp_type) else {
            return Outcome::fail(FW_STATUS_INVALID);
        };
        if !self.cqs.contains_key(&req.scq_id) || !self.cqs.contains_key(&req.rcq_id) {
            warn!("Emulator: QP names unknown CQs 0x{:x}/0x{:x}", req.scq_id, req.rcq_id);
            return Outcome::fail(FW_STATUS_INVALID);
        }
        if let Some(srq_id) = req.srq_id {
            if !self.srqs.contains_key(&srq_id) {
                return Outcome::fail(FW_STATUS_INVALID);
            }
        }
        if req.srq_id.is_none() == req.rq.is_none() {
            return Outcome::fail(FW_STATUS_INVALID);
        }
        if req.sq_wqes > self.attrs.max_qp_wqes + 1 || req.sq_sge > self.attrs.max_sge {
            return Outcome::fail(FW_STATUS_INVALID);
        }
        let id = if qp_type == QpType::Gsi {
            (!self.qps.contains_key(&1)).then_some(1)
        } else {
            free_id(&self.qps, 2, self.attrs.max_qp)
        };
        let Some(id) = id else {
            return Outcome::fail(FW_STATUS_NO_RESOURCE);
        };
        self.qps.insert(
            id,
            EmuQp {
                qp_type,
                state: QpState::Reset,
                attrs: QpAttrs::default(),
                sq: Cursor::new(req.sq),
                sq_tail: (0, false),
                sq_wqes: req.sq_wqes.max(1),
                psn_table: qp_type == QpType::Rc && !req.msn_table,
                rq: req.rq.map(RecvRing::new),
                srq_id: req.srq_id,
                scq: req.scq_id,
                rcq: req.rcq_id,
                unreported: None,
                mark_phantom: false,
            },
        );
        Outcome::ok(id)
    }

    fn modify_qp(&mut self, qp_id: u32, mask: ModifyMask, attrs: &QpAttrs) -> Outcome {
        let Some(qp) = self.qps.get_mut(&qp_id) else {
            return Outcome::fail(FW_STATUS_NOT_FOUND);
        };
        let from = qp.state;
        let to = if mask.contains(ModifyMask::STATE) {
            attrs.state
        } else {
            from
        };
        if mask.contains(ModifyMask::STATE) && !valid_transition(from, to) {
            warn!("Emulator: QP 0x{:x} {:?} -> {:?} refused", qp_id, from, to);
            return Outcome::fail(FW_STATUS_INVALID);
        }
        qp.attrs.apply(mask, attrs);
        match to {
            QpState::Err => self.set_qp_error(qp_id),
            QpState::Reset => {
                qp.sq = Cursor::new(qp.sq.table);
                qp.sq_tail = (0, false);
                if let Some(rq) = qp.rq.as_mut() {
                    rq.reset();
                }
                qp.unreported = None;
                qp.mark_phantom = false;
                qp.state = QpState::Reset;
            }
            QpState::Rts => {
                qp.state = QpState::Rts;
                self.drain_sq(qp_id);
            }
            state => qp.state = state,
        }
        Outcome::ok(qp_id)
    }

    fn create_srq(&mut self, req: CreateSrqReq) -> Outcome {
        if req.wqes == 0 || req.wqes > self.attrs.max_srq_wqes || req.limit > req.wqes {
            return Outcome::fail(FW_STATUS_INVALID);
        }
        let Some(id) = free_id(&self.srqs, 1, self.attrs.max_srq) else {
            return Outcome::fail(FW_STATUS_NO_RESOURCE);
        };
        self.srqs.insert(
            id,
            EmuSrq {
                ring: RecvRing::new(req.table),
                slots_per_wqe: rq_slots_per_wqe(req.max_sge),
                max_wr: req.wqes,
                limit: req.limit,
                armed: false,
            },
        );
        Outcome::ok(id)
    }

    fn resize_cq(&mut self, cq_id: u32, table: PageTableInfo, cqe_count: u32) -> Outcome {
        if cqe_count > self.attrs.max_cqe {
            return Outcome::fail(FW_STATUS_INVALID);
        }
        let Some(cq) = self.cqs.get_mut(&cq_id) else {
            return Outcome::fail(FW_STATUS_NOT_FOUND);
        };
        // The cut-off record is the last one the old ring ever gets
        let cutoff = HwCqe::Cutoff { status: 0 }.encode(cq.prod.toggle());
        if let Err(e) = cq.prod.write(&self.dma, &cutoff) {
            error!("Emulator: writing cut-off record: {}", e);
            return Outcome::fail(FW_STATUS_INVALID);
        }
        cq.prod = Cursor::new(table);
        cq.cons = (0, false);
        debug!("Emulator: CQ 0x{:x} switched to {} entries", cq_id, table.depth);
        Outcome::ok(cq_id)
    }
}
