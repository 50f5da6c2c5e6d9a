//! Hardware/software interface: byte layouts shared with the adapter
//!
//! All multi-byte fields are little endian.

use crate::hwq::{PageLevel, PageTableInfo};

/// Send/receive queue slot and command-queue slot size
pub const SLOT_SIZE: usize = 16;
pub const CMDQE_SIZE: usize = 16;
pub const CREQE_SIZE: usize = 16;
pub const CQE_SIZE: usize = 32;

// Control region register offsets
pub const CTRL_CMDQ_ROOT: u64 = 0x00;
pub const CTRL_CMDQ_GEOM: u64 = 0x08;
pub const CTRL_CREQ_ROOT: u64 = 0x10;
pub const CTRL_CREQ_GEOM: u64 = 0x18;
pub const CTRL_CMDQ_DB: u64 = 0x20;
pub const CTRL_CREQ_DB: u64 = 0x28;
pub const CTRL_DISABLE: u64 = 0x30;

// Data doorbell region offsets
pub const DB_OFFSET_QUEUE: u64 = 0x00;
pub const DB_OFFSET_CQ: u64 = 0x08;

/// Pack queue geometry for a control-region register
pub fn encode_geometry(depth: u32, level: PageLevel) -> u64 {
    depth as u64 | (level as u64) << 32
}

pub fn decode_geometry(value: u64) -> (u32, Option<PageLevel>) {
    (value as u32, PageLevel::from_raw((value >> 32) as u8))
}

/// Little-endian field writer for commands, WQEs and side buffers
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn table(&mut self, table: &PageTableInfo) -> &mut Self {
        self.u64(table.root)
            .u32(table.depth)
            .u8(table.level as u8)
            .u8(0)
            .u16(0)
            .u32(table.stride)
            .u32(0)
            .u64(table.aux_offset)
    }

    /// Pad to a multiple of `align` bytes
    pub fn pad_to(&mut self, align: usize) -> &mut Self {
        let len = self.buf.len().div_ceil(align) * align;
        self.buf.resize(len, 0);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian field reader; reads past the end yield zero
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.buf.get(self.pos..) {
            let n = src.len().min(N);
            out[..n].copy_from_slice(&src[..n]);
        }
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        let start = self.pos.min(self.buf.len());
        let end = (self.pos + len).min(self.buf.len());
        self.pos += len;
        let mut out = self.buf[start..end].to_vec();
        out.resize(len, 0);
        out
    }

    pub fn table(&mut self) -> Option<PageTableInfo> {
        let root = self.u64();
        let depth = self.u32();
        let level = PageLevel::from_raw(self.u8())?;
        self.u8();
        self.u16();
        let stride = self.u32();
        self.u32();
        let aux_offset = self.u64();
        Some(PageTableInfo {
            root,
            level,
            depth,
            stride,
            aux_offset,
        })
    }

    pub fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

// ---------------------------------------------------------------------------
// Command queue

/// First 16 bytes of every command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdqHeader {
    pub opcode: u8,
    /// Command length in 16-byte slots, header included
    pub cmd_slots: u8,
    pub flags: u16,
    pub cookie: u16,
    /// Side buffer size in 16-byte units
    pub sbuf_slots: u16,
    pub sbuf_addr: u64,
}

impl CmdqHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.u8(self.opcode)
            .u8(self.cmd_slots)
            .u16(self.flags)
            .u16(self.cookie)
            .u16(self.sbuf_slots)
            .u64(self.sbuf_addr);
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        Self {
            opcode: r.u8(),
            cmd_slots: r.u8(),
            flags: r.u16(),
            cookie: r.u16(),
            sbuf_slots: r.u16(),
            sbuf_addr: r.u64(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event queue (CREQ)

pub const CREQ_TYPE_QP_EVENT: u8 = 0x38;
pub const CREQ_TYPE_FUNC_EVENT: u8 = 0x3a;
pub const CREQ_EVENT_QP_ERROR: u8 = 0xc0;
pub const CREQ_EVENT_CQ_ERROR: u8 = 0xc1;
/// Function event: an armed SRQ dropped below its limit; data is the SRQ id
pub const FUNC_EVENT_SRQ_LIMIT: u8 = 0x10;

/// One 16-byte entry of the firmware event ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreqEntry {
    /// Response to a command
    CmdResponse {
        status: u8,
        cookie: u16,
        opcode: u8,
        xid: u32,
        data: u32,
    },
    QpError {
        xid: u32,
        req_err: u8,
        res_err: u8,
    },
    CqError {
        xid: u32,
        reason: u8,
    },
    FuncEvent {
        event: u8,
        data: u32,
    },
    Unknown {
        kind: u8,
    },
}

impl CreqEntry {
    pub fn encode(&self, toggle: bool) -> [u8; CREQE_SIZE] {
        let mut w = WireWriter::new();
        let (kind, status, cookie, event, b5, b6, xid, data) = match *self {
            Self::CmdResponse {
                status,
                cookie,
                opcode,
                xid,
                data,
            } => (CREQ_TYPE_QP_EVENT, status, cookie, opcode, 0, 0, xid, data),
            Self::QpError { xid, req_err, res_err } => {
                (CREQ_TYPE_QP_EVENT, 0, 0, CREQ_EVENT_QP_ERROR, req_err, res_err, xid, 0)
            }
            Self::CqError { xid, reason } => {
                (CREQ_TYPE_QP_EVENT, 0, 0, CREQ_EVENT_CQ_ERROR, reason, 0, xid, 0)
            }
            Self::FuncEvent { event, data } => (CREQ_TYPE_FUNC_EVENT, 0, 0, event, 0, 0, 0, data),
            Self::Unknown { kind } => (kind, 0, 0, 0, 0, 0, 0, 0),
        };
        w.u8((kind << 1) | toggle as u8)
            .u8(status)
            .u16(cookie)
            .u8(event)
            .u8(b5)
            .u8(b6)
            .u8(0)
            .u32(xid)
            .u32(data);
        let mut out = [0u8; CREQE_SIZE];
        out.copy_from_slice(&w.finish());
        out
    }

    pub fn toggle(raw: &[u8]) -> bool {
        raw.first().map(|b| b & 1 == 1).unwrap_or(false)
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        let kind = r.u8() >> 1;
        let status = r.u8();
        let cookie = r.u16();
        let event = r.u8();
        let b5 = r.u8();
        let b6 = r.u8();
        r.u8();
        let xid = r.u32();
        let data = r.u32();
        match (kind, event) {
            (CREQ_TYPE_QP_EVENT, CREQ_EVENT_QP_ERROR) => Self::QpError {
                xid,
                req_err: b5,
                res_err: b6,
            },
            (CREQ_TYPE_QP_EVENT, CREQ_EVENT_CQ_ERROR) => Self::CqError { xid, reason: b5 },
            (CREQ_TYPE_QP_EVENT, opcode) => Self::CmdResponse {
                status,
                cookie,
                opcode,
                xid,
                data,
            },
            (CREQ_TYPE_FUNC_EVENT, event) => Self::FuncEvent { event, data },
            (kind, _) => Self::Unknown { kind },
        }
    }
}

// ---------------------------------------------------------------------------
// Send/receive WQEs

pub const WQE_TYPE_SEND: u8 = 0x00;
pub const WQE_TYPE_SEND_W_IMM: u8 = 0x01;
pub const WQE_TYPE_SEND_W_INV: u8 = 0x02;
pub const WQE_TYPE_WRITE: u8 = 0x04;
pub const WQE_TYPE_WRITE_W_IMM: u8 = 0x05;
pub const WQE_TYPE_READ: u8 = 0x06;
pub const WQE_TYPE_ATOMIC_CS: u8 = 0x08;
pub const WQE_TYPE_ATOMIC_FA: u8 = 0x0b;
pub const WQE_TYPE_LOCAL_INV: u8 = 0x0c;
pub const WQE_TYPE_BIND: u8 = 0x0e;
pub const WQE_TYPE_RECV: u8 = 0x80;

pub const WQE_FLAG_SIGNAL_COMP: u8 = 0x01;
pub const WQE_FLAG_RD_ATOMIC_FENCE: u8 = 0x02;
pub const WQE_FLAG_UC_FENCE: u8 = 0x04;
pub const WQE_FLAG_SOLICITED: u8 = 0x08;
pub const WQE_FLAG_INLINE: u8 = 0x10;

/// Header + extension of a send WQE: the first two slots
pub const SQ_HDR_SLOTS: u32 = 2;
/// Receive WQE header: one slot
pub const RQ_HDR_SLOTS: u32 = 1;
/// Largest send WQE in static mode, in slots
pub const SQ_STATIC_MAX_SLOTS: u32 = 8;

/// Base + extension slots of a send WQE.
///
/// Extension use by operation:
/// - RDMA/atomic: `ext_va` remote address, `ext_key` rkey
/// - UD send: `ext_va` low 32 bits qkey, `ext_key` destination QP, `ext_aux` AH id
/// - bind: `ext_va` address, `ext_aux` parent lkey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SqWqeHeader {
    pub wqe_type: u8,
    pub flags: u8,
    pub wqe_slots: u8,
    pub num_sge: u8,
    pub key_immed: u32,
    pub length: u32,
    pub swq_idx: u16,
    pub ext_va: u64,
    pub ext_key: u32,
    pub ext_aux: u32,
}

impl SqWqeHeader {
    pub fn encode(&self) -> [u8; 2 * SLOT_SIZE] {
        let mut w = WireWriter::new();
        w.u8(self.wqe_type)
            .u8(self.flags)
            .u8(self.wqe_slots)
            .u8(self.num_sge)
            .u32(self.key_immed)
            .u32(self.length)
            .u16(self.swq_idx)
            .u16(0)
            .u64(self.ext_va)
            .u32(self.ext_key)
            .u32(self.ext_aux);
        let mut out = [0u8; 2 * SLOT_SIZE];
        out.copy_from_slice(&w.finish());
        out
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        let mut hdr = Self {
            wqe_type: r.u8(),
            flags: r.u8(),
            wqe_slots: r.u8(),
            num_sge: r.u8(),
            key_immed: r.u32(),
            length: r.u32(),
            swq_idx: r.u16(),
            ..Default::default()
        };
        r.u16();
        hdr.ext_va = r.u64();
        hdr.ext_key = r.u32();
        hdr.ext_aux = r.u32();
        hdr
    }
}

/// Receive WQE header slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RqWqeHeader {
    pub wqe_slots: u8,
    pub num_sge: u8,
    /// Shadow-ring index the completion reports back
    pub wr_id_idx: u32,
}

impl RqWqeHeader {
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut w = WireWriter::new();
        w.u8(WQE_TYPE_RECV)
            .u8(0)
            .u8(self.wqe_slots)
            .u8(self.num_sge)
            .u32(self.wr_id_idx)
            .u64(0);
        let mut out = [0u8; SLOT_SIZE];
        out.copy_from_slice(&w.finish());
        out
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        r.u8();
        r.u8();
        Self {
            wqe_slots: r.u8(),
            num_sge: r.u8(),
            wr_id_idx: r.u32(),
        }
    }
}

/// Scatter/gather element slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwSge {
    pub addr: u64,
    pub lkey: u32,
    pub size: u32,
}

impl HwSge {
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut out = [0u8; SLOT_SIZE];
        out[..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.lkey.to_le_bytes());
        out[12..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        Self {
            addr: r.u64(),
            lkey: r.u32(),
            size: r.u32(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sequence search tables (send queue auxiliary area)

pub const PSN_SEARCH_SIZE: usize = 8;
pub const PSN_MASK: u32 = 0x00ff_ffff;
/// Set by the adapter on an entry that needs a phantom fence before completion
pub const PSN_SEARCH_PHANTOM_MARK: u32 = 0x8000_0000;

/// PSN search entry: start/next PSN of one send WQE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PsnSearch {
    pub opcode_start_psn: u32,
    pub flags_next_psn: u32,
}

impl PsnSearch {
    pub fn new(opcode: u8, start_psn: u32, next_psn: u32) -> Self {
        Self {
            opcode_start_psn: (start_psn & PSN_MASK) | (opcode as u32) << 24,
            flags_next_psn: next_psn & PSN_MASK,
        }
    }

    pub fn encode(&self) -> [u8; PSN_SEARCH_SIZE] {
        let mut out = [0u8; PSN_SEARCH_SIZE];
        out[..4].copy_from_slice(&self.opcode_start_psn.to_le_bytes());
        out[4..].copy_from_slice(&self.flags_next_psn.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        Self {
            opcode_start_psn: r.u32(),
            flags_next_psn: r.u32(),
        }
    }

    pub fn is_phantom_marked(&self) -> bool {
        self.flags_next_psn & PSN_SEARCH_PHANTOM_MARK != 0
    }
}

/// MSN table entry used with hardware retransmission:
/// start PSN [23:0], next PSN [47:24], start slot [63:48]
pub fn encode_msn(start_slot: u16, start_psn: u32, next_psn: u32) -> u64 {
    (start_psn & PSN_MASK) as u64 | ((next_psn & PSN_MASK) as u64) << 24 | (start_slot as u64) << 48
}

pub fn decode_msn(entry: u64) -> (u16, u32, u32) {
    (
        (entry >> 48) as u16,
        (entry as u32) & PSN_MASK,
        ((entry >> 24) as u32) & PSN_MASK,
    )
}

// ---------------------------------------------------------------------------
// Completion records

pub const CQE_TYPE_REQ: u8 = 0x0;
pub const CQE_TYPE_RES_RC: u8 = 0x1;
pub const CQE_TYPE_RES_UD: u8 = 0x2;
pub const CQE_TYPE_RES_RAWETH_QP1: u8 = 0x3;
pub const CQE_TYPE_TERMINAL: u8 = 0xe;
pub const CQE_TYPE_CUT_OFF: u8 = 0xf;

pub const CQE_RES_FLAG_SRQ: u16 = 0x1;
pub const CQE_RES_FLAG_IMM: u16 = 0x2;
pub const CQE_RES_FLAG_INV: u16 = 0x4;
pub const CQE_RES_FLAG_RDMA: u16 = 0x8;

// Requester completion status
pub const CQE_REQ_STATUS_OK: u8 = 0x0;
pub const CQE_REQ_STATUS_BAD_RESPONSE: u8 = 0x1;
pub const CQE_REQ_STATUS_LOCAL_LENGTH: u8 = 0x2;
pub const CQE_REQ_STATUS_LOCAL_QP_OPERATION: u8 = 0x3;
pub const CQE_REQ_STATUS_LOCAL_PROTECTION: u8 = 0x4;
pub const CQE_REQ_STATUS_MEMORY_MGT_OPERATION: u8 = 0x5;
pub const CQE_REQ_STATUS_REMOTE_INVALID_REQUEST: u8 = 0x6;
pub const CQE_REQ_STATUS_REMOTE_ACCESS: u8 = 0x7;
pub const CQE_REQ_STATUS_REMOTE_OPERATION: u8 = 0x8;
pub const CQE_REQ_STATUS_RNR_NAK_RETRY_CNT: u8 = 0x9;
pub const CQE_REQ_STATUS_TRANSPORT_RETRY_CNT: u8 = 0xa;
pub const CQE_REQ_STATUS_WORK_REQUEST_FLUSHED: u8 = 0xb;

// Responder completion status
pub const CQE_RES_STATUS_OK: u8 = 0x0;
pub const CQE_RES_STATUS_LOCAL_ACCESS: u8 = 0x1;
pub const CQE_RES_STATUS_LOCAL_LENGTH: u8 = 0x2;
pub const CQE_RES_STATUS_LOCAL_PROTECTION: u8 = 0x3;
pub const CQE_RES_STATUS_LOCAL_QP_OPERATION: u8 = 0x4;
pub const CQE_RES_STATUS_MEMORY_MGT_OPERATION: u8 = 0x5;
pub const CQE_RES_STATUS_REMOTE_INVALID_REQUEST: u8 = 0x6;
pub const CQE_RES_STATUS_WORK_REQUEST_FLUSHED: u8 = 0x7;
pub const CQE_RES_STATUS_HW_FLUSH: u8 = 0x8;

/// qp_id written over records of a destroyed QP so polling skips them
pub const CQE_QP_ID_INVALID: u32 = u32::MAX;
/// Byte offset of the qp_id field in REQ, RES and TERMINAL records
pub const CQE_QP_ID_OFFSET: usize = 4;

/// Terminal records use this index to mean "no entries on this side"
pub const CQE_CONS_NONE: u16 = 0xffff;

/// Responder record flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResKind {
    Rc,
    Ud,
    RawQp1,
}

/// A 32-byte completion record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCqe {
    Req {
        status: u8,
        qp_id: u32,
        /// Shadow index following the last WQE this record covers
        sq_cons_idx: u16,
    },
    Res {
        kind: ResKind,
        status: u8,
        qp_id: u32,
        flags: u16,
        length: u32,
        imm_or_inv: u32,
        wr_id_idx: u32,
        src_qp: u32,
    },
    Terminal {
        status: u8,
        qp_id: u32,
        sq_cons_idx: u16,
        rq_cons_idx: u16,
    },
    Cutoff {
        status: u8,
    },
    Unknown {
        kind: u8,
    },
}

impl HwCqe {
    pub fn encode(&self, toggle: bool) -> [u8; CQE_SIZE] {
        let mut w = WireWriter::new();
        match *self {
            Self::Req {
                status,
                qp_id,
                sq_cons_idx,
            } => {
                w.u8(CQE_TYPE_REQ << 1 | toggle as u8)
                    .u8(status)
                    .u16(sq_cons_idx)
                    .u32(qp_id);
            }
            Self::Res {
                kind,
                status,
                qp_id,
                flags,
                length,
                imm_or_inv,
                wr_id_idx,
                src_qp,
            } => {
                let ty = match kind {
                    ResKind::Rc => CQE_TYPE_RES_RC,
                    ResKind::Ud => CQE_TYPE_RES_UD,
                    ResKind::RawQp1 => CQE_TYPE_RES_RAWETH_QP1,
                };
                w.u8(ty << 1 | toggle as u8)
                    .u8(status)
                    .u16(flags)
                    .u32(qp_id)
                    .u32(length)
                    .u32(imm_or_inv)
                    .u32(wr_id_idx)
                    .u32(src_qp);
            }
            Self::Terminal {
                status,
                qp_id,
                sq_cons_idx,
                rq_cons_idx,
            } => {
                w.u8(CQE_TYPE_TERMINAL << 1 | toggle as u8)
                    .u8(status)
                    .u16(sq_cons_idx)
                    .u32(qp_id)
                    .u16(rq_cons_idx);
            }
            Self::Cutoff { status } => {
                w.u8(CQE_TYPE_CUT_OFF << 1 | toggle as u8).u8(status);
            }
            Self::Unknown { kind } => {
                w.u8(kind << 1 | toggle as u8);
            }
        }
        w.pad_to(CQE_SIZE);
        let mut out = [0u8; CQE_SIZE];
        out.copy_from_slice(&w.finish()[..CQE_SIZE]);
        out
    }

    pub fn toggle(raw: &[u8]) -> bool {
        raw.first().map(|b| b & 1 == 1).unwrap_or(false)
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut r = WireReader::new(raw);
        let kind = r.u8() >> 1;
        let status = r.u8();
        match kind {
            CQE_TYPE_REQ => {
                let sq_cons_idx = r.u16();
                Self::Req {
                    status,
                    qp_id: r.u32(),
                    sq_cons_idx,
                }
            }
            CQE_TYPE_RES_RC | CQE_TYPE_RES_UD | CQE_TYPE_RES_RAWETH_QP1 => {
                let flags = r.u16();
                Self::Res {
                    kind: match kind {
                        CQE_TYPE_RES_RC => ResKind::Rc,
                        CQE_TYPE_RES_UD => ResKind::Ud,
                        _ => ResKind::RawQp1,
                    },
                    status,
                    flags,
                    qp_id: r.u32(),
                    length: r.u32(),
                    imm_or_inv: r.u32(),
                    wr_id_idx: r.u32(),
                    src_qp: r.u32(),
                }
            }
            CQE_TYPE_TERMINAL => {
                let sq_cons_idx = r.u16();
                let qp_id = r.u32();
                Self::Terminal {
                    status,
                    qp_id,
                    sq_cons_idx,
                    rq_cons_idx: r.u16(),
                }
            }
            CQE_TYPE_CUT_OFF => Self::Cutoff { status },
            kind => Self::Unknown { kind },
        }
    }
}
