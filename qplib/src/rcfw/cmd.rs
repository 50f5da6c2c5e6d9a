//! Firmware command kinds and their wire encoding
//!
//! Every request the control channel can carry is one variant of
//! `Command`. Encoding and decoding are exhaustive matches so the
//! driver and the adapter model share one definition of each layout.

use crate::hsi::{WireReader, WireWriter};
use crate::hwq::PageTableInfo;
use crate::qp::{ModifyMask, QpAttrs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    CreateQp = 0x01,
    DestroyQp = 0x02,
    ModifyQp = 0x03,
    QueryQp = 0x04,
    CreateSrq = 0x05,
    DestroySrq = 0x06,
    ModifySrq = 0x07,
    QuerySrq = 0x08,
    CreateCq = 0x09,
    DestroyCq = 0x0a,
    ResizeCq = 0x0c,
    AllocateMrw = 0x0d,
    DeallocateKey = 0x0e,
    RegisterMr = 0x0f,
    DeregisterMr = 0x10,
    AddGid = 0x11,
    DeleteGid = 0x12,
    CreateAh = 0x15,
    DestroyAh = 0x16,
    QueryGid = 0x18,
    InitializeFw = 0x80,
    DeinitializeFw = 0x81,
    QueryFunc = 0x83,
    QueryVersion = 0x8b,
}

impl Opcode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use Opcode::*;
        Some(match raw {
            0x01 => CreateQp,
            0x02 => DestroyQp,
            0x03 => ModifyQp,
            0x04 => QueryQp,
            0x05 => CreateSrq,
            0x06 => DestroySrq,
            0x07 => ModifySrq,
            0x08 => QuerySrq,
            0x09 => CreateCq,
            0x0a => DestroyCq,
            0x0c => ResizeCq,
            0x0d => AllocateMrw,
            0x0e => DeallocateKey,
            0x0f => RegisterMr,
            0x10 => DeregisterMr,
            0x11 => AddGid,
            0x12 => DeleteGid,
            0x15 => CreateAh,
            0x16 => DestroyAh,
            0x18 => QueryGid,
            0x80 => InitializeFw,
            0x81 => DeinitializeFw,
            0x83 => QueryFunc,
            0x8b => QueryVersion,
            _ => return None,
        })
    }

    /// Teardown opcodes that report success without touching hardware once
    /// the device is detached, so cleanup paths can run to completion
    pub fn succeeds_when_detached(self) -> bool {
        matches!(
            self,
            Opcode::DestroyQp
                | Opcode::DestroySrq
                | Opcode::DestroyCq
                | Opcode::DeallocateKey
                | Opcode::DeregisterMr
                | Opcode::DeleteGid
                | Opcode::DestroyAh
                | Opcode::DeinitializeFw
        )
    }

    pub fn allowed_before_init(self) -> bool {
        matches!(
            self,
            Opcode::InitializeFw | Opcode::QueryVersion | Opcode::QueryFunc
        )
    }

    /// GID table updates race with firmware-internal updates; their
    /// failures are logged and swallowed
    pub fn failure_exempt(self) -> bool {
        matches!(self, Opcode::AddGid | Opcode::DeleteGid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateQpReq {
    pub qp_type: u8,
    pub pd_id: u32,
    pub sq: PageTableInfo,
    pub rq: Option<PageTableInfo>,
    /// Shadow-ring entries (index space of completion records)
    pub sq_wqes: u32,
    pub rq_wqes: u32,
    pub sq_sge: u32,
    pub rq_sge: u32,
    pub scq_id: u32,
    pub rcq_id: u32,
    pub srq_id: Option<u32>,
    pub max_inline: u32,
    pub variable_wqe: bool,
    pub msn_table: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCqReq {
    pub table: PageTableInfo,
    pub cqe_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSrqReq {
    pub pd_id: u32,
    pub table: PageTableInfo,
    pub wqes: u32,
    pub max_sge: u32,
    pub limit: u32,
    pub cq_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMrReq {
    pub key: u32,
    pub va: u64,
    pub length: u64,
    pub access: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAhReq {
    pub pd_id: u32,
    pub dgid: [u8; 16],
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub dest_mac: [u8; 6],
}

/// A request to firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InitializeFw,
    DeinitializeFw,
    QueryFunc,
    QueryVersion,
    CreateQp(CreateQpReq),
    DestroyQp { qp_id: u32 },
    ModifyQp { qp_id: u32, mask: ModifyMask, attrs: QpAttrs },
    QueryQp { qp_id: u32 },
    CreateSrq(CreateSrqReq),
    DestroySrq { srq_id: u32 },
    ModifySrq { srq_id: u32, limit: u32 },
    QuerySrq { srq_id: u32 },
    CreateCq(CreateCqReq),
    DestroyCq { cq_id: u32 },
    ResizeCq { cq_id: u32, table: PageTableInfo, cqe_count: u32 },
    AllocateMrw { pd_id: u32, is_mw: bool },
    DeallocateKey { key: u32 },
    RegisterMr(RegisterMrReq),
    DeregisterMr { key: u32 },
    AddGid { gid: [u8; 16], vlan_id: u16 },
    DeleteGid { index: u16 },
    QueryGid { index: u16 },
    CreateAh(CreateAhReq),
    DestroyAh { ah_id: u32 },
}

/// Side buffer bytes needed by query commands
pub const QUERY_QP_SBUF_SIZE: usize = 128;
pub const QUERY_FUNC_SBUF_SIZE: usize = 128;
pub const QUERY_SRQ_SBUF_SIZE: usize = 16;
pub const QUERY_GID_SBUF_SIZE: usize = 32;

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::InitializeFw => Opcode::InitializeFw,
            Command::DeinitializeFw => Opcode::DeinitializeFw,
            Command::QueryFunc => Opcode::QueryFunc,
            Command::QueryVersion => Opcode::QueryVersion,
            Command::CreateQp(_) => Opcode::CreateQp,
            Command::DestroyQp { .. } => Opcode::DestroyQp,
            Command::ModifyQp { .. } => Opcode::ModifyQp,
            Command::QueryQp { .. } => Opcode::QueryQp,
            Command::CreateSrq(_) => Opcode::CreateSrq,
            Command::DestroySrq { .. } => Opcode::DestroySrq,
            Command::ModifySrq { .. } => Opcode::ModifySrq,
            Command::QuerySrq { .. } => Opcode::QuerySrq,
            Command::CreateCq(_) => Opcode::CreateCq,
            Command::DestroyCq { .. } => Opcode::DestroyCq,
            Command::ResizeCq { .. } => Opcode::ResizeCq,
            Command::AllocateMrw { .. } => Opcode::AllocateMrw,
            Command::DeallocateKey { .. } => Opcode::DeallocateKey,
            Command::RegisterMr(_) => Opcode::RegisterMr,
            Command::DeregisterMr { .. } => Opcode::DeregisterMr,
            Command::AddGid { .. } => Opcode::AddGid,
            Command::DeleteGid { .. } => Opcode::DeleteGid,
            Command::QueryGid { .. } => Opcode::QueryGid,
            Command::CreateAh(_) => Opcode::CreateAh,
            Command::DestroyAh { .. } => Opcode::DestroyAh,
        }
    }

    /// Side buffer the response needs, in bytes
    pub fn sbuf_size(&self) -> usize {
        match self {
            Command::QueryQp { .. } => QUERY_QP_SBUF_SIZE,
            Command::QueryFunc => QUERY_FUNC_SBUF_SIZE,
            Command::QuerySrq { .. } => QUERY_SRQ_SBUF_SIZE,
            Command::QueryGid { .. } => QUERY_GID_SBUF_SIZE,
            _ => 0,
        }
    }

    /// Body bytes following the 16-byte header
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            Command::InitializeFw
            | Command::DeinitializeFw
            | Command::QueryFunc
            | Command::QueryVersion => {}
            Command::CreateQp(req) => {
                w.u8(req.qp_type)
                    .u8(req.variable_wqe as u8)
                    .u8(req.msn_table as u8)
                    .u8(req.rq.is_some() as u8)
                    .u32(req.pd_id)
                    .u32(req.sq_wqes)
                    .u32(req.rq_wqes)
                    .u32(req.sq_sge)
                    .u32(req.rq_sge)
                    .u32(req.scq_id)
                    .u32(req.rcq_id)
                    .u32(req.srq_id.unwrap_or(u32::MAX))
                    .u32(req.max_inline)
                    .table(&req.sq);
                if let Some(rq) = &req.rq {
                    w.table(rq);
                }
            }
            Command::DestroyQp { qp_id } | Command::QueryQp { qp_id } => {
                w.u32(*qp_id);
            }
            Command::ModifyQp { qp_id, mask, attrs } => {
                w.u32(*qp_id).u32(0).u64(mask.bits());
                attrs.encode(&mut w);
            }
            Command::CreateSrq(req) => {
                w.u32(req.pd_id)
                    .u32(req.wqes)
                    .u32(req.max_sge)
                    .u32(req.limit)
                    .u32(req.cq_id)
                    .u32(0)
                    .table(&req.table);
            }
            Command::DestroySrq { srq_id } | Command::QuerySrq { srq_id } => {
                w.u32(*srq_id);
            }
            Command::ModifySrq { srq_id, limit } => {
                w.u32(*srq_id).u32(*limit);
            }
            Command::CreateCq(req) => {
                w.u32(req.cqe_count).u32(0).table(&req.table);
            }
            Command::DestroyCq { cq_id } => {
                w.u32(*cq_id);
            }
            Command::ResizeCq {
                cq_id,
                table,
                cqe_count,
            } => {
                w.u32(*cq_id).u32(*cqe_count).table(table);
            }
            Command::AllocateMrw { pd_id, is_mw } => {
                w.u32(*pd_id).u8(*is_mw as u8);
            }
            Command::DeallocateKey { key } | Command::DeregisterMr { key } => {
                w.u32(*key);
            }
            Command::RegisterMr(req) => {
                w.u32(req.key)
                    .u32(req.access)
                    .u64(req.va)
                    .u64(req.length);
            }
            Command::AddGid { gid, vlan_id } => {
                w.bytes(gid).u16(*vlan_id);
            }
            Command::DeleteGid { index } | Command::QueryGid { index } => {
                w.u16(*index);
            }
            Command::CreateAh(req) => {
                w.u32(req.pd_id)
                    .bytes(&req.dgid)
                    .u8(req.sgid_index)
                    .u8(req.hop_limit)
                    .u8(req.traffic_class)
                    .u8(0)
                    .u32(req.flow_label)
                    .bytes(&req.dest_mac);
            }
            Command::DestroyAh { ah_id } => {
                w.u32(*ah_id);
            }
        }
        w.finish()
    }

    /// Rebuild a command from its opcode and body bytes
    pub fn decode(opcode: Opcode, body: &[u8]) -> Option<Command> {
        let mut r = WireReader::new(body);
        Some(match opcode {
            Opcode::InitializeFw => Command::InitializeFw,
            Opcode::DeinitializeFw => Command::DeinitializeFw,
            Opcode::QueryFunc => Command::QueryFunc,
            Opcode::QueryVersion => Command::QueryVersion,
            Opcode::CreateQp => {
                let qp_type = r.u8();
                let variable_wqe = r.u8() != 0;
                let msn_table = r.u8() != 0;
                let has_rq = r.u8() != 0;
                let pd_id = r.u32();
                let sq_wqes = r.u32();
                let rq_wqes = r.u32();
                let sq_sge = r.u32();
                let rq_sge = r.u32();
                let scq_id = r.u32();
                let rcq_id = r.u32();
                let srq_id = Some(r.u32()).filter(|&id| id != u32::MAX);
                let max_inline = r.u32();
                let sq = r.table()?;
                let rq = if has_rq { Some(r.table()?) } else { None };
                Command::CreateQp(CreateQpReq {
                    qp_type,
                    pd_id,
                    sq,
                    rq,
                    sq_wqes,
                    rq_wqes,
                    sq_sge,
                    rq_sge,
                    scq_id,
                    rcq_id,
                    srq_id,
                    max_inline,
                    variable_wqe,
                    msn_table,
                })
            }
            Opcode::DestroyQp => Command::DestroyQp { qp_id: r.u32() },
            Opcode::QueryQp => Command::QueryQp { qp_id: r.u32() },
            Opcode::ModifyQp => {
                let qp_id = r.u32();
                r.u32();
                let mask = ModifyMask::from_bits_truncate(r.u64());
                let attrs = QpAttrs::decode(&mut r);
                Command::ModifyQp { qp_id, mask, attrs }
            }
            Opcode::CreateSrq => {
                let pd_id = r.u32();
                let wqes = r.u32();
                let max_sge = r.u32();
                let limit = r.u32();
                let cq_id = r.u32();
                r.u32();
                Command::CreateSrq(CreateSrqReq {
                    pd_id,
                    table: r.table()?,
                    wqes,
                    max_sge,
                    limit,
                    cq_id,
                })
            }
            Opcode::DestroySrq => Command::DestroySrq { srq_id: r.u32() },
            Opcode::QuerySrq => Command::QuerySrq { srq_id: r.u32() },
            Opcode::ModifySrq => Command::ModifySrq {
                srq_id: r.u32(),
                limit: r.u32(),
            },
            Opcode::CreateCq => {
                let cqe_count = r.u32();
                r.u32();
                Command::CreateCq(CreateCqReq {
                    table: r.table()?,
                    cqe_count,
                })
            }
            Opcode::DestroyCq => Command::DestroyCq { cq_id: r.u32() },
            Opcode::ResizeCq => Command::ResizeCq {
                cq_id: r.u32(),
                cqe_count: r.u32(),
                table: r.table()?,
            },
            Opcode::AllocateMrw => Command::AllocateMrw {
                pd_id: r.u32(),
                is_mw: r.u8() != 0,
            },
            Opcode::DeallocateKey => Command::DeallocateKey { key: r.u32() },
            Opcode::DeregisterMr => Command::DeregisterMr { key: r.u32() },
            Opcode::RegisterMr => Command::RegisterMr(RegisterMrReq {
                key: r.u32(),
                access: r.u32(),
                va: r.u64(),
                length: r.u64(),
            }),
            Opcode::AddGid => {
                let mut gid = [0u8; 16];
                gid.copy_from_slice(&r.bytes(16));
                Command::AddGid {
                    gid,
                    vlan_id: r.u16(),
                }
            }
            Opcode::DeleteGid => Command::DeleteGid { index: r.u16() },
            Opcode::QueryGid => Command::QueryGid { index: r.u16() },
            Opcode::CreateAh => {
                let pd_id = r.u32();
                let mut dgid = [0u8; 16];
                dgid.copy_from_slice(&r.bytes(16));
                let sgid_index = r.u8();
                let hop_limit = r.u8();
                let traffic_class = r.u8();
                r.u8();
                let flow_label = r.u32();
                let mut dest_mac = [0u8; 6];
                dest_mac.copy_from_slice(&r.bytes(6));
                Command::CreateAh(CreateAhReq {
                    pd_id,
                    dgid,
                    sgid_index,
                    hop_limit,
                    traffic_class,
                    flow_label,
                    dest_mac,
                })
            }
            Opcode::DestroyAh => Command::DestroyAh { ah_id: r.u32() },
        })
    }
}

/// Completion of a command as seen by the submitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub opcode: Opcode,
    pub status: u8,
    pub cookie: u16,
    /// Resource id the command created or acted on
    pub xid: u32,
    /// Opcode-specific word
    pub data: u32,
    /// Side-buffer payload for query commands
    pub sbuf: Option<Vec<u8>>,
}

impl CommandResponse {
    /// Synthesized success for teardown commands on a detached device
    pub(crate) fn detached_noop(opcode: Opcode) -> Self {
        Self {
            opcode,
            status: 0,
            cookie: 0,
            xid: 0,
            data: 0,
            sbuf: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}
