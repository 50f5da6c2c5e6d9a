//! QP states, types, modify masks and attributes

use crate::hsi::{WireReader, WireWriter};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QpState {
    #[default]
    Reset = 0,
    Init = 1,
    Rtr = 2,
    Rts = 3,
    Sqd = 4,
    Sqe = 5,
    Err = 6,
}

impl QpState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Reset,
            1 => Self::Init,
            2 => Self::Rtr,
            3 => Self::Rts,
            4 => Self::Sqd,
            5 => Self::Sqe,
            6 => Self::Err,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QpType {
    /// Reliable connected
    Rc = 0x2,
    /// Unreliable datagram
    Ud = 0x4,
    /// General services (QP1, raw ethertype completions)
    Gsi = 0x7,
}

impl QpType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x2 => Some(Self::Rc),
            0x4 => Some(Self::Ud),
            0x7 => Some(Self::Gsi),
            _ => None,
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Ud | Self::Gsi)
    }
}

bitflags! {
    /// Attributes a modify request carries
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModifyMask: u64 {
        const STATE = 1 << 0;
        const EN_SQD_ASYNC_NOTIFY = 1 << 1;
        const ACCESS = 1 << 2;
        const PKEY = 1 << 3;
        const QKEY = 1 << 4;
        const DGID = 1 << 5;
        const FLOW_LABEL = 1 << 6;
        const SGID_INDEX = 1 << 7;
        const HOP_LIMIT = 1 << 8;
        const TRAFFIC_CLASS = 1 << 9;
        const DEST_MAC = 1 << 10;
        const PATH_MTU = 1 << 11;
        const TIMEOUT = 1 << 12;
        const RETRY_CNT = 1 << 13;
        const RNR_RETRY = 1 << 14;
        const RQ_PSN = 1 << 15;
        const MAX_RD_ATOMIC = 1 << 16;
        const MIN_RNR_TIMER = 1 << 17;
        const SQ_PSN = 1 << 18;
        const MAX_DEST_RD_ATOMIC = 1 << 19;
        const DEST_QP_ID = 1 << 20;
        const VLAN_ID = 1 << 21;
        const SRC_MAC = 1 << 22;
    }
}

/// Path MTU forced when entering RTR without one
pub const DEFAULT_PATH_MTU: u32 = 2048;

/// Modifiable QP attributes; only the fields named by a `ModifyMask` are
/// meaningful in a given request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QpAttrs {
    pub state: QpState,
    pub en_sqd_async_notify: bool,
    pub access: u32,
    pub pkey: u16,
    pub qkey: u32,
    pub dgid: [u8; 16],
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub dest_mac: [u8; 6],
    /// Bytes
    pub path_mtu: u32,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub rq_psn: u32,
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub sq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub dest_qp_id: u32,
    pub vlan_id: u16,
    pub src_mac: [u8; 6],
}

impl QpAttrs {
    pub fn encode(&self, w: &mut WireWriter) {
        w.u8(self.state as u8)
            .u8(self.en_sqd_async_notify as u8)
            .u8(self.sgid_index)
            .u8(self.hop_limit)
            .u8(self.traffic_class)
            .u8(self.timeout)
            .u8(self.retry_cnt)
            .u8(self.rnr_retry)
            .u8(self.max_rd_atomic)
            .u8(self.min_rnr_timer)
            .u8(self.max_dest_rd_atomic)
            .u8(0)
            .u16(self.pkey)
            .u16(self.vlan_id)
            .u32(self.access)
            .u32(self.qkey)
            .u32(self.flow_label)
            .u32(self.path_mtu)
            .u32(self.rq_psn)
            .u32(self.sq_psn)
            .u32(self.dest_qp_id)
            .bytes(&self.dgid)
            .bytes(&self.dest_mac)
            .bytes(&self.src_mac);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Self {
        let state = QpState::from_raw(r.u8()).unwrap_or_default();
        let en_sqd_async_notify = r.u8() != 0;
        let sgid_index = r.u8();
        let hop_limit = r.u8();
        let traffic_class = r.u8();
        let timeout = r.u8();
        let retry_cnt = r.u8();
        let rnr_retry = r.u8();
        let max_rd_atomic = r.u8();
        let min_rnr_timer = r.u8();
        let max_dest_rd_atomic = r.u8();
        r.u8();
        let pkey = r.u16();
        let vlan_id = r.u16();
        let access = r.u32();
        let qkey = r.u32();
        let flow_label = r.u32();
        let path_mtu = r.u32();
        let rq_psn = r.u32();
        let sq_psn = r.u32();
        let dest_qp_id = r.u32();
        let mut dgid = [0u8; 16];
        dgid.copy_from_slice(&r.bytes(16));
        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&r.bytes(6));
        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&r.bytes(6));
        Self {
            state,
            en_sqd_async_notify,
            access,
            pkey,
            qkey,
            dgid,
            flow_label,
            sgid_index,
            hop_limit,
            traffic_class,
            dest_mac,
            path_mtu,
            timeout,
            retry_cnt,
            rnr_retry,
            rq_psn,
            max_rd_atomic,
            min_rnr_timer,
            sq_psn,
            max_dest_rd_atomic,
            dest_qp_id,
            vlan_id,
            src_mac,
        }
    }

    /// Copy the fields selected by `mask` from `other`
    pub fn apply(&mut self, mask: ModifyMask, other: &QpAttrs) {
        macro_rules! take {
            ($bit:ident, $($field:ident),+) => {
                if mask.contains(ModifyMask::$bit) {
                    $(self.$field = other.$field;)+
                }
            };
        }
        take!(STATE, state);
        take!(EN_SQD_ASYNC_NOTIFY, en_sqd_async_notify);
        take!(ACCESS, access);
        take!(PKEY, pkey);
        take!(QKEY, qkey);
        take!(DGID, dgid);
        take!(FLOW_LABEL, flow_label);
        take!(SGID_INDEX, sgid_index);
        take!(HOP_LIMIT, hop_limit);
        take!(TRAFFIC_CLASS, traffic_class);
        take!(DEST_MAC, dest_mac);
        take!(PATH_MTU, path_mtu);
        take!(TIMEOUT, timeout);
        take!(RETRY_CNT, retry_cnt);
        take!(RNR_RETRY, rnr_retry);
        take!(RQ_PSN, rq_psn);
        take!(MAX_RD_ATOMIC, max_rd_atomic);
        take!(MIN_RNR_TIMER, min_rnr_timer);
        take!(SQ_PSN, sq_psn);
        take!(MAX_DEST_RD_ATOMIC, max_dest_rd_atomic);
        take!(DEST_QP_ID, dest_qp_id);
        take!(VLAN_ID, vlan_id);
        take!(SRC_MAC, src_mac);
    }
}

/// Adjust a modify request for the `current → attrs.state` transition.
///
/// Entering RTR from INIT the firmware needs a path MTU, an SGID index and
/// at least one responder resource, and rejects VLAN/source-MAC updates.
/// Entering RTS from RTR it needs at least one requester resource and
/// ignores the RTR-only path attributes.
pub fn filter_modify(current: QpState, mut mask: ModifyMask, attrs: &mut QpAttrs) -> ModifyMask {
    if !mask.contains(ModifyMask::STATE) {
        return mask;
    }
    match (current, attrs.state) {
        (QpState::Init, QpState::Rtr) => {
            if !mask.contains(ModifyMask::PATH_MTU) {
                mask |= ModifyMask::PATH_MTU;
                attrs.path_mtu = DEFAULT_PATH_MTU;
            }
            mask.remove(ModifyMask::VLAN_ID | ModifyMask::SRC_MAC);
            if attrs.max_dest_rd_atomic < 1 {
                attrs.max_dest_rd_atomic = 1;
            }
            if !mask.contains(ModifyMask::SGID_INDEX) {
                mask |= ModifyMask::SGID_INDEX;
                attrs.sgid_index = 0;
            }
        }
        (QpState::Rtr, QpState::Rts) => {
            if attrs.max_rd_atomic < 1 {
                attrs.max_rd_atomic = 1;
            }
            mask.remove(
                ModifyMask::PKEY
                    | ModifyMask::DGID
                    | ModifyMask::FLOW_LABEL
                    | ModifyMask::SGID_INDEX
                    | ModifyMask::HOP_LIMIT
                    | ModifyMask::TRAFFIC_CLASS
                    | ModifyMask::DEST_MAC
                    | ModifyMask::PATH_MTU
                    | ModifyMask::RQ_PSN
                    | ModifyMask::MIN_RNR_TIMER
                    | ModifyMask::MAX_DEST_RD_ATOMIC
                    | ModifyMask::DEST_QP_ID,
            );
        }
        _ => {}
    }
    mask
}
