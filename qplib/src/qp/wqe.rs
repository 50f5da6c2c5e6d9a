//! Work requests and their slot encoding

use crate::config::WqeMode;
use crate::hsi::{
    self, HwSge, RqWqeHeader, SqWqeHeader, RQ_HDR_SLOTS, SLOT_SIZE, SQ_HDR_SLOTS, SQ_STATIC_MAX_SLOTS,
};
use crate::{QplibError, Result};
use bitflags::bitflags;

/// Work-request id of the fence WQE posted by the phantom-completion
/// workaround; its completions never reach the caller
pub const FENCE_WRID: u64 = 0x4645_4e43;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WqeFlags: u8 {
        const SIGNAL_COMP = hsi::WQE_FLAG_SIGNAL_COMP;
        const FENCE = hsi::WQE_FLAG_RD_ATOMIC_FENCE;
        const UC_FENCE = hsi::WQE_FLAG_UC_FENCE;
        const SOLICITED = hsi::WQE_FLAG_SOLICITED;
        const INLINE = hsi::WQE_FLAG_INLINE;
    }
}

/// Scatter/gather element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sge {
    pub addr: u64,
    pub lkey: u32,
    pub length: u32,
}

impl Sge {
    pub fn new(addr: u64, lkey: u32, length: u32) -> Self {
        Self { addr, lkey, length }
    }

    fn to_hw(self) -> HwSge {
        HwSge {
            addr: self.addr,
            lkey: self.lkey,
            size: self.length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOp {
    Send,
    SendWithImm { imm: u32 },
    SendWithInv { rkey: u32 },
    RdmaWrite { remote_addr: u64, rkey: u32 },
    RdmaWriteWithImm { remote_addr: u64, rkey: u32, imm: u32 },
    RdmaRead { remote_addr: u64, rkey: u32 },
    AtomicCmpSwap { remote_addr: u64, rkey: u32, compare: u64, swap: u64 },
    AtomicFetchAdd { remote_addr: u64, rkey: u32, add: u64 },
    LocalInv { key: u32 },
    BindMw { mw_key: u32, mr_lkey: u32, addr: u64, length: u32 },
}

impl SendOp {
    pub fn wqe_type(&self) -> u8 {
        match self {
            SendOp::Send => hsi::WQE_TYPE_SEND,
            SendOp::SendWithImm { .. } => hsi::WQE_TYPE_SEND_W_IMM,
            SendOp::SendWithInv { .. } => hsi::WQE_TYPE_SEND_W_INV,
            SendOp::RdmaWrite { .. } => hsi::WQE_TYPE_WRITE,
            SendOp::RdmaWriteWithImm { .. } => hsi::WQE_TYPE_WRITE_W_IMM,
            SendOp::RdmaRead { .. } => hsi::WQE_TYPE_READ,
            SendOp::AtomicCmpSwap { .. } => hsi::WQE_TYPE_ATOMIC_CS,
            SendOp::AtomicFetchAdd { .. } => hsi::WQE_TYPE_ATOMIC_FA,
            SendOp::LocalInv { .. } => hsi::WQE_TYPE_LOCAL_INV,
            SendOp::BindMw { .. } => hsi::WQE_TYPE_BIND,
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, SendOp::AtomicCmpSwap { .. } | SendOp::AtomicFetchAdd { .. })
    }

    /// Operations a datagram QP can carry
    pub fn allowed_on_datagram(&self) -> bool {
        matches!(self, SendOp::Send | SendOp::SendWithImm { .. })
    }

    /// Operations without a data payload
    pub fn is_memory_op(&self) -> bool {
        matches!(self, SendOp::LocalInv { .. } | SendOp::BindMw { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sges(Vec<Sge>),
    Inline(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Sges(Vec::new())
    }
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Sges(sges) => sges.iter().map(|s| s.length as u64).sum(),
            Payload::Inline(data) => data.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots the payload occupies in the ring
    pub fn slots(&self) -> u32 {
        match self {
            Payload::Sges(sges) => sges.len() as u32,
            Payload::Inline(data) => data.len().div_ceil(SLOT_SIZE) as u32,
        }
    }
}

/// Destination of a datagram send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdDest {
    pub ah_id: u32,
    pub dest_qp: u32,
    pub qkey: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWqe {
    pub wr_id: u64,
    pub op: SendOp,
    pub flags: WqeFlags,
    pub payload: Payload,
    pub ud: Option<UdDest>,
}

impl SendWqe {
    pub fn new(wr_id: u64, op: SendOp, payload: Payload) -> Self {
        Self {
            wr_id,
            op,
            flags: WqeFlags::empty(),
            payload,
            ud: None,
        }
    }

    pub fn signaled(mut self) -> Self {
        self.flags |= WqeFlags::SIGNAL_COMP;
        self
    }

    pub fn with_flags(mut self, flags: WqeFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn to(mut self, dest: UdDest) -> Self {
        self.ud = Some(dest);
        self
    }

    /// Fence WQE used by the phantom-completion workaround
    pub fn phantom_fence() -> Self {
        Self {
            wr_id: FENCE_WRID,
            op: SendOp::BindMw {
                mw_key: 0,
                mr_lkey: 0,
                addr: 0,
                length: 0,
            },
            flags: WqeFlags::SIGNAL_COMP | WqeFlags::UC_FENCE,
            payload: Payload::default(),
            ud: None,
        }
    }

    fn operand_slots(&self) -> u32 {
        self.op.is_atomic() as u32
    }

    /// Slots of actual content (header, operands, payload)
    pub fn content_slots(&self) -> u32 {
        SQ_HDR_SLOTS + self.operand_slots() + self.payload.slots()
    }

    /// Slots the WQE consumes in the ring under `mode`
    pub fn ring_slots(&self, mode: WqeMode) -> u32 {
        match mode {
            WqeMode::Static => SQ_STATIC_MAX_SLOTS,
            WqeMode::Variable => self.content_slots(),
        }
    }

    /// Serialize into `content_slots()` slots
    pub fn encode(&self, swq_idx: u16, ring_slots: u32) -> Vec<u8> {
        let mut hdr = SqWqeHeader {
            wqe_type: self.op.wqe_type(),
            flags: self.flags.bits(),
            wqe_slots: ring_slots as u8,
            num_sge: match &self.payload {
                Payload::Sges(sges) => sges.len() as u8,
                Payload::Inline(_) => 0,
            },
            length: self.payload.len() as u32,
            swq_idx,
            ..Default::default()
        };
        if matches!(self.payload, Payload::Inline(_)) {
            hdr.flags |= hsi::WQE_FLAG_INLINE;
        }

        let mut operand = None;
        match self.op {
            SendOp::Send => {}
            SendOp::SendWithImm { imm } => hdr.key_immed = imm,
            SendOp::SendWithInv { rkey } => hdr.key_immed = rkey,
            SendOp::RdmaWrite { remote_addr, rkey } | SendOp::RdmaRead { remote_addr, rkey } => {
                hdr.ext_va = remote_addr;
                hdr.ext_key = rkey;
            }
            SendOp::RdmaWriteWithImm {
                remote_addr,
                rkey,
                imm,
            } => {
                hdr.ext_va = remote_addr;
                hdr.ext_key = rkey;
                hdr.key_immed = imm;
            }
            SendOp::AtomicCmpSwap {
                remote_addr,
                rkey,
                compare,
                swap,
            } => {
                hdr.ext_va = remote_addr;
                hdr.ext_key = rkey;
                operand = Some((swap, compare));
            }
            SendOp::AtomicFetchAdd {
                remote_addr,
                rkey,
                add,
            } => {
                hdr.ext_va = remote_addr;
                hdr.ext_key = rkey;
                operand = Some((add, 0));
            }
            SendOp::LocalInv { key } => hdr.key_immed = key,
            SendOp::BindMw {
                mw_key,
                mr_lkey,
                addr,
                length,
            } => {
                hdr.key_immed = mw_key;
                hdr.ext_va = addr;
                hdr.ext_aux = mr_lkey;
                hdr.length = length;
            }
        }
        if let Some(dest) = self.ud {
            hdr.ext_va = dest.qkey as u64;
            hdr.ext_key = dest.dest_qp;
            hdr.ext_aux = dest.ah_id;
        }

        let mut out = Vec::with_capacity(self.content_slots() as usize * SLOT_SIZE);
        out.extend_from_slice(&hdr.encode());
        if let Some((first, second)) = operand {
            out.extend_from_slice(&first.to_le_bytes());
            out.extend_from_slice(&second.to_le_bytes());
        }
        match &self.payload {
            Payload::Sges(sges) => {
                for sge in sges {
                    out.extend_from_slice(&sge.to_hw().encode());
                }
            }
            Payload::Inline(data) => {
                out.extend_from_slice(data);
                out.resize(out.len().div_ceil(SLOT_SIZE) * SLOT_SIZE, 0);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWqe {
    pub wr_id: u64,
    pub sges: Vec<Sge>,
}

impl RecvWqe {
    pub fn new(wr_id: u64, sges: Vec<Sge>) -> Self {
        Self { wr_id, sges }
    }

    /// Serialize into `slots_per_wqe` slots, tagged with the shadow index
    pub fn encode(&self, wr_id_idx: u32, slots_per_wqe: u32) -> Vec<u8> {
        let hdr = RqWqeHeader {
            wqe_slots: slots_per_wqe as u8,
            num_sge: self.sges.len() as u8,
            wr_id_idx,
        };
        let mut out = Vec::with_capacity(slots_per_wqe as usize * SLOT_SIZE);
        out.extend_from_slice(&hdr.encode());
        for sge in &self.sges {
            out.extend_from_slice(&sge.to_hw().encode());
        }
        out.resize(slots_per_wqe as usize * SLOT_SIZE, 0);
        out
    }
}

/// Send queue geometry derived from the requested limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqSizing {
    /// Payload slots available to one WQE (SGEs or inline data)
    pub payload_slots: u32,
    /// Largest WQE in slots
    pub max_wqe_slots: u32,
    /// Shadow ring entries: one more than the WQEs that may be outstanding
    pub shadow_len: u32,
    /// Ring slots requested from the hardware queue
    pub ring_slots: u32,
}

/// Size a send queue for `max_wr` outstanding WQEs
pub fn size_sq(max_wr: u32, max_sge: u32, max_inline: u32, headroom: u32, mode: WqeMode) -> Result<SqSizing> {
    if max_wr == 0 {
        return Err(QplibError::InvalidArgument("send queue needs at least one WQE".into()));
    }
    let inline_slots = (max_inline as usize).div_ceil(SLOT_SIZE) as u32;
    let (payload_slots, max_wqe_slots) = match mode {
        WqeMode::Variable => {
            let payload = max_sge.max(inline_slots).max(2);
            (payload, SQ_HDR_SLOTS + payload)
        }
        WqeMode::Static => {
            let payload = SQ_STATIC_MAX_SLOTS - SQ_HDR_SLOTS;
            if max_sge > payload || inline_slots > payload {
                return Err(QplibError::InvalidArgument(format!(
                    "static WQEs carry at most {} SGEs or {} inline bytes",
                    payload,
                    payload as usize * SLOT_SIZE
                )));
            }
            (payload, SQ_STATIC_MAX_SLOTS)
        }
    };
    let shadow_len = max_wr + 1;
    Ok(SqSizing {
        payload_slots,
        max_wqe_slots,
        shadow_len,
        ring_slots: shadow_len * max_wqe_slots + headroom,
    })
}

/// Slots one receive WQE takes: header plus room for `max_sge` SGEs
pub fn rq_slots_per_wqe(max_sge: u32) -> u32 {
    RQ_HDR_SLOTS + max_sge.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_slot_counts() {
        let sges = vec![Sge::new(0x1000, 1, 64), Sge::new(0x2000, 1, 64)];
        let wqe = SendWqe::new(1, SendOp::Send, Payload::Sges(sges));
        assert_eq!(wqe.content_slots(), 4);
        assert_eq!(wqe.ring_slots(WqeMode::Variable), 4);
        assert_eq!(wqe.ring_slots(WqeMode::Static), SQ_STATIC_MAX_SLOTS);

        let inline = SendWqe::new(2, SendOp::Send, Payload::Inline(vec![0xab; 33]));
        assert_eq!(inline.content_slots(), 5);

        let atomic = SendWqe::new(
            3,
            SendOp::AtomicFetchAdd {
                remote_addr: 0x8000,
                rkey: 7,
                add: 1,
            },
            Payload::Sges(vec![Sge::new(0x3000, 1, 8)]),
        );
        assert_eq!(atomic.content_slots(), 4);
    }

    #[test]
    fn test_send_encoding() {
        let wqe = SendWqe::new(
            9,
            SendOp::RdmaWriteWithImm {
                remote_addr: 0xdead_0000,
                rkey: 0x55,
                imm: 0x1234,
            },
            Payload::Inline(b"hello".to_vec()),
        )
        .signaled();
        let raw = wqe.encode(3, 3);
        assert_eq!(raw.len(), 3 * SLOT_SIZE);

        let hdr = SqWqeHeader::decode(&raw);
        assert_eq!(hdr.wqe_type, hsi::WQE_TYPE_WRITE_W_IMM);
        assert_eq!(hdr.flags, hsi::WQE_FLAG_SIGNAL_COMP | hsi::WQE_FLAG_INLINE);
        assert_eq!(hdr.length, 5);
        assert_eq!(hdr.swq_idx, 3);
        assert_eq!(hdr.ext_va, 0xdead_0000);
        assert_eq!(hdr.key_immed, 0x1234);
        assert_eq!(&raw[32..37], b"hello");
    }

    #[test]
    fn test_ud_destination_in_extension() {
        let wqe = SendWqe::new(1, SendOp::Send, Payload::Sges(vec![Sge::new(0x1000, 2, 10)])).to(UdDest {
            ah_id: 4,
            dest_qp: 0x21,
            qkey: 0x1111,
        });
        let hdr = SqWqeHeader::decode(&wqe.encode(0, 3));
        assert_eq!(hdr.ext_key, 0x21);
        assert_eq!(hdr.ext_aux, 4);
        assert_eq!(hdr.ext_va, 0x1111);
        let sge = HwSge::decode(&wqe.encode(0, 3)[32..]);
        assert_eq!(sge.lkey, 2);
    }

    #[test]
    fn test_recv_encoding_padded() {
        let wqe = RecvWqe::new(5, vec![Sge::new(0x4000, 3, 256)]);
        let raw = wqe.encode(17, rq_slots_per_wqe(3));
        assert_eq!(raw.len(), 4 * SLOT_SIZE);
        let hdr = RqWqeHeader::decode(&raw);
        assert_eq!(hdr.wr_id_idx, 17);
        assert_eq!(hdr.num_sge, 1);
    }

    #[test]
    fn test_size_sq() {
        let sizing = size_sq(256, 2, 64, 0, WqeMode::Variable).unwrap();
        assert_eq!(sizing.payload_slots, 4);
        assert_eq!(sizing.shadow_len, 257);
        assert_eq!(sizing.ring_slots, 257 * 6);

        let sizing = size_sq(16, 1, 0, 8, WqeMode::Static).unwrap();
        assert_eq!(sizing.max_wqe_slots, SQ_STATIC_MAX_SLOTS);
        assert_eq!(sizing.ring_slots, 17 * 8 + 8);

        assert!(size_sq(16, 7, 0, 0, WqeMode::Static).is_err());
        assert!(size_sq(0, 1, 0, 0, WqeMode::Variable).is_err());
    }

    #[test]
    fn test_phantom_fence_shape() {
        let fence = SendWqe::phantom_fence();
        assert_eq!(fence.wr_id, FENCE_WRID);
        assert!(fence.flags.contains(WqeFlags::SIGNAL_COMP));
        assert_eq!(fence.content_slots(), SQ_HDR_SLOTS);
    }
}
