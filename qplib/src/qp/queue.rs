//! Send and receive rings with their software shadows
//!
//! The shadow ring runs parallel to the hardware ring: one entry per WQE,
//! holding what the completion path needs to report it (work-request id,
//! signaling, slots consumed, sequence numbers). Completion records name a
//! shadow index; everything between the shadow consumer and that index is
//! retired in order.

use super::wqe::{RecvWqe, SendWqe, SqSizing};
use super::types::DEFAULT_PATH_MTU;
use crate::config::WqeMode;
use crate::doorbell::{DoorbellInfo, DoorbellType};
use crate::hsi::{self, PsnSearch, PSN_MASK, PSN_SEARCH_PHANTOM_MARK, PSN_SEARCH_SIZE, SLOT_SIZE};
use crate::hwq::HardwareQueue;
use crate::{QplibError, Result};
use log::debug;

/// Per-WQE sequence bookkeeping kept in the send queue's auxiliary area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqTable {
    None,
    /// PSN search entries (software retransmission)
    Psn,
    /// MSN entries (hardware retransmission)
    Msn,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SwqEntry {
    pub wr_id: u64,
    pub slots: u32,
    pub signaled: bool,
    pub wqe_type: u8,
    pub start_psn: u32,
    pub next_psn: u32,
}

pub(crate) struct SendQueue {
    pub(crate) hwq: HardwareQueue,
    db: DoorbellInfo,
    mode: WqeMode,
    sizing: SqSizing,
    headroom: u32,
    max_sge: u32,
    max_inline: u32,
    seq_table: SeqTable,
    shadow: Vec<SwqEntry>,
    swq_prod: u32,
    swq_cons: u32,
    psn: u32,
    mtu: u32,
    // Phantom-completion workaround state
    pub(crate) condition: bool,
    pub(crate) single: bool,
    pub(crate) send_phantom: bool,
}

impl SendQueue {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hwq: HardwareQueue,
        db: DoorbellInfo,
        mode: WqeMode,
        sizing: SqSizing,
        headroom: u32,
        max_sge: u32,
        max_inline: u32,
        seq_table: SeqTable,
        psn: u32,
    ) -> Self {
        Self {
            hwq,
            db,
            mode,
            sizing,
            headroom,
            max_sge,
            max_inline,
            seq_table,
            shadow: vec![SwqEntry::default(); sizing.shadow_len as usize],
            swq_prod: 0,
            swq_cons: 0,
            psn: psn & PSN_MASK,
            mtu: DEFAULT_PATH_MTU,
            condition: false,
            single: false,
            send_phantom: false,
        }
    }

    pub(crate) fn shadow_len(&self) -> u32 {
        self.sizing.shadow_len
    }

    pub(crate) fn outstanding(&self) -> u32 {
        (self.swq_prod + self.shadow_len() - self.swq_cons) % self.shadow_len()
    }

    pub(crate) fn free_entries(&self) -> u32 {
        self.shadow_len() - 1 - self.outstanding()
    }

    pub(crate) fn swq_cons(&self) -> u32 {
        self.swq_cons
    }

    pub(crate) fn swq_prod(&self) -> u32 {
        self.swq_prod
    }

    pub(crate) fn entry(&self, idx: u32) -> &SwqEntry {
        &self.shadow[(idx % self.shadow_len()) as usize]
    }

    pub(crate) fn psn(&self) -> u32 {
        self.psn
    }

    pub(crate) fn set_psn(&mut self, psn: u32) {
        self.psn = psn & PSN_MASK;
    }

    pub(crate) fn set_mtu(&mut self, mtu: u32) {
        if mtu > 0 {
            self.mtu = mtu;
        }
    }

    pub(crate) fn seq_table(&self) -> SeqTable {
        self.seq_table
    }

    fn validate(&self, wqe: &SendWqe) -> Result<()> {
        match &wqe.payload {
            super::Payload::Sges(sges) if sges.len() as u32 > self.max_sge => {
                Err(QplibError::InvalidArgument(format!(
                    "{} SGEs exceed the send queue limit of {}",
                    sges.len(),
                    self.max_sge
                )))
            }
            super::Payload::Inline(data) if data.len() as u32 > self.max_inline => {
                Err(QplibError::InvalidArgument(format!(
                    "{} inline bytes exceed the limit of {}",
                    data.len(),
                    self.max_inline
                )))
            }
            _ if wqe.content_slots() > self.sizing.max_wqe_slots => Err(QplibError::InvalidArgument(
                format!(
                    "WQE needs {} slots, queue allows {}",
                    wqe.content_slots(),
                    self.sizing.max_wqe_slots
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Packets a WQE puts on the wire, for PSN accounting
    fn packets(&self, wqe: &SendWqe, datagram: bool) -> u32 {
        if datagram || wqe.op.is_memory_op() || wqe.op.is_atomic() {
            return 1;
        }
        let len = wqe.payload.len();
        (len.div_ceil(self.mtu as u64) as u32).max(1)
    }

    /// Claim a shadow entry and ring slots for `wqe`.
    ///
    /// With `encode` false (QP in error) nothing is written to the ring;
    /// the entry only exists so the flush path can report it.
    ///
    /// # Returns
    /// The shadow index the WQE occupies
    pub(crate) fn post(&mut self, wqe: &SendWqe, encode: bool, datagram: bool) -> Result<u32> {
        self.validate(wqe)?;
        let slots = wqe.ring_slots(self.mode);
        if self.free_entries() == 0 || self.hwq.is_full(slots + self.headroom) {
            debug!(
                "SQ full: need {}+{} slots, {} free, {} shadow entries free",
                slots,
                self.headroom,
                self.hwq.free_slots(),
                self.free_entries()
            );
            return Err(QplibError::QueueFull);
        }

        let idx = self.swq_prod;
        let start_slot = self.hwq.prod();
        let start_psn = self.psn;
        let mut next_psn = start_psn;

        if encode {
            let bytes = wqe.encode(idx as u16, slots);
            for (i, chunk) in bytes.chunks(SLOT_SIZE).enumerate() {
                self.hwq.write_slot(start_slot + i as u32, 0, chunk)?;
            }
            next_psn = (start_psn + self.packets(wqe, datagram)) & PSN_MASK;
            match self.seq_table {
                SeqTable::None => {}
                SeqTable::Psn => {
                    let entry = PsnSearch::new(wqe.op.wqe_type(), start_psn, next_psn);
                    self.hwq.write_aux(idx, &entry.encode())?;
                }
                SeqTable::Msn => {
                    let entry = hsi::encode_msn(start_slot as u16, start_psn, next_psn);
                    self.hwq.write_aux(idx, &entry.to_le_bytes())?;
                }
            }
            self.psn = next_psn;
        }

        self.shadow[idx as usize] = SwqEntry {
            wr_id: wqe.wr_id,
            slots,
            signaled: wqe.flags.contains(super::WqeFlags::SIGNAL_COMP),
            wqe_type: wqe.op.wqe_type(),
            start_psn,
            next_psn,
        };
        self.swq_prod = (idx + 1) % self.shadow_len();
        self.hwq.advance_producer(slots);
        Ok(idx)
    }

    /// Retire the oldest entry, releasing its ring slots
    pub(crate) fn pop_front(&mut self) -> Option<SwqEntry> {
        if self.swq_cons == self.swq_prod {
            return None;
        }
        let entry = self.shadow[self.swq_cons as usize].clone();
        self.hwq.advance_consumer(entry.slots);
        self.swq_cons = (self.swq_cons + 1) % self.shadow_len();
        Some(entry)
    }

    pub(crate) fn front(&self) -> Option<&SwqEntry> {
        (self.swq_cons != self.swq_prod).then(|| &self.shadow[self.swq_cons as usize])
    }

    pub(crate) fn ring_doorbell(&self) {
        self.db
            .ring(DoorbellType::Sq, self.hwq.prod(), self.hwq.prod_epoch(), 0);
    }

    fn read_psn_entry(&self, idx: u32) -> Option<PsnSearch> {
        if self.seq_table != SeqTable::Psn {
            return None;
        }
        let mut raw = [0u8; PSN_SEARCH_SIZE];
        self.hwq.read_aux(idx, &mut raw).ok()?;
        Some(PsnSearch::decode(&raw))
    }

    /// The adapter flagged this WQE as needing a fence before it completes
    pub(crate) fn phantom_marked(&self, idx: u32) -> bool {
        self.read_psn_entry(idx)
            .map(|entry| entry.is_phantom_marked())
            .unwrap_or(false)
    }

    pub(crate) fn clear_phantom_mark(&mut self, idx: u32) -> Result<()> {
        if let Some(mut entry) = self.read_psn_entry(idx) {
            entry.flags_next_psn &= !PSN_SEARCH_PHANTOM_MARK;
            self.hwq.write_aux(idx, &entry.encode())?;
        }
        Ok(())
    }

    pub(crate) fn cancel_phantom(&mut self) {
        self.condition = false;
        self.single = false;
    }

    pub(crate) fn reset(&mut self) {
        self.hwq.reset();
        self.swq_prod = 0;
        self.swq_cons = 0;
        self.cancel_phantom();
        self.send_phantom = false;
    }
}

pub(crate) struct RecvQueue {
    pub(crate) hwq: HardwareQueue,
    db: DoorbellInfo,
    slots_per_wqe: u32,
    max_sge: u32,
    shadow: Vec<u64>,
    prod: u32,
    cons: u32,
}

impl RecvQueue {
    pub(crate) fn new(hwq: HardwareQueue, db: DoorbellInfo, shadow_len: u32, slots_per_wqe: u32, max_sge: u32) -> Self {
        Self {
            hwq,
            db,
            slots_per_wqe,
            max_sge,
            shadow: vec![0; shadow_len as usize],
            prod: 0,
            cons: 0,
        }
    }

    fn len(&self) -> u32 {
        self.shadow.len() as u32
    }

    pub(crate) fn outstanding(&self) -> u32 {
        (self.prod + self.len() - self.cons) % self.len()
    }

    pub(crate) fn cons(&self) -> u32 {
        self.cons
    }

    pub(crate) fn post(&mut self, wqe: &RecvWqe, encode: bool) -> Result<u32> {
        if wqe.sges.len() as u32 > self.max_sge {
            return Err(QplibError::InvalidArgument(format!(
                "{} SGEs exceed the receive queue limit of {}",
                wqe.sges.len(),
                self.max_sge
            )));
        }
        if self.outstanding() == self.len() - 1 || self.hwq.is_full(self.slots_per_wqe) {
            return Err(QplibError::QueueFull);
        }

        let idx = self.prod;
        if encode {
            let start = self.hwq.prod();
            let bytes = wqe.encode(idx, self.slots_per_wqe);
            for (i, chunk) in bytes.chunks(SLOT_SIZE).enumerate() {
                self.hwq.write_slot(start + i as u32, 0, chunk)?;
            }
        }
        self.shadow[idx as usize] = wqe.wr_id;
        self.prod = (idx + 1) % self.len();
        self.hwq.advance_producer(self.slots_per_wqe);
        Ok(idx)
    }

    /// Retire the oldest receive: (shadow index, wr_id)
    pub(crate) fn pop_front(&mut self) -> Option<(u32, u64)> {
        if self.cons == self.prod {
            return None;
        }
        let idx = self.cons;
        self.hwq.advance_consumer(self.slots_per_wqe);
        self.cons = (idx + 1) % self.len();
        Some((idx, self.shadow[idx as usize]))
    }

    pub(crate) fn ring_doorbell(&self) {
        self.db
            .ring(DoorbellType::Rq, self.hwq.prod(), self.hwq.prod_epoch(), 0);
    }

    pub(crate) fn reset(&mut self) {
        self.hwq.reset();
        self.prod = 0;
        self.cons = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use crate::doorbell::{DoorbellWord, RecordingDoorbell};
    use crate::hsi::SqWqeHeader;
    use crate::hwq::{HwqAttr, HwqType};
    use crate::qp::wqe::{size_sq, Payload, SendOp, Sge};
    use std::sync::Arc;

    fn send_queue(ring_slots: u32, max_wr: u32, seq: SeqTable) -> (SendQueue, Arc<RecordingDoorbell>) {
        let dma = HostDma::new();
        let db = RecordingDoorbell::new();
        let mut sizing = size_sq(max_wr, 4, 32, 0, WqeMode::Variable).unwrap();
        sizing.ring_slots = ring_slots;
        let hwq = HardwareQueue::allocate(
            dma.as_ref(),
            &HwqAttr {
                depth: ring_slots,
                stride: SLOT_SIZE as u32,
                aux_depth: if seq == SeqTable::None { 0 } else { sizing.shadow_len },
                aux_stride: PSN_SEARCH_SIZE as u32,
                kind: HwqType::Queue,
            },
        )
        .unwrap();
        let info = DoorbellInfo::new(db.clone(), 0, 7);
        (
            SendQueue::new(hwq, info, WqeMode::Variable, sizing, 0, 4, 32, seq, 100),
            db,
        )
    }

    fn send_with(wr_id: u64, nsge: usize) -> SendWqe {
        let sges = (0..nsge).map(|i| Sge::new(0x1000 * i as u64, 1, 64)).collect();
        SendWqe::new(wr_id, SendOp::Send, Payload::Sges(sges)).signaled()
    }

    #[test]
    fn test_post_exact_fit_and_one_short() {
        let (mut sq, _) = send_queue(16, 32, SeqTable::None);
        for i in 0..4 {
            sq.post(&send_with(i, 1), true, false).unwrap();
        }
        assert_eq!(sq.hwq.free_slots(), 4);

        // Needs 5 slots with 4 free: rejected, indices untouched
        let (prod, cons) = (sq.hwq.prod(), sq.hwq.cons());
        assert_eq!(sq.post(&send_with(9, 3), true, false), Err(QplibError::QueueFull));
        assert_eq!((sq.hwq.prod(), sq.hwq.cons()), (prod, cons));
        assert_eq!(sq.outstanding(), 4);

        // Needs exactly the 4 free slots
        assert_eq!(sq.post(&send_with(10, 2), true, false), Ok(4));
        assert_eq!(sq.hwq.free_slots(), 0);
    }

    #[test]
    fn test_shadow_ring_limits_outstanding() {
        let (mut sq, _) = send_queue(256, 3, SeqTable::None);
        for i in 0..3 {
            sq.post(&send_with(i, 1), true, false).unwrap();
        }
        assert_eq!(sq.free_entries(), 0);
        assert_eq!(sq.post(&send_with(3, 1), true, false), Err(QplibError::QueueFull));

        let entry = sq.pop_front().unwrap();
        assert_eq!(entry.wr_id, 0);
        assert_eq!(sq.hwq.cons(), 3);
        assert!(sq.post(&send_with(3, 1), true, false).is_ok());
    }

    #[test]
    fn test_wqe_lands_in_ring() {
        let (mut sq, db) = send_queue(64, 8, SeqTable::None);
        sq.post(&send_with(1, 1), true, false).unwrap();
        sq.post(&send_with(2, 2), true, false).unwrap();
        sq.ring_doorbell();

        let mut raw = [0u8; 32];
        sq.hwq.read_slot(3, &mut raw[..16]).unwrap();
        sq.hwq.read_slot(4, &mut raw[16..]).unwrap();
        let hdr = SqWqeHeader::decode(&raw);
        assert_eq!(hdr.swq_idx, 1);
        assert_eq!(hdr.num_sge, 2);
        assert_eq!(hdr.wqe_slots, 4);

        let word = DoorbellWord::decode(db.writes()[0].1).unwrap();
        assert_eq!(word.kind, DoorbellType::Sq);
        assert_eq!(word.index, 7);
        assert_eq!(word.xid, 7);
    }

    #[test]
    fn test_error_path_skips_encoding() {
        let (mut sq, _) = send_queue(64, 8, SeqTable::Psn);
        sq.post(&send_with(1, 1), false, false).unwrap();
        let mut raw = [0u8; 16];
        sq.hwq.read_slot(0, &mut raw).unwrap();
        assert_eq!(raw, [0u8; 16]);
        assert_eq!(sq.hwq.prod(), 3);
        assert_eq!(sq.psn(), 100);
        assert_eq!(sq.front().map(|e| e.wr_id), Some(1));
    }

    #[test]
    fn test_psn_advances_by_packets() {
        let (mut sq, _) = send_queue(64, 8, SeqTable::Psn);
        sq.set_mtu(1024);
        let big = SendWqe::new(1, SendOp::Send, Payload::Sges(vec![Sge::new(0, 1, 2500)]));
        sq.post(&big, true, false).unwrap();
        assert_eq!(sq.psn(), 103);
        let entry = sq.entry(0).clone();
        assert_eq!((entry.start_psn, entry.next_psn), (100, 103));

        let empty = SendWqe::new(2, SendOp::Send, Payload::Inline(Vec::new()));
        sq.post(&empty, true, false).unwrap();
        assert_eq!(sq.psn(), 104);

        let mut raw = [0u8; PSN_SEARCH_SIZE];
        sq.hwq.read_aux(0, &mut raw).unwrap();
        let psn = PsnSearch::decode(&raw);
        assert_eq!(psn.opcode_start_psn & PSN_MASK, 100);
        assert_eq!(psn.flags_next_psn, 103);
    }

    #[test]
    fn test_phantom_mark_roundtrip() {
        let (mut sq, _) = send_queue(64, 8, SeqTable::Psn);
        sq.post(&send_with(1, 1), true, false).unwrap();
        assert!(!sq.phantom_marked(0));

        let mut raw = [0u8; PSN_SEARCH_SIZE];
        sq.hwq.read_aux(0, &mut raw).unwrap();
        let mut entry = PsnSearch::decode(&raw);
        entry.flags_next_psn |= PSN_SEARCH_PHANTOM_MARK;
        sq.hwq.write_aux(0, &entry.encode()).unwrap();

        assert!(sq.phantom_marked(0));
        sq.clear_phantom_mark(0).unwrap();
        assert!(!sq.phantom_marked(0));
    }

    #[test]
    fn test_oversized_wqe_rejected() {
        let (mut sq, _) = send_queue(64, 8, SeqTable::None);
        assert!(matches!(
            sq.post(&send_with(1, 5), true, false),
            Err(QplibError::InvalidArgument(_))
        ));
        let inline = SendWqe::new(2, SendOp::Send, Payload::Inline(vec![0; 33]));
        assert!(matches!(
            sq.post(&inline, true, false),
            Err(QplibError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_recv_queue_order_and_full() {
        let dma = HostDma::new();
        let db = RecordingDoorbell::new();
        let hwq = HardwareQueue::allocate(dma.as_ref(), &HwqAttr::ring(3 * 2, 16, HwqType::Queue)).unwrap();
        let mut rq = RecvQueue::new(hwq, DoorbellInfo::new(db, 0, 1), 3, 2, 1);

        assert_eq!(rq.post(&RecvWqe::new(10, vec![Sge::new(0, 1, 8)]), true).unwrap(), 0);
        assert_eq!(rq.post(&RecvWqe::new(11, vec![]), true).unwrap(), 1);
        assert_eq!(rq.post(&RecvWqe::new(12, vec![]), true), Err(QplibError::QueueFull));
        assert_eq!(rq.pop_front(), Some((0, 10)));
        assert_eq!(rq.cons(), 1);
        assert_eq!(rq.pop_front(), Some((1, 11)));
        assert_eq!(rq.pop_front(), None);
    }
}
