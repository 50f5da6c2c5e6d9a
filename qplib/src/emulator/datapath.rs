//! Data path of the model: doorbells, send WQE execution and receive
//! consumption. Every QP on the function is reachable from every other,
//! so RC connections and UD sends loop back inside one adapter.

use super::firmware::{Arm, EmuState};
use super::ring::Cursor;
use crate::doorbell::{DoorbellType, DoorbellWord};
use crate::hsi::{
    self, CreqEntry, HwCqe, HwSge, PsnSearch, ResKind, RqWqeHeader, SqWqeHeader, FUNC_EVENT_SRQ_LIMIT,
    PSN_SEARCH_PHANTOM_MARK, PSN_SEARCH_SIZE, SLOT_SIZE, SQ_HDR_SLOTS,
};
use crate::qp::{QpState, QpType};
use crate::sp::Access;
use log::{debug, error, warn};

/// A receive WQE taken off a QP's RQ or its SRQ
struct Receive {
    wr_id_idx: u32,
    sges: Vec<HwSge>,
    from_srq: bool,
}

impl Receive {
    fn capacity(&self) -> u64 {
        self.sges.iter().map(|s| s.size as u64).sum()
    }
}

/// Requester side of one executed WQE
struct SendResult {
    status: u8,
}

impl SendResult {
    fn ok() -> Self {
        Self {
            status: hsi::CQE_REQ_STATUS_OK,
        }
    }

    fn status(status: u8) -> Self {
        Self { status }
    }
}

fn decode_sges(bytes: &[u8], start: usize, count: usize) -> Vec<HwSge> {
    bytes
        .get(start..)
        .unwrap_or_default()
        .chunks(SLOT_SIZE)
        .take(count)
        .map(HwSge::decode)
        .collect()
}

impl EmuState {
    /// A write to the data-path doorbell region
    pub fn doorbell(&mut self, offset: u64, value: u64) {
        let Some(word) = DoorbellWord::decode(value) else {
            warn!("Emulator: malformed doorbell 0x{:x} at 0x{:x}", value, offset);
            return;
        };
        match word.kind {
            DoorbellType::Sq => {
                match self.qps.get_mut(&word.xid) {
                    Some(qp) => qp.sq_tail = (word.index, word.epoch),
                    None => {
                        warn!("Emulator: SQ doorbell for unknown QP 0x{:x}", word.xid);
                        return;
                    }
                }
                self.drain_sq(word.xid);
            }
            DoorbellType::Rq => match self.qps.get_mut(&word.xid).and_then(|qp| qp.rq.as_mut()) {
                Some(rq) => rq.tail = (word.index, word.epoch),
                None => warn!("Emulator: RQ doorbell for unknown QP 0x{:x}", word.xid),
            },
            DoorbellType::Srq => match self.srqs.get_mut(&word.xid) {
                Some(srq) => srq.ring.tail = (word.index, word.epoch),
                None => warn!("Emulator: doorbell for unknown SRQ 0x{:x}", word.xid),
            },
            DoorbellType::SrqArm => match self.srqs.get_mut(&word.xid) {
                Some(srq) => {
                    srq.limit = word.index;
                    srq.armed = true;
                    debug!("Emulator: SRQ 0x{:x} armed at {}", word.xid, word.index);
                }
                None => warn!("Emulator: arm for unknown SRQ 0x{:x}", word.xid),
            },
            DoorbellType::Cq | DoorbellType::CqArmSe | DoorbellType::CqArmAll => {
                let Some(cq) = self.cqs.get_mut(&word.xid) else {
                    warn!("Emulator: doorbell for unknown CQ 0x{:x}", word.xid);
                    return;
                };
                cq.cons = (word.index, word.epoch);
                match word.kind {
                    DoorbellType::CqArmSe => cq.arm = Arm::Solicited,
                    DoorbellType::CqArmAll => cq.arm = Arm::All,
                    _ => {}
                }
            }
            kind => debug!("Emulator: {:?} doorbell for 0x{:x}", kind, word.xid),
        }
    }

    /// Execute send WQEs up to the last SQ doorbell while the QP may send
    pub fn drain_sq(&mut self, qp_id: u32) {
        loop {
            let Some(qp) = self.qps.get(&qp_id) else {
                return;
            };
            if !matches!(qp.state, QpState::Rts | QpState::Sqd) {
                return;
            }
            let mut cursor = qp.sq;
            if cursor.at(qp.sq_tail.0, qp.sq_tail.1) {
                return;
            }
            let bytes = match cursor.read_slots(&self.dma, SQ_HDR_SLOTS) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Emulator: reading SQ of QP 0x{:x}: {}", qp_id, e);
                    return;
                }
            };
            let hdr = SqWqeHeader::decode(&bytes);
            let slots = (hdr.wqe_slots as u32).max(SQ_HDR_SLOTS);
            let bytes = match cursor.read_slots(&self.dma, slots) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Emulator: reading WQE of QP 0x{:x}: {}", qp_id, e);
                    return;
                }
            };
            cursor.advance(slots);
            if let Some(qp) = self.qps.get_mut(&qp_id) {
                qp.sq = cursor;
            }
            self.wqes_executed += 1;
            let result = self.execute_send(qp_id, &hdr, &bytes);
            self.complete_send(qp_id, &hdr, result);
        }
    }

    fn complete_send(&mut self, qp_id: u32, hdr: &SqWqeHeader, result: SendResult) {
        let Some(qp) = self.qps.get_mut(&qp_id) else {
            return;
        };
        let next = ((hdr.swq_idx as u32 + 1) % qp.sq_wqes) as u16;
        let ok = result.status == hsi::CQE_REQ_STATUS_OK;
        let signaled = hdr.flags & hsi::WQE_FLAG_SIGNAL_COMP != 0;
        if ok && !signaled {
            qp.unreported = Some(next);
            return;
        }
        qp.unreported = None;
        if !ok {
            warn!("Emulator: QP 0x{:x} send failed with 0x{:x}", qp_id, result.status);
            qp.state = QpState::Err;
        }
        let scq = qp.scq;
        if ok && qp.mark_phantom && qp.psn_table {
            qp.mark_phantom = false;
            let sq = qp.sq;
            self.mark_psn_entry(&sq, hdr.swq_idx as u32);
        }
        self.push_cqe(
            scq,
            HwCqe::Req {
                status: result.status,
                qp_id,
                sq_cons_idx: next,
            },
            !ok,
        );
    }

    fn mark_psn_entry(&self, sq: &Cursor, idx: u32) {
        let mut raw = [0u8; PSN_SEARCH_SIZE];
        if let Err(e) = sq.read_aux(&self.dma, idx, PSN_SEARCH_SIZE, &mut raw) {
            error!("Emulator: reading PSN entry {}: {}", idx, e);
            return;
        }
        let mut entry = PsnSearch::decode(&raw);
        entry.flags_next_psn |= PSN_SEARCH_PHANTOM_MARK;
        if let Err(e) = sq.write_aux(&self.dma, idx, PSN_SEARCH_SIZE, &entry.encode()) {
            error!("Emulator: writing PSN entry {}: {}", idx, e);
        }
        debug!("Emulator: PSN entry {} marked for a phantom fence", idx);
    }

    fn execute_send(&mut self, qp_id: u32, hdr: &SqWqeHeader, bytes: &[u8]) -> SendResult {
        let header_len = SQ_HDR_SLOTS as usize * SLOT_SIZE;
        let atomic = matches!(hdr.wqe_type, hsi::WQE_TYPE_ATOMIC_CS | hsi::WQE_TYPE_ATOMIC_FA);
        let payload_at = if atomic { header_len + SLOT_SIZE } else { header_len };

        let (data, local) = if hdr.flags & hsi::WQE_FLAG_INLINE != 0 {
            let end = (payload_at + hdr.length as usize).min(bytes.len());
            (bytes.get(payload_at..end).unwrap_or_default().to_vec(), Vec::new())
        } else {
            let sges = decode_sges(bytes, payload_at, hdr.num_sge as usize);
            let data = match hdr.wqe_type {
                hsi::WQE_TYPE_READ | hsi::WQE_TYPE_LOCAL_INV | hsi::WQE_TYPE_BIND => Vec::new(),
                _ => self.gather(&sges),
            };
            (data, sges)
        };

        match hdr.wqe_type {
            hsi::WQE_TYPE_SEND | hsi::WQE_TYPE_SEND_W_IMM | hsi::WQE_TYPE_SEND_W_INV => {
                self.deliver_send(qp_id, hdr, &data)
            }
            hsi::WQE_TYPE_WRITE | hsi::WQE_TYPE_WRITE_W_IMM => self.rdma_write(qp_id, hdr, &data),
            hsi::WQE_TYPE_READ => self.rdma_read(qp_id, hdr, &local),
            hsi::WQE_TYPE_ATOMIC_CS | hsi::WQE_TYPE_ATOMIC_FA => {
                let operand = bytes.get(header_len..header_len + SLOT_SIZE).unwrap_or_default();
                self.atomic(qp_id, hdr, operand, &local)
            }
            hsi::WQE_TYPE_LOCAL_INV | hsi::WQE_TYPE_BIND => SendResult::ok(),
            other => {
                warn!("Emulator: QP 0x{:x} posted unknown WQE type 0x{:x}", qp_id, other);
                SendResult::status(hsi::CQE_REQ_STATUS_LOCAL_QP_OPERATION)
            }
        }
    }

    /// Collect the bytes named by `sges`; unmapped addresses read as zeros
    fn gather(&self, sges: &[HwSge]) -> Vec<u8> {
        let mut data = Vec::new();
        for sge in sges {
            let mut chunk = vec![0u8; sge.size as usize];
            if self.dma.is_mapped(sge.addr, chunk.len()) && self.dma.read_bus(sge.addr, &mut chunk).is_err() {
                chunk.fill(0);
            }
            data.extend_from_slice(&chunk);
        }
        data
    }

    /// Spread `data` over `sges`, skipping unmapped addresses
    fn scatter(&self, sges: &[HwSge], data: &[u8]) {
        let mut rest = data;
        for sge in sges {
            if rest.is_empty() {
                break;
            }
            let n = rest.len().min(sge.size as usize);
            if self.dma.is_mapped(sge.addr, n) {
                if let Err(e) = self.dma.write_bus(sge.addr, &rest[..n]) {
                    warn!("Emulator: scatter to 0x{:x} failed: {}", sge.addr, e);
                }
            }
            rest = &rest[n..];
        }
    }

    /// RC peer of `qp_id` if it can take traffic
    fn connected_peer(&self, qp_id: u32) -> Option<u32> {
        let qp = self.qps.get(&qp_id)?;
        let peer_id = qp.attrs.dest_qp_id;
        let peer = self.qps.get(&peer_id)?;
        matches!(peer.state, QpState::Rtr | QpState::Rts | QpState::Sqd).then_some(peer_id)
    }

    fn deliver_send(&mut self, qp_id: u32, hdr: &SqWqeHeader, data: &[u8]) -> SendResult {
        let Some(sender) = self.qps.get(&qp_id) else {
            return SendResult::status(hsi::CQE_REQ_STATUS_LOCAL_QP_OPERATION);
        };
        let datagram = sender.qp_type.is_datagram();

        let dest_id = if datagram {
            let dest_id = hdr.ext_key;
            let ready = self.qps.get(&dest_id).is_some_and(|dest| {
                matches!(dest.state, QpState::Rtr | QpState::Rts | QpState::Sqd)
                    && dest.qp_type.is_datagram()
                    && (dest.qp_type == QpType::Gsi || dest.attrs.qkey == hdr.ext_va as u32)
            });
            if !ready {
                debug!("Emulator: datagram from QP 0x{:x} to 0x{:x} dropped", qp_id, dest_id);
                return SendResult::ok();
            }
            dest_id
        } else {
            match self.connected_peer(qp_id) {
                Some(peer) => peer,
                None => return SendResult::status(hsi::CQE_REQ_STATUS_TRANSPORT_RETRY_CNT),
            }
        };

        let Some(recv) = self.take_receive(dest_id) else {
            if datagram {
                debug!("Emulator: no receive posted on QP 0x{:x}, datagram dropped", dest_id);
                return SendResult::ok();
            }
            return SendResult::status(hsi::CQE_REQ_STATUS_RNR_NAK_RETRY_CNT);
        };

        let mut flags = if recv.from_srq { hsi::CQE_RES_FLAG_SRQ } else { 0 };
        let imm_or_inv = match hdr.wqe_type {
            hsi::WQE_TYPE_SEND_W_IMM => {
                flags |= hsi::CQE_RES_FLAG_IMM;
                hdr.key_immed
            }
            hsi::WQE_TYPE_SEND_W_INV => {
                flags |= hsi::CQE_RES_FLAG_INV;
                hdr.key_immed
            }
            _ => 0,
        };

        if data.len() as u64 > recv.capacity() {
            self.responder_error(dest_id, qp_id, &recv, flags, hsi::CQE_RES_STATUS_LOCAL_LENGTH);
            return if datagram {
                SendResult::ok()
            } else {
                SendResult::status(hsi::CQE_REQ_STATUS_REMOTE_INVALID_REQUEST)
            };
        }
        self.scatter(&recv.sges, data);
        let solicited = hdr.flags & hsi::WQE_FLAG_SOLICITED != 0;
        self.push_res(dest_id, qp_id, &recv, flags, data.len() as u32, imm_or_inv, solicited);
        SendResult::ok()
    }

    #[allow(clippy::too_many_arguments)]
    fn push_res(
        &mut self,
        dest_id: u32,
        src_qp: u32,
        recv: &Receive,
        flags: u16,
        length: u32,
        imm_or_inv: u32,
        solicited: bool,
    ) {
        let Some(dest) = self.qps.get(&dest_id) else {
            return;
        };
        let kind = match dest.qp_type {
            QpType::Rc => ResKind::Rc,
            QpType::Ud => ResKind::Ud,
            QpType::Gsi => ResKind::RawQp1,
        };
        let rcq = dest.rcq;
        self.push_cqe(
            rcq,
            HwCqe::Res {
                kind,
                status: hsi::CQE_RES_STATUS_OK,
                qp_id: dest_id,
                flags,
                length,
                imm_or_inv,
                wr_id_idx: recv.wr_id_idx,
                src_qp,
            },
            solicited,
        );
    }

    /// Fail the receive and move the responder to ERR
    fn responder_error(&mut self, dest_id: u32, src_qp: u32, recv: &Receive, flags: u16, status: u8) {
        let Some(dest) = self.qps.get_mut(&dest_id) else {
            return;
        };
        warn!("Emulator: QP 0x{:x} receive failed with 0x{:x}", dest_id, status);
        dest.state = QpState::Err;
        let kind = match dest.qp_type {
            QpType::Rc => ResKind::Rc,
            QpType::Ud => ResKind::Ud,
            QpType::Gsi => ResKind::RawQp1,
        };
        let rcq = dest.rcq;
        self.push_cqe(
            rcq,
            HwCqe::Res {
                kind,
                status,
                qp_id: dest_id,
                flags,
                length: 0,
                imm_or_inv: 0,
                wr_id_idx: recv.wr_id_idx,
                src_qp,
            },
            true,
        );
    }

    /// Take the oldest receive WQE of `qp_id` (from its SRQ if it has one)
    fn take_receive(&mut self, qp_id: u32) -> Option<Receive> {
        let qp = self.qps.get_mut(&qp_id)?;
        if let Some(srq_id) = qp.srq_id {
            return self.take_srq_receive(srq_id);
        }
        let rq = qp.rq.as_mut()?;
        if rq.pending_slots() == 0 {
            return None;
        }
        let (recv, next) = read_receive(&self.dma, rq.cursor, false)?;
        rq.cursor = next;
        Some(recv)
    }

    fn take_srq_receive(&mut self, srq_id: u32) -> Option<Receive> {
        let srq = self.srqs.get_mut(&srq_id)?;
        if srq.ring.pending_slots() < srq.slots_per_wqe {
            return None;
        }
        let (recv, next) = read_receive(&self.dma, srq.ring.cursor, true)?;
        srq.ring.cursor = next;

        let available = srq.ring.pending_slots() / srq.slots_per_wqe;
        if srq.armed && available < srq.limit {
            srq.armed = false;
            debug!("Emulator: SRQ 0x{:x} below limit {}", srq_id, srq.limit);
            self.push_creq(CreqEntry::FuncEvent {
                event: FUNC_EVENT_SRQ_LIMIT,
                data: srq_id,
            });
        }
        Some(recv)
    }

    /// Check `rkey` grants `need` over `len` bytes at `va`
    fn remote_access(&self, rkey: u32, va: u64, len: u64, need: Access) -> bool {
        let Some((base, length, access)) = self.keys.get(&rkey).and_then(|key| key.region) else {
            return false;
        };
        let end = va.checked_add(len);
        va >= base
            && end.is_some_and(|end| end <= base.saturating_add(length))
            && Access::from_bits_truncate(access).contains(need)
    }

    fn rdma_write(&mut self, qp_id: u32, hdr: &SqWqeHeader, data: &[u8]) -> SendResult {
        let Some(peer) = self.connected_peer(qp_id) else {
            return SendResult::status(hsi::CQE_REQ_STATUS_TRANSPORT_RETRY_CNT);
        };
        if !self.remote_access(hdr.ext_key, hdr.ext_va, data.len() as u64, Access::REMOTE_WRITE) {
            return SendResult::status(hsi::CQE_REQ_STATUS_REMOTE_ACCESS);
        }
        if hdr.wqe_type == hsi::WQE_TYPE_WRITE_W_IMM {
            let Some(recv) = self.take_receive(peer) else {
                return SendResult::status(hsi::CQE_REQ_STATUS_RNR_NAK_RETRY_CNT);
            };
            self.write_remote(hdr.ext_va, data);
            let mut flags = hsi::CQE_RES_FLAG_IMM | hsi::CQE_RES_FLAG_RDMA;
            if recv.from_srq {
                flags |= hsi::CQE_RES_FLAG_SRQ;
            }
            let solicited = hdr.flags & hsi::WQE_FLAG_SOLICITED != 0;
            self.push_res(peer, qp_id, &recv, flags, data.len() as u32, hdr.key_immed, solicited);
        } else {
            self.write_remote(hdr.ext_va, data);
        }
        SendResult::ok()
    }

    fn write_remote(&self, va: u64, data: &[u8]) {
        if self.dma.is_mapped(va, data.len()) {
            if let Err(e) = self.dma.write_bus(va, data) {
                warn!("Emulator: remote write to 0x{:x} failed: {}", va, e);
            }
        }
    }

    fn read_remote(&self, va: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        if self.dma.is_mapped(va, len) && self.dma.read_bus(va, &mut data).is_err() {
            data.fill(0);
        }
        data
    }

    fn rdma_read(&mut self, qp_id: u32, hdr: &SqWqeHeader, local: &[HwSge]) -> SendResult {
        if self.connected_peer(qp_id).is_none() {
            return SendResult::status(hsi::CQE_REQ_STATUS_TRANSPORT_RETRY_CNT);
        }
        let len = hdr.length as u64;
        if !self.remote_access(hdr.ext_key, hdr.ext_va, len, Access::REMOTE_READ) {
            return SendResult::status(hsi::CQE_REQ_STATUS_REMOTE_ACCESS);
        }
        let data = self.read_remote(hdr.ext_va, len as usize);
        self.scatter(local, &data);
        SendResult::ok()
    }

    fn atomic(&mut self, qp_id: u32, hdr: &SqWqeHeader, operand: &[u8], local: &[HwSge]) -> SendResult {
        if self.connected_peer(qp_id).is_none() {
            return SendResult::status(hsi::CQE_REQ_STATUS_TRANSPORT_RETRY_CNT);
        }
        if hdr.ext_va % 8 != 0 || !self.remote_access(hdr.ext_key, hdr.ext_va, 8, Access::REMOTE_ATOMIC) {
            return SendResult::status(hsi::CQE_REQ_STATUS_REMOTE_ACCESS);
        }
        let mut r = hsi::WireReader::new(operand);
        let first = r.u64();
        let second = r.u64();

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.read_remote(hdr.ext_va, 8));
        let old = u64::from_le_bytes(raw);
        let new = match hdr.wqe_type {
            hsi::WQE_TYPE_ATOMIC_CS if old == second => first,
            hsi::WQE_TYPE_ATOMIC_CS => old,
            _ => old.wrapping_add(first),
        };
        self.write_remote(hdr.ext_va, &new.to_le_bytes());
        self.scatter(local, &old.to_le_bytes());
        SendResult::ok()
    }
}

/// Read the receive WQE at `cursor`; returns it and the advanced cursor
fn read_receive(dma: &crate::dma::HostDma, cursor: Cursor, from_srq: bool) -> Option<(Receive, Cursor)> {
    let mut raw = [0u8; SLOT_SIZE];
    if let Err(e) = cursor.read(dma, 0, &mut raw) {
        error!("Emulator: reading receive WQE: {}", e);
        return None;
    }
    let hdr = RqWqeHeader::decode(&raw);
    let slots = (hdr.wqe_slots as u32).max(1);
    let bytes = match cursor.read_slots(dma, slots) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Emulator: reading receive WQE: {}", e);
            return None;
        }
    };
    let mut next = cursor;
    next.advance(slots);
    Some((
        Receive {
            wr_id_idx: hdr.wr_id_idx,
            sges: decode_sges(&bytes, SLOT_SIZE, hdr.num_sge as usize),
            from_srq,
        },
        next,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sges_stops_at_count() {
        let mut bytes = vec![0u8; SLOT_SIZE];
        bytes.extend_from_slice(
            &HwSge {
                addr: 0x1000,
                lkey: 3,
                size: 64,
            }
            .encode(),
        );
        bytes.extend_from_slice(&[0xff; SLOT_SIZE]);
        let sges = decode_sges(&bytes, SLOT_SIZE, 1);
        assert_eq!(sges.len(), 1);
        assert_eq!(sges[0].size, 64);
        assert!(decode_sges(&bytes, 10 * SLOT_SIZE, 4).is_empty());
    }
}
