//! Shared fixtures: a device opened against the adapter emulator

#![allow(dead_code)]

use qplib::{
    Access, CompletionQueue, Cqe, Device, DmaAllocator, DmaBlock, Emulator, ModifyMask, QpAttrs, QpInitAttrs,
    QpState, QplibConfig, QueuePair, RecvWqe, Sge,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Device plus the emulator behind it. The device is declared first so it
/// shuts down (and deinitializes firmware) while the emulator still runs.
pub struct Rig {
    pub dev: Device,
    pub emu: Emulator,
}

pub fn config() -> QplibConfig {
    let mut config = QplibConfig::new();
    config.rcfw.cmd_timeout_ms = 2_000;
    config
}

/// Config for tests that expect commands to time out
pub fn short_timeout_config() -> QplibConfig {
    let mut config = QplibConfig::new();
    config.rcfw.cmd_timeout_ms = 200;
    config.rcfw.nudge_interval_ms = 20;
    config
}

pub fn open(config: QplibConfig, interrupts: bool) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let emu = Emulator::new().unwrap();
    let dev = Device::open(config, emu.collaborators(interrupts)).unwrap();
    Rig { dev, emu }
}

pub fn rig() -> Rig {
    open(config(), true)
}

impl Rig {
    /// Poll until `count` completions arrived or two seconds passed
    pub fn poll_n(&self, cq: &CompletionQueue, count: usize) -> Vec<Cqe> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < count && Instant::now() < deadline {
            self.emu.quiesce();
            let batch = self.dev.poll_cq(cq, count - out.len());
            if batch.is_empty() {
                std::thread::sleep(Duration::from_millis(2));
            }
            out.extend(batch);
        }
        out
    }

    /// Zeroed buffer the emulated adapter can reach
    pub fn buffer(&self, len: usize) -> DmaBlock {
        self.emu.dma().alloc(len).unwrap()
    }

    pub fn rc_pair(&self, depth: u32) -> (Arc<CompletionQueue>, Arc<QueuePair>, Arc<CompletionQueue>, Arc<QueuePair>) {
        let cq_a = self.dev.create_cq(64).unwrap();
        let cq_b = self.dev.create_cq(64).unwrap();
        let a = self.dev.create_qp(QpInitAttrs::rc(&cq_a, &cq_a, depth)).unwrap();
        let b = self.dev.create_qp(QpInitAttrs::rc(&cq_b, &cq_b, depth)).unwrap();
        (cq_a, a, cq_b, b)
    }

    /// Post `n` receives of `len` bytes each on `qp`, wr_ids starting at `first`
    pub fn post_receives(&self, qp: &QueuePair, first: u64, n: u64, len: u32) -> Vec<DmaBlock> {
        let mut bufs = Vec::new();
        for wr_id in first..first + n {
            let buf = self.buffer(len as usize);
            qp.post_recv(&RecvWqe::new(wr_id, vec![Sge::new(buf.bus_addr(), 0, len)]))
                .unwrap();
            bufs.push(buf);
        }
        qp.post_recv_db();
        bufs
    }

    /// Register a buffer for remote access
    pub fn remote_buffer(&self, len: usize) -> (DmaBlock, qplib::MemoryRegion) {
        let buf = self.buffer(len);
        let mr = self
            .dev
            .register_mr(
                0,
                buf.bus_addr(),
                len as u64,
                Access::LOCAL_WRITE | Access::REMOTE_READ | Access::REMOTE_WRITE | Access::REMOTE_ATOMIC,
            )
            .unwrap();
        (buf, mr)
    }
}

pub fn to_init(qp: &Arc<QueuePair>) {
    let attrs = QpAttrs {
        state: QpState::Init,
        pkey: 0xffff,
        access: (Access::LOCAL_WRITE | Access::REMOTE_READ | Access::REMOTE_WRITE | Access::REMOTE_ATOMIC).bits(),
        ..Default::default()
    };
    qp.modify(ModifyMask::STATE | ModifyMask::PKEY | ModifyMask::ACCESS, &attrs)
        .unwrap();
}

pub fn to_rtr(qp: &Arc<QueuePair>, dest_qp_id: u32) {
    let attrs = QpAttrs {
        state: QpState::Rtr,
        dest_qp_id,
        rq_psn: 0x100,
        path_mtu: 1024,
        ..Default::default()
    };
    qp.modify(
        ModifyMask::STATE | ModifyMask::DEST_QP_ID | ModifyMask::RQ_PSN | ModifyMask::PATH_MTU,
        &attrs,
    )
    .unwrap();
}

pub fn to_rts(qp: &Arc<QueuePair>) {
    let attrs = QpAttrs {
        state: QpState::Rts,
        sq_psn: 0x100,
        timeout: 14,
        retry_cnt: 7,
        rnr_retry: 7,
        ..Default::default()
    };
    qp.modify(
        ModifyMask::STATE | ModifyMask::SQ_PSN | ModifyMask::TIMEOUT | ModifyMask::RETRY_CNT | ModifyMask::RNR_RETRY,
        &attrs,
    )
    .unwrap();
}

pub fn to_error(qp: &Arc<QueuePair>) {
    let attrs = QpAttrs {
        state: QpState::Err,
        ..Default::default()
    };
    qp.modify(ModifyMask::STATE, &attrs).unwrap();
}

/// Bring both RC QPs to RTS, each pointing at the other
pub fn connect(a: &Arc<QueuePair>, b: &Arc<QueuePair>) {
    to_init(a);
    to_init(b);
    to_rtr(a, b.id());
    to_rtr(b, a.id());
    to_rts(a);
    to_rts(b);
}
