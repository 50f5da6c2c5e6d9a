//! qpctl: drive the queue-pair library against the software adapter
//!
//! Opens one device on top of the emulator and runs three scenarios:
//! an RC loopback, an error flush and a burst of concurrent commands.
//! Prints a JSON summary on stdout.

use anyhow::{bail, Context, Result};
use crossbeam_channel::unbounded;
use log::{info, warn};
use qplib::{
    Access, CompletionQueue, Cqe, CqeStatus, Device, DmaAllocator, Emulator, ModifyMask, Payload, QpAttrs,
    QpInitAttrs, QpState, QplibConfig, QueuePair, RecvWqe, SendOp, SendWqe, Sge,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Tool configuration, read from an optional JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct CtlConfig {
    qplib: QplibConfig,
    /// Deliver firmware responses by interrupt instead of self-polling
    interrupts: bool,
    loopback_sends: u32,
    message_len: u32,
    flush_depth: u32,
    burst_threads: usize,
    burst_per_thread: usize,
    poll_timeout_ms: u64,
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            qplib: QplibConfig::new(),
            interrupts: true,
            loopback_sends: 64,
            message_len: 256,
            flush_depth: 16,
            burst_threads: 4,
            burst_per_thread: 32,
            poll_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct LoopbackReport {
    sends: u32,
    send_completions: usize,
    recv_completions: usize,
    bytes_received: u64,
    in_order: bool,
    payload_intact: bool,
    elapsed_us: u128,
}

#[derive(Debug, Default, Serialize)]
struct FlushReport {
    posted_send: u32,
    posted_recv: u32,
    flushed_send: usize,
    flushed_recv: usize,
    in_order: bool,
}

#[derive(Debug, Default, Serialize)]
struct BurstReport {
    threads: usize,
    commands: usize,
    succeeded: usize,
    failed: usize,
    elapsed_us: u128,
}

#[derive(Debug, Serialize)]
struct Summary {
    fw_version: String,
    max_qp: u32,
    loopback: LoopbackReport,
    flush: FlushReport,
    burst: BurstReport,
    firmware_commands: u64,
    wqes_executed: u64,
}

fn load_config(path: Option<&str>) -> Result<CtlConfig> {
    let Some(path) = path else {
        return Ok(CtlConfig::default());
    };
    let text =
        std::fs::read_to_string(Path::new(path)).with_context(|| format!("Failed to read config {}", path))?;
    let config: CtlConfig = serde_json::from_str(&text).with_context(|| format!("Failed to parse config {}", path))?;
    info!("Loaded config from {}", path);
    Ok(config)
}

/// Walks one RC QP from RESET to RTS, pointed at `dest_qp_id`
fn bring_up(qp: &Arc<QueuePair>, dest_qp_id: u32) -> Result<()> {
    let access = Access::LOCAL_WRITE | Access::REMOTE_READ | Access::REMOTE_WRITE;
    let init = QpAttrs {
        state: QpState::Init,
        pkey: 0xffff,
        access: access.bits(),
        ..Default::default()
    };
    qp.modify(ModifyMask::STATE | ModifyMask::PKEY | ModifyMask::ACCESS, &init)
        .context("RESET->INIT")?;

    let rtr = QpAttrs {
        state: QpState::Rtr,
        dest_qp_id,
        rq_psn: 0,
        path_mtu: 1024,
        ..Default::default()
    };
    qp.modify(
        ModifyMask::STATE | ModifyMask::DEST_QP_ID | ModifyMask::RQ_PSN | ModifyMask::PATH_MTU,
        &rtr,
    )
    .context("INIT->RTR")?;
    Ok(())
}

fn to_rts(qp: &Arc<QueuePair>) -> Result<()> {
    let rts = QpAttrs {
        state: QpState::Rts,
        sq_psn: 0,
        timeout: 14,
        retry_cnt: 7,
        rnr_retry: 7,
        ..Default::default()
    };
    qp.modify(
        ModifyMask::STATE | ModifyMask::SQ_PSN | ModifyMask::TIMEOUT | ModifyMask::RETRY_CNT | ModifyMask::RNR_RETRY,
        &rts,
    )
    .context("RTR->RTS")?;
    Ok(())
}

fn connect(a: &Arc<QueuePair>, b: &Arc<QueuePair>) -> Result<()> {
    bring_up(a, b.id())?;
    bring_up(b, a.id())?;
    to_rts(a)?;
    to_rts(b)
}

/// Polls `cq` until `count` completions arrived or the timeout expires
fn collect(dev: &Device, emu: &Emulator, cq: &CompletionQueue, count: usize, timeout: Duration) -> Vec<Cqe> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(count);
    while out.len() < count && Instant::now() < deadline {
        emu.quiesce();
        let batch = dev.poll_cq(cq, count - out.len());
        if batch.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        out.extend(batch);
    }
    out
}

fn run_loopback(dev: &Device, emu: &Emulator, config: &CtlConfig) -> Result<LoopbackReport> {
    info!("=== Loopback: {} sends of {} bytes ===", config.loopback_sends, config.message_len);
    let depth = config.loopback_sends.max(1);
    let len = config.message_len.max(1);
    let dma = emu.dma();

    let cq_a = dev.create_cq(depth * 2)?;
    let cq_b = dev.create_cq(depth * 2)?;
    let a = dev.create_qp(QpInitAttrs::rc(&cq_a, &cq_a, depth))?;
    let b = dev.create_qp(QpInitAttrs::rc(&cq_b, &cq_b, depth))?;
    connect(&a, &b)?;

    let mut sinks = Vec::with_capacity(depth as usize);
    for wr_id in 0..u64::from(depth) {
        let buf = dma.alloc(len as usize)?;
        b.post_recv(&RecvWqe::new(wr_id, vec![Sge::new(buf.bus_addr(), 0, len)]))?;
        sinks.push(buf);
    }
    b.post_recv_db();

    let source = dma.alloc(len as usize)?;
    let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    source.write(0, &pattern)?;

    let started = Instant::now();
    for wr_id in 0..u64::from(depth) {
        let wqe = SendWqe::new(wr_id, SendOp::Send, Payload::Sges(vec![Sge::new(source.bus_addr(), 0, len)]))
            .signaled();
        a.post_send(&wqe)?;
    }
    a.post_send_db();

    let timeout = Duration::from_millis(config.poll_timeout_ms);
    let sent = collect(dev, emu, &cq_a, depth as usize, timeout);
    let received = collect(dev, emu, &cq_b, depth as usize, timeout);
    let elapsed = started.elapsed();

    let in_order = sent.iter().map(|c| c.wr_id).eq(0..sent.len() as u64)
        && received.iter().map(|c| c.wr_id).eq(0..received.len() as u64);
    if let Some(bad) = sent.iter().chain(&received).find(|c| c.status != CqeStatus::Success) {
        warn!("Completion {} on QP {} failed: {:?}", bad.wr_id, bad.qp_id, bad.status);
    }

    let mut payload_intact = true;
    let mut scratch = vec![0u8; len as usize];
    for cqe in &received {
        let Some(sink) = sinks.get(cqe.wr_id as usize) else {
            payload_intact = false;
            continue;
        };
        sink.read(0, &mut scratch)?;
        payload_intact &= scratch == pattern;
    }

    let report = LoopbackReport {
        sends: depth,
        send_completions: sent.len(),
        recv_completions: received.len(),
        bytes_received: received.iter().map(|c| u64::from(c.length)).sum(),
        in_order,
        payload_intact,
        elapsed_us: elapsed.as_micros(),
    };
    info!(
        "Loopback done: {}/{} sends, {}/{} receives in {:?}",
        report.send_completions, depth, report.recv_completions, depth, elapsed
    );

    dev.destroy_qp(&a)?;
    dev.destroy_qp(&b)?;
    dev.destroy_cq(&cq_a)?;
    dev.destroy_cq(&cq_b)?;
    Ok(report)
}

fn run_flush(dev: &Device, emu: &Emulator, config: &CtlConfig) -> Result<FlushReport> {
    let depth = config.flush_depth.max(1);
    info!("=== Error flush: {} sends, {} receives ===", depth, depth / 2);
    let dma = emu.dma();

    let scq = dev.create_cq(depth * 2)?;
    let rcq = dev.create_cq(depth * 2)?;
    let peer_cq = dev.create_cq(depth * 2)?;
    let qp = dev.create_qp(QpInitAttrs::rc(&scq, &rcq, depth))?;
    let peer = dev.create_qp(QpInitAttrs::rc(&peer_cq, &peer_cq, depth))?;
    connect(&qp, &peer)?;

    // Nothing is rung: every WQE is still outstanding when the QP errors
    let buf = dma.alloc(64)?;
    for wr_id in 0..u64::from(depth) {
        let wqe = SendWqe::new(wr_id, SendOp::Send, Payload::Sges(vec![Sge::new(buf.bus_addr(), 0, 32)]));
        qp.post_send(&wqe)?;
    }
    let recvs = depth / 2;
    for wr_id in 0..u64::from(recvs) {
        qp.post_recv(&RecvWqe::new(1_000 + wr_id, vec![Sge::new(buf.bus_addr(), 0, 64)]))?;
    }

    let err = QpAttrs {
        state: QpState::Err,
        ..Default::default()
    };
    qp.modify(ModifyMask::STATE, &err).context("RTS->ERR")?;

    let timeout = Duration::from_millis(config.poll_timeout_ms);
    let sent = collect(dev, emu, &scq, depth as usize, timeout);
    let received = collect(dev, emu, &rcq, recvs as usize, timeout);

    let report = FlushReport {
        posted_send: depth,
        posted_recv: recvs,
        flushed_send: sent.iter().filter(|c| c.status == CqeStatus::Flushed).count(),
        flushed_recv: received.iter().filter(|c| c.status == CqeStatus::Flushed).count(),
        in_order: sent.iter().map(|c| c.wr_id).eq(0..u64::from(depth))
            && received.iter().map(|c| c.wr_id).eq(1_000..1_000 + u64::from(recvs)),
    };
    info!("Flushed {} sends and {} receives", report.flushed_send, report.flushed_recv);

    dev.destroy_qp(&qp)?;
    dev.destroy_qp(&peer)?;
    for cq in [&scq, &rcq, &peer_cq] {
        dev.destroy_cq(cq)?;
    }
    Ok(report)
}

/// Several threads creating and destroying CQs at once; responses come back
/// in whatever order the firmware finishes them
fn run_burst(dev: &Device, config: &CtlConfig) -> BurstReport {
    let threads = config.burst_threads.max(1);
    let per_thread = config.burst_per_thread.max(1);
    info!("=== Command burst: {} threads x {} ===", threads, per_thread);

    let (tx, rx) = unbounded::<std::result::Result<(), qplib::QplibError>>();
    let started = Instant::now();
    thread::scope(|s| {
        for _ in 0..threads {
            let tx = tx.clone();
            s.spawn(move || {
                for _ in 0..per_thread {
                    let outcome = dev.create_cq(16).and_then(|cq| dev.destroy_cq(&cq));
                    if tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut report = BurstReport {
        threads,
        elapsed_us: started.elapsed().as_micros(),
        ..Default::default()
    };
    for outcome in rx.iter() {
        report.commands += 2;
        match outcome {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                warn!("Burst command failed: {}", e);
                report.failed += 1;
            }
        }
    }
    info!(
        "Burst done: {} ok, {} failed, {} outstanding",
        report.succeeded,
        report.failed,
        dev.control_channel().outstanding()
    );
    report
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 2 {
        bail!("usage: {} [config.json]", args[0]);
    }
    let config = load_config(args.get(1).map(String::as_str))?;

    info!("qpctl starting");
    let emu = Emulator::new().context("Failed to start adapter emulator")?;
    let dev = Device::open(config.qplib.clone(), emu.collaborators(config.interrupts))
        .context("Failed to open device")?;
    info!("Firmware {} up, {} QPs available", dev.attributes().fw_version_string(), dev.attributes().max_qp);

    let loopback = run_loopback(&dev, &emu, &config).context("Loopback scenario failed")?;
    let flush = run_flush(&dev, &emu, &config).context("Error flush scenario failed")?;
    let burst = run_burst(&dev, &config);

    let summary = Summary {
        fw_version: dev.attributes().fw_version_string(),
        max_qp: dev.attributes().max_qp,
        loopback,
        flush,
        burst,
        firmware_commands: emu.commands_executed(),
        wqes_executed: emu.wqes_executed(),
    };

    // Firmware teardown needs the emulator alive
    dev.shutdown();
    drop(dev);
    drop(emu);

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CtlConfig {
        CtlConfig {
            loopback_sends: 8,
            message_len: 64,
            flush_depth: 6,
            burst_threads: 2,
            burst_per_thread: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: CtlConfig = serde_json::from_str(r#"{"loopback_sends": 3}"#).unwrap();
        assert_eq!(config.loopback_sends, 3);
        assert_eq!(config.message_len, 256);
        assert!(config.interrupts);
    }

    #[test]
    fn test_scenarios_against_emulator() {
        let config = small_config();
        let emu = Emulator::new().unwrap();
        let dev = Device::open(config.qplib.clone(), emu.collaborators(true)).unwrap();

        let loopback = run_loopback(&dev, &emu, &config).unwrap();
        assert_eq!(loopback.send_completions, 8);
        assert_eq!(loopback.recv_completions, 8);
        assert_eq!(loopback.bytes_received, 8 * 64);
        assert!(loopback.in_order && loopback.payload_intact);

        let flush = run_flush(&dev, &emu, &config).unwrap();
        assert_eq!(flush.flushed_send, 6);
        assert_eq!(flush.flushed_recv, 3);
        assert!(flush.in_order);

        let burst = run_burst(&dev, &config);
        assert_eq!(burst.succeeded, 8);
        assert_eq!(burst.failed, 0);
        dev.shutdown();
    }
}
