//! Error transitions, flush lists and terminal records

mod common;

use common::{connect, rig, to_error};
use parking_lot::Mutex;
use qplib::emulator::CQ_ERROR_OVERFLOW;
use qplib::hsi::{HwCqe, CQE_CONS_NONE, CQE_REQ_STATUS_OK};
use qplib::{AsyncEvent, CqeOpcode, CqeStatus, Payload, QpState, RecvWqe, SendOp, SendWqe, Sge};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn send(wr_id: u64, addr: u64) -> SendWqe {
    SendWqe::new(wr_id, SendOp::Send, Payload::Sges(vec![Sge::new(addr, 0, 8)]))
}

#[test]
fn test_error_flushes_outstanding_in_order() {
    let rig = rig();
    let scq = rig.dev.create_cq(32).unwrap();
    let rcq = rig.dev.create_cq(32).unwrap();
    let peer_cq = rig.dev.create_cq(32).unwrap();
    let qp = rig.dev.create_qp(qplib::QpInitAttrs::rc(&scq, &rcq, 16)).unwrap();
    let peer = rig.dev.create_qp(qplib::QpInitAttrs::rc(&peer_cq, &peer_cq, 16)).unwrap();
    connect(&qp, &peer);

    // Posted but never rung: the adapter has not seen any of them
    let buf = rig.buffer(64);
    for wr_id in 0..8u64 {
        let wqe = send(wr_id, buf.bus_addr());
        let wqe = if wr_id >= 5 { wqe.signaled() } else { wqe };
        qp.post_send(&wqe).unwrap();
    }
    for wr_id in 100..103u64 {
        qp.post_recv(&RecvWqe::new(wr_id, vec![Sge::new(buf.bus_addr(), 0, 64)]))
            .unwrap();
    }

    to_error(&qp);
    assert_eq!(qp.state(), QpState::Err);
    assert_eq!(scq.flush_list_len(), (1, 0));
    assert_eq!(rcq.flush_list_len(), (0, 1));

    let sent = rig.dev.poll_cq(&scq, 32);
    assert_eq!(sent.iter().map(|c| c.wr_id).collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
    assert!(sent.iter().all(|c| c.status == CqeStatus::Flushed && c.opcode == CqeOpcode::Req));

    let received = rig.dev.poll_cq(&rcq, 2);
    assert_eq!(received.iter().map(|c| c.wr_id).collect::<Vec<_>>(), vec![100, 101]);
    let rest = rig.dev.poll_cq(&rcq, 32);
    assert_eq!(rest.len(), 1);
    assert_eq!((rest[0].wr_id, rest[0].opcode), (102, CqeOpcode::RecvRc));
    assert!(rig.dev.poll_cq(&rcq, 32).is_empty());
}

#[test]
fn test_post_after_error_notifies_and_flushes() {
    let rig = rig();
    let (cq_a, a, _cq_b, b) = rig.rc_pair(8);
    connect(&a, &b);
    to_error(&a);
    assert!(rig.dev.poll_cq(&cq_a, 8).is_empty());

    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    cq_a.set_handler(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let buf = rig.buffer(16);
    a.post_send(&send(42, buf.bus_addr()).signaled()).unwrap();
    rig.dev.drain_deferred();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(cq_a.notifications(), 1);

    let cqes = rig.dev.poll_cq(&cq_a, 8);
    assert_eq!(cqes.len(), 1);
    assert_eq!((cqes[0].wr_id, cqes[0].status), (42, CqeStatus::Flushed));
}

#[test]
fn test_terminal_record_reports_up_to_index() {
    let rig = rig();
    let (cq_a, a, _cq_b, b) = rig.rc_pair(8);
    connect(&a, &b);

    let buf = rig.buffer(16);
    a.post_send(&send(0, buf.bus_addr())).unwrap();
    a.post_send(&send(1, buf.bus_addr())).unwrap();
    a.post_send(&send(2, buf.bus_addr()).signaled()).unwrap();
    a.post_send(&send(3, buf.bus_addr())).unwrap();

    rig.emu.inject_cqe(
        cq_a.id(),
        HwCqe::Terminal {
            status: CQE_REQ_STATUS_OK,
            qp_id: a.id(),
            sq_cons_idx: 3,
            rq_cons_idx: CQE_CONS_NONE,
        },
    );

    let cqes = rig.dev.poll_cq(&cq_a, 8);
    assert_eq!(cqes.len(), 2);
    assert_eq!((cqes[0].wr_id, cqes[0].status), (2, CqeStatus::Success));
    assert_eq!((cqes[1].wr_id, cqes[1].status), (3, CqeStatus::Flushed));
    assert_eq!(a.state(), QpState::Err);
}

#[test]
fn test_error_event_flushes_executed_sends() {
    let rig = rig();
    let (cq_a, a, cq_b, b) = rig.rc_pair(8);
    connect(&a, &b);
    let _bufs = rig.post_receives(&b, 0, 2, 64);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    rig.dev.set_event_handler(Arc::new(move |event| sink.lock().push(event)));

    // Executed by the adapter but unsignaled, so nothing lands in the CQ
    let buf = rig.buffer(16);
    a.post_send(&send(0, buf.bus_addr())).unwrap();
    a.post_send(&send(1, buf.bus_addr())).unwrap();
    a.post_send_db();
    rig.emu.quiesce();
    assert_eq!(rig.emu.wqes_executed(), 2);
    assert_eq!(a.sq_outstanding(), 2);

    rig.emu.raise_qp_error(a.id(), 0x5, 0);
    assert_eq!(a.state(), QpState::Err);
    assert_eq!(rig.emu.qp_state(a.id()), Some(QpState::Err));
    assert_eq!(
        events.lock().as_slice(),
        &[AsyncEvent::QpError {
            xid: a.id(),
            req_err: 0x5,
            res_err: 0
        }]
    );
    assert!(cq_a.notifications() >= 1);

    // The QP is already flushing when the terminal record is polled, so the
    // record is skipped and the flush list reports both WQEs
    let cqes = rig.dev.poll_cq(&cq_a, 8);
    assert_eq!(cqes.iter().map(|c| c.wr_id).collect::<Vec<_>>(), vec![0, 1]);
    assert!(cqes.iter().all(|c| c.status == CqeStatus::Flushed));
    assert_eq!(a.sq_outstanding(), 0);
    assert_eq!(rig.poll_n(&cq_b, 2).len(), 2);
}

#[test]
fn test_reset_leaves_flush_lists() {
    let rig = rig();
    let (cq_a, a, _cq_b, b) = rig.rc_pair(8);
    connect(&a, &b);
    let buf = rig.buffer(16);
    a.post_send(&send(0, buf.bus_addr()).signaled()).unwrap();
    to_error(&a);
    assert_eq!(cq_a.flush_list_len(), (1, 1));

    let attrs = qplib::QpAttrs {
        state: QpState::Reset,
        ..Default::default()
    };
    a.modify(qplib::ModifyMask::STATE, &attrs).unwrap();
    assert_eq!(a.state(), QpState::Reset);
    assert_eq!(cq_a.flush_list_len(), (0, 0));
    assert_eq!(a.sq_outstanding(), 0);
    assert!(rig.dev.poll_cq(&cq_a, 8).is_empty());
}

#[test]
fn test_destroy_while_flushing() {
    let rig = rig();
    let (cq_a, a, _cq_b, b) = rig.rc_pair(8);
    connect(&a, &b);
    let buf = rig.buffer(16);
    a.post_send(&send(0, buf.bus_addr()).signaled()).unwrap();
    to_error(&a);
    rig.dev.destroy_qp(&a).unwrap();
    assert_eq!(cq_a.flush_list_len(), (0, 0));
    assert!(rig.dev.poll_cq(&cq_a, 8).is_empty());
}

#[test]
fn test_cq_error_event_reaches_its_cq() {
    let rig = rig();
    let cq = rig.dev.create_cq(16).unwrap();
    let bystander = rig.dev.create_cq(16).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    rig.dev.set_event_handler(Arc::new(move |event| sink.lock().push(event)));
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    cq.set_handler(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    rig.emu.raise_cq_error(cq.id(), CQ_ERROR_OVERFLOW);
    assert!(cq.is_errored());
    assert_eq!(cq.notifications(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!bystander.is_errored());
    assert_eq!(bystander.notifications(), 0);

    // Unknown ids touch no CQ but still reach the event handler
    rig.emu.raise_cq_error(0x3ff, CQ_ERROR_OVERFLOW);
    assert_eq!(cq.notifications(), 1);
    assert_eq!(
        events.lock().as_slice(),
        &[
            AsyncEvent::CqError {
                xid: cq.id(),
                reason: CQ_ERROR_OVERFLOW
            },
            AsyncEvent::CqError {
                xid: 0x3ff,
                reason: CQ_ERROR_OVERFLOW
            }
        ]
    );
}
