//! Resource life cycles: create, resize, destroy

mod common;

use common::{connect, rig, to_init};
use parking_lot::Mutex;
use qplib::emulator::FW_STATUS_BUSY;
use qplib::hsi::{CQE_RES_FLAG_SRQ, FUNC_EVENT_SRQ_LIMIT};
use qplib::{
    Access, AsyncEvent, CqeStatus, Opcode, Payload, QpInitAttrs, QpState, QplibError, RecvWqe, SendOp, SendWqe,
    Sge, SrqInitAttrs,
};
use std::sync::Arc;

#[test]
fn test_destroy_twice_is_refused() {
    let rig = rig();
    let cq = rig.dev.create_cq(16).unwrap();
    let qp = rig.dev.create_qp(QpInitAttrs::rc(&cq, &cq, 4)).unwrap();
    let id = qp.id();

    rig.dev.destroy_qp(&qp).unwrap();
    assert_eq!(rig.dev.destroy_qp(&qp), Err(QplibError::AlreadyDestroyed(id)));
    assert!(rig.dev.lookup_qp(id).is_none());

    rig.dev.destroy_cq(&cq).unwrap();
    assert_eq!(rig.dev.destroy_cq(&cq), Err(QplibError::AlreadyDestroyed(cq.id())));
}

#[test]
fn test_cq_in_use_cannot_be_destroyed() {
    let rig = rig();
    let cq = rig.dev.create_cq(16).unwrap();
    let qp = rig.dev.create_qp(QpInitAttrs::rc(&cq, &cq, 4)).unwrap();

    assert_eq!(
        rig.dev.destroy_cq(&cq),
        Err(QplibError::Firmware {
            opcode: Opcode::DestroyCq,
            status: FW_STATUS_BUSY
        })
    );
    // Still registered, still usable
    assert!(rig.dev.lookup_cq(cq.id()).is_some());
    assert!(!cq.is_destroyed());

    rig.dev.destroy_qp(&qp).unwrap();
    rig.dev.destroy_cq(&cq).unwrap();
    assert!(rig.dev.lookup_cq(cq.id()).is_none());
}

#[test]
fn test_qp_query_reflects_modify() {
    let rig = rig();
    let (_cq_a, a, _cq_b, b) = rig.rc_pair(4);
    to_init(&a);
    let attrs = a.query().unwrap();
    assert_eq!(attrs.state, QpState::Init);
    assert_eq!(attrs.pkey, 0xffff);

    common::to_rtr(&a, b.id());
    let attrs = a.query().unwrap();
    assert_eq!(attrs.state, QpState::Rtr);
    assert_eq!(attrs.dest_qp_id, b.id());
    assert_eq!(attrs.path_mtu, 1024);
}

#[test]
fn test_invalid_transition_is_refused() {
    let rig = rig();
    let cq = rig.dev.create_cq(16).unwrap();
    let qp = rig.dev.create_qp(QpInitAttrs::rc(&cq, &cq, 4)).unwrap();
    let attrs = qplib::QpAttrs {
        state: QpState::Rts,
        ..Default::default()
    };
    let err = qp.modify(qplib::ModifyMask::STATE, &attrs).unwrap_err();
    assert!(matches!(err, QplibError::Firmware { opcode: Opcode::ModifyQp, .. }));
    assert_eq!(qp.state(), QpState::Reset);
}

#[test]
fn test_cq_resize_switches_at_cutoff() {
    let rig = rig();
    let cq_a = rig.dev.create_cq(16).unwrap();
    let cq_b = rig.dev.create_cq(64).unwrap();
    let a = rig.dev.create_qp(QpInitAttrs::rc(&cq_a, &cq_a, 16)).unwrap();
    let b = rig.dev.create_qp(QpInitAttrs::rc(&cq_b, &cq_b, 16)).unwrap();
    connect(&a, &b);
    let _bufs = rig.post_receives(&b, 0, 8, 32);
    let src = rig.buffer(32);
    let post = |wr_id: u64| {
        let wqe = SendWqe::new(wr_id, SendOp::Send, Payload::Sges(vec![Sge::new(src.bus_addr(), 0, 8)])).signaled();
        a.post_send(&wqe).unwrap();
        a.post_send_db();
    };

    for wr_id in 0..4 {
        post(wr_id);
    }
    // Two stay behind in the old ring
    assert_eq!(rig.poll_n(&cq_a, 2).len(), 2);

    rig.dev.resize_cq(&cq_a, 64).unwrap();
    assert!(cq_a.resize_in_progress());
    assert!(matches!(rig.dev.resize_cq(&cq_a, 128), Err(QplibError::Busy(_))));

    for wr_id in 4..7 {
        post(wr_id);
    }
    let cqes = rig.poll_n(&cq_a, 5);
    assert_eq!(cqes.iter().map(|c| c.wr_id).collect::<Vec<_>>(), vec![2, 3, 4, 5, 6]);
    assert!(!cq_a.resize_in_progress());
    assert_eq!(cq_a.depth(), 64);
}

#[test]
fn test_srq_receives_and_limit_event() {
    let rig = rig();
    let cq_a = rig.dev.create_cq(32).unwrap();
    let cq_b = rig.dev.create_cq(32).unwrap();
    let srq = rig.dev.create_srq(SrqInitAttrs::new(16, 1)).unwrap();
    let a = rig.dev.create_qp(QpInitAttrs::rc(&cq_a, &cq_a, 8)).unwrap();
    let b = rig
        .dev
        .create_qp(QpInitAttrs {
            srq: Some(Arc::clone(&srq)),
            max_recv_wr: 0,
            ..QpInitAttrs::rc(&cq_b, &cq_b, 8)
        })
        .unwrap();
    connect(&a, &b);
    assert!(b.post_recv(&RecvWqe::new(1, vec![])).is_err());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    rig.dev.set_event_handler(Arc::new(move |event| sink.lock().push(event)));

    let bufs: Vec<_> = (0..4).map(|_| rig.buffer(32)).collect();
    for (i, buf) in bufs.iter().enumerate() {
        srq.post_recv(&RecvWqe::new(500 + i as u64, vec![Sge::new(buf.bus_addr(), 0, 32)]))
            .unwrap();
    }
    assert_eq!(srq.posted(), 4);
    srq.modify(2).unwrap();
    assert_eq!(srq.query().unwrap(), qplib::SrqQuery { limit: 2, max_wr: 16 });

    let src = rig.buffer(32);
    for wr_id in 0..3u64 {
        let wqe = SendWqe::new(wr_id, SendOp::Send, Payload::Sges(vec![Sge::new(src.bus_addr(), 0, 12)])).signaled();
        a.post_send(&wqe).unwrap();
    }
    a.post_send_db();
    assert_eq!(rig.poll_n(&cq_a, 3).len(), 3);

    let received = rig.poll_n(&cq_b, 3);
    assert_eq!(received.iter().map(|c| c.wr_id).collect::<Vec<_>>(), vec![500, 501, 502]);
    assert!(received.iter().all(|c| c.flags & CQE_RES_FLAG_SRQ != 0 && c.status == CqeStatus::Success));
    assert_eq!(srq.posted(), 1);

    assert_eq!(
        events.lock().as_slice(),
        &[AsyncEvent::Function {
            event: FUNC_EVENT_SRQ_LIMIT,
            data: srq.id()
        }]
    );
    assert!(!srq.is_armed());

    // Referenced by a QP
    assert!(rig.dev.destroy_srq(&srq).is_err());
    rig.dev.destroy_qp(&b).unwrap();
    rig.dev.destroy_srq(&srq).unwrap();
    assert!(srq.post_recv(&RecvWqe::new(9, vec![])).is_err());
}

#[test]
fn test_memory_region_life_cycle() {
    let rig = rig();
    let buf = rig.buffer(8192);
    let mr = rig
        .dev
        .register_mr(0, buf.bus_addr(), 8192, Access::LOCAL_WRITE | Access::REMOTE_READ)
        .unwrap();
    assert_eq!(mr.key, 0x100);
    assert_eq!(mr.length, 8192);
    assert!(rig.dev.register_mr(0, buf.bus_addr(), 0, Access::LOCAL_WRITE).is_err());

    rig.dev.deregister_mr(&mr).unwrap();
    assert_eq!(
        rig.dev.deregister_mr(&mr),
        Err(QplibError::Firmware {
            opcode: Opcode::DeregisterMr,
            status: qplib::emulator::FW_STATUS_NOT_FOUND
        })
    );

    // A fresh key never collides with a freed one
    let window = rig.dev.alloc_mrw(0, true).unwrap();
    assert_eq!(window, 0x101);
    rig.dev.dealloc_key(window).unwrap();
}

#[test]
fn test_failed_registration_reports_register_error() {
    let rig = rig();
    let buf = rig.buffer(4096);
    rig.emu.fail_next(Opcode::RegisterMr, qplib::emulator::FW_STATUS_INVALID);
    rig.emu.fail_next(Opcode::DeallocateKey, FW_STATUS_BUSY);

    // The cleanup failure is logged; the caller sees the registration error
    assert_eq!(
        rig.dev.register_mr(0, buf.bus_addr(), 4096, Access::LOCAL_WRITE),
        Err(QplibError::Firmware {
            opcode: Opcode::RegisterMr,
            status: qplib::emulator::FW_STATUS_INVALID
        })
    );
    let mr = rig.dev.register_mr(0, buf.bus_addr(), 4096, Access::LOCAL_WRITE).unwrap();
    assert_eq!(mr.key, 0x101);
}

#[test]
fn test_device_attributes_and_shutdown() {
    let rig = rig();
    let attrs = rig.dev.attributes();
    assert_eq!(attrs.fw_version_string(), qplib::emulator::default_attributes().fw_version_string());
    assert_eq!(attrs.max_sge, 6);

    rig.dev.shutdown();
    assert!(rig.dev.is_shut_down());
    assert!(rig.dev.create_cq(16).is_err());
    // Idempotent
    rig.dev.shutdown();
}

#[test]
fn test_two_devices_are_independent() {
    let one = rig();
    let two = rig();
    let cq_one = one.dev.create_cq(16).unwrap();
    let cq_two = two.dev.create_cq(16).unwrap();
    assert_eq!(cq_one.id(), 1);
    assert_eq!(cq_two.id(), 1);
    assert!(two.dev.lookup_cq(1).is_some_and(|cq| Arc::ptr_eq(&cq, &cq_two)));
}
