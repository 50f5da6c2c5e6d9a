//! Control channel behavior against a misbehaving firmware

mod common;

use common::{open, rig, short_timeout_config};
use qplib::emulator::{FW_STATUS_BUSY, FW_STATUS_NO_RESOURCE};
use qplib::{AhAttrs, ControlChannel, Opcode, QplibError, RcfwConfig, SendOptions};
use std::thread;
use std::time::{Duration, Instant};

fn ah_attrs() -> AhAttrs {
    AhAttrs {
        pd_id: 0,
        dgid: [1; 16],
        sgid_index: 0,
        hop_limit: 1,
        traffic_class: 0,
        flow_label: 0,
        dest_mac: [0; 6],
    }
}

fn wait_for(what: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !what() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_out_of_order_responses_reach_their_callers() {
    let rig = rig();
    for op in [Opcode::CreateCq, Opcode::CreateAh, Opcode::AllocateMrw] {
        rig.emu.hold_responses(op);
    }

    thread::scope(|s| {
        let cq = s.spawn(|| rig.dev.create_cq(16));
        let ah = s.spawn(|| rig.dev.create_ah(&ah_attrs()));
        let key = s.spawn(|| rig.dev.alloc_mrw(0, false));

        wait_for(|| rig.emu.held_count() == 3);
        assert_eq!(rig.dev.control_channel().outstanding(), 3);
        rig.emu.release_held(&[2, 1, 0]);

        assert_eq!(cq.join().unwrap().unwrap().id(), 1);
        assert_eq!(ah.join().unwrap().unwrap().id, 1);
        assert_eq!(key.join().unwrap().unwrap(), 0x100);
    });
    assert_eq!(rig.dev.control_channel().outstanding(), 0);
}

#[test]
fn test_lost_response_times_out_then_recovers() {
    let rig = open(short_timeout_config(), true);
    rig.emu.drop_responses(Opcode::CreateCq, 1);

    let err = rig.dev.create_cq(16).unwrap_err();
    assert_eq!(err, QplibError::Timeout(Opcode::CreateCq));
    assert!(!rig.dev.control_channel().is_stalled());

    // Firmware did create the first CQ; its id is simply never learned
    let cq = rig.dev.create_cq(16).unwrap();
    assert_eq!(cq.id(), 2);
}

#[test]
fn test_lost_response_does_not_wedge_the_ring() {
    let rig = open(short_timeout_config(), true);
    let channel = rig.dev.control_channel();
    let free_before = channel.cmdq_free_slots();
    rig.emu.drop_responses(Opcode::AllocateMrw, 1);
    assert_eq!(rig.dev.alloc_mrw(0, false), Err(QplibError::Timeout(Opcode::AllocateMrw)));

    // Enough traffic to wrap the cookie sequence past the lost slot twice
    for _ in 0..channel.config().cmdq_depth + 16 {
        let key = rig.dev.alloc_mrw(0, false).unwrap();
        rig.dev.dealloc_key(key).unwrap();
    }
    assert_eq!(channel.outstanding(), 0);
    assert_eq!(channel.cmdq_free_slots(), free_before);
    assert!(!channel.is_stalled());

    channel.deinitialize_firmware().unwrap();
    assert!(!channel.is_initialized());
}

#[test]
fn test_non_blocking_window_is_capped() {
    let mut config = common::config();
    config.rcfw.non_blocking_shadow_qd = 1;
    config.rcfw.admission_timeout_ms = 200;
    let rig = open(config, true);
    rig.emu.hold_responses(Opcode::AllocateMrw);

    thread::scope(|s| {
        let first = s.spawn(|| rig.dev.alloc_mrw(0, false));
        wait_for(|| rig.emu.held_count() == 1);

        // The only permit is taken: the second submitter waits, then gives up
        let started = Instant::now();
        let second = rig.dev.alloc_mrw(0, false);
        assert!(matches!(second, Err(QplibError::Busy(_))));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(rig.emu.held_count(), 1);

        rig.emu.stop_holding(Opcode::AllocateMrw);
        rig.emu.release_held(&[0]);
        assert_eq!(first.join().unwrap().unwrap(), 0x100);
    });
    // The permit came back
    assert_eq!(rig.dev.alloc_mrw(0, false).unwrap(), 0x101);
}

#[test]
fn test_silent_firmware_stalls_channel() {
    let rig = open(short_timeout_config(), true);
    rig.emu.set_silent(true);
    let threshold = rig.dev.control_channel().config().stall_threshold;

    for _ in 0..threshold {
        assert_eq!(rig.dev.alloc_mrw(0, false), Err(QplibError::Timeout(Opcode::AllocateMrw)));
    }
    assert!(rig.dev.control_channel().is_stalled());
    assert_eq!(rig.dev.alloc_mrw(0, false), Err(QplibError::Stalled));
    assert_eq!(rig.dev.create_cq(16).unwrap_err(), QplibError::Stalled);
}

#[test]
fn test_self_polling_without_interrupts() {
    let rig = open(common::config(), false);
    assert!(!rig.dev.control_channel().flags().contains(qplib::rcfw::ChannelFlags::INTERRUPTS));
    let cq = rig.dev.create_cq(16).unwrap();
    let qp = rig.dev.create_qp(qplib::QpInitAttrs::rc(&cq, &cq, 4)).unwrap();
    common::to_init(&qp);
    common::to_rtr(&qp, qp.id());
    common::to_rts(&qp);
    assert_eq!(qp.query().unwrap().state, qplib::QpState::Rts);
    assert_eq!(rig.dev.attributes().max_qp, 1024);
}

#[test]
fn test_firmware_failure_is_returned() {
    let rig = rig();
    rig.emu.fail_next(Opcode::CreateCq, FW_STATUS_NO_RESOURCE);
    assert_eq!(
        rig.dev.create_cq(16).unwrap_err(),
        QplibError::Firmware {
            opcode: Opcode::CreateCq,
            status: FW_STATUS_NO_RESOURCE
        }
    );
    // The failed CQ was not registered
    assert!(rig.dev.lookup_cq(1).is_none());
    assert_eq!(rig.dev.create_cq(16).unwrap().id(), 1);
}

#[test]
fn test_gid_failures_are_swallowed() {
    let rig = rig();
    let gid = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    assert_eq!(rig.dev.add_gid(gid, 0).unwrap(), 0);
    // Duplicate: firmware refuses, the caller still sees success
    rig.dev.add_gid(gid, 0).unwrap();
    assert_eq!(rig.dev.query_gid(0).unwrap(), (gid, 0));

    rig.emu.fail_next(Opcode::DeleteGid, FW_STATUS_BUSY);
    rig.dev.delete_gid(0).unwrap();
    // The injected failure meant the entry stayed
    assert_eq!(rig.dev.query_gid(0).unwrap(), (gid, 0));
    rig.dev.delete_gid(0).unwrap();
    assert!(rig.dev.query_gid(0).is_err());
}

#[test]
fn test_detached_device_fakes_teardown() {
    let rig = rig();
    let cq = rig.dev.create_cq(16).unwrap();
    let qp = rig.dev.create_qp(qplib::QpInitAttrs::rc(&cq, &cq, 4)).unwrap();

    rig.dev.control_channel().mark_detached();
    assert_eq!(rig.dev.create_cq(16).unwrap_err(), QplibError::Detached);
    rig.dev.destroy_qp(&qp).unwrap();
    rig.dev.destroy_cq(&cq).unwrap();
    assert!(qp.is_destroyed());
    assert!(cq.is_destroyed());
}

#[test]
fn test_commands_gated_until_initialized() {
    let emu = qplib::Emulator::new().unwrap();
    let collab = emu.collaborators(false);
    let config = RcfwConfig {
        cmd_timeout_ms: 2_000,
        ..Default::default()
    };
    let rcfw = ControlChannel::new(config, collab.dma, collab.ctrl).unwrap();

    let cmd = qplib::rcfw::Command::AllocateMrw {
        pd_id: 0,
        is_mw: false,
    };
    assert_eq!(
        rcfw.send(&cmd, SendOptions::default()).unwrap_err(),
        QplibError::NotInitialized(Opcode::AllocateMrw)
    );
    let version = rcfw
        .send(&qplib::rcfw::Command::QueryVersion, SendOptions::default())
        .unwrap();
    assert_eq!(version.data, qplib::emulator::default_attributes().fw_version);

    rcfw.initialize_firmware().unwrap();
    assert_eq!(rcfw.send(&cmd, SendOptions::default()).unwrap().xid, 0x100);
    rcfw.deinitialize_firmware().unwrap();
    assert!(!rcfw.is_initialized());
    rcfw.disable();
}

#[test]
fn test_blocking_send() {
    let rig = rig();
    let resp = rig
        .dev
        .control_channel()
        .send(&qplib::rcfw::Command::QueryVersion, SendOptions::blocking())
        .unwrap();
    assert_eq!(resp.data, rig.dev.attributes().fw_version);
}
