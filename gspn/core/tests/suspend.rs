use std::thread;
use std::time::Duration;

use gspn_core::cores::CoreStatus;
use gspn_core::sim::SimMode;
use gspn_core::{GspnError, SchedulerConfig, SuspendOutcome};
use gspn_spec::LayerId;

mod support;
use support::{blit, config, finish_next, rig, wait_until, PATIENCE};

#[test]
fn suspend_drains_queue_and_signals_each_fence_once() {
    let rig = rig(config(1), SimMode::Manual);
    let mut cmds = [blit(11), blit(12), blit(13)];
    rig.device.submit(&mut cmds, true, 1).unwrap();
    assert!(wait_until(PATIENCE, || rig.hw.is_busy(0)));

    let outcome = thread::scope(|s| {
        let suspender = s.spawn(|| rig.device.suspend());
        assert!(wait_until(PATIENCE, || {
            rig.device.is_suspended() && rig.device.occupancy().fill[0].is_empty()
        }));
        finish_next(&rig.hw, 0);
        suspender.join().unwrap()
    });
    assert_eq!(outcome, SuspendOutcome::Drained);

    assert_eq!(rig.hw.triggers(), 1);
    let timeline = rig.device.core_timeline(0);
    assert_eq!(rig.fences.signal_count(&timeline), 3);
    for cmd in &cmds {
        let fd = cmd.layer(LayerId::Des1).rls_fen_fd;
        assert_eq!(rig.fences.is_signaled_fd(fd), Some(true));
    }
    let stats = rig.device.stats();
    assert_eq!(stats.drained, 2);
    assert_eq!(stats.remain_async, 0);
    let occupancy = rig.device.occupancy();
    assert_eq!(occupancy.empty.len(), 8);
    assert!(occupancy.is_conserved());
    assert_eq!(rig.buffers.live(), 0);
    assert_eq!(rig.fences.live_handles(), 0);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(rig.hw.triggers(), 1);
    assert_eq!(rig.fences.signal_count(&timeline), 3);
}

#[test]
fn suspended_device_rejects_and_resume_restores() {
    let rig = rig(config(1), SimMode::Latency(Duration::from_millis(1)));
    assert_eq!(rig.device.suspend(), SuspendOutcome::Drained);
    assert_eq!(
        rig.device.submit(&mut [blit(11)], false, 1),
        Err(GspnError::DeviceSuspended)
    );
    assert_eq!(rig.buffers.resolves(), 0);

    rig.device.resume();
    assert!(!rig.device.is_suspended());
    rig.device.submit(&mut [blit(11)], false, 1).unwrap();
    assert_eq!(rig.device.stats().completions, 1);

    assert_eq!(rig.device.suspend(), SuspendOutcome::Drained);
    rig.device.resume();
    rig.device.submit(&mut [blit(12)], false, 1).unwrap();
}

#[test]
fn blocked_callers_are_released_by_suspend() {
    let cfg = SchedulerConfig {
        capacity_wait_ms: 5000,
        ..config(1)
    };
    let rig = rig(cfg, SimMode::Manual);
    let running = thread::scope(|s| {
        let running = s.spawn(|| rig.device.submit(&mut [blit(11)], false, 1));
        assert!(wait_until(PATIENCE, || rig.hw.is_busy(0)));
        let queued = s.spawn(|| rig.device.submit(&mut [blit(12)], false, 2));
        assert!(wait_until(PATIENCE, || rig.device.occupancy().fill[0].len() == 1));
        let mut filler = vec![blit(20); 6];
        rig.device.submit(&mut filler, true, 3).unwrap();
        let starved = s.spawn(|| rig.device.submit(&mut [blit(30)], true, 4));
        thread::sleep(Duration::from_millis(20));

        let suspender = s.spawn(|| rig.device.suspend());
        assert_eq!(starved.join().unwrap(), Err(GspnError::DeviceSuspended));
        assert_eq!(queued.join().unwrap(), Err(GspnError::DeviceSuspended));
        finish_next(&rig.hw, 0);
        assert_eq!(suspender.join().unwrap(), SuspendOutcome::Drained);
        running.join().unwrap()
    });
    assert_eq!(running, Err(GspnError::DeviceSuspended));
    assert_eq!(rig.device.core_status(0), CoreStatus::Free);
    assert_eq!(rig.device.occupancy().empty.len(), 8);
    assert_eq!(rig.buffers.live(), 0);
}

#[test]
fn overrunning_drain_is_forced_with_register_dump() {
    let cfg = SchedulerConfig {
        suspend_wait_ms: 50,
        exec_timeout_ms: 10_000,
        ..config(2)
    };
    let rig = rig(cfg, SimMode::Wedged);
    rig.device.submit(&mut [blit(11)], true, 1).unwrap();
    assert!(wait_until(PATIENCE, || rig.hw.is_busy(0)));

    assert_eq!(rig.device.suspend(), SuspendOutcome::Forced);
    assert!(rig.hw.dumps() >= 2);
    assert!(rig.device.is_suspended());
}
