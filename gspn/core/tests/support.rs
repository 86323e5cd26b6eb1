#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use gspn_core::sim::{SimBuffers, SimFences, SimHardware, SimMode};
use gspn_core::{GspnDevice, SchedulerConfig};
use gspn_spec::{CmdInfo, LayerId, Size};

pub const CHIP_ID: u32 = 0x9631_0000;

/// Device plus handles on its simulated collaborators.
pub struct Rig {
    pub device: GspnDevice,
    pub hw: SimHardware,
    pub buffers: Arc<SimBuffers>,
    pub fences: Arc<SimFences>,
}

pub fn config(cores: usize) -> SchedulerConfig {
    SchedulerConfig {
        core_count: cores,
        kcmd_max: 8,
        sync_wait_ms: 3000,
        exec_timeout_ms: 2000,
        fence_wait_ms: 500,
        suspend_wait_ms: 2000,
        ..SchedulerConfig::default()
    }
}

pub fn rig(config: SchedulerConfig, mode: SimMode) -> Rig {
    let hw = SimHardware::new(config.core_count, CHIP_ID);
    hw.set_all_modes(mode);
    let buffers = Arc::new(SimBuffers::new());
    let fences = Arc::new(SimFences::new());
    let device = GspnDevice::probe(
        config,
        Arc::new(hw.clone()),
        buffers.clone(),
        fences.clone(),
    )
    .expect("probe simulated device");
    Rig {
        device,
        hw,
        buffers,
        fences,
    }
}

/// Compose command blending L0 (buffer `fd`) into DES1 (buffer `fd + 1000`) without scaling.
pub fn blit(fd: i32) -> CmdInfo {
    let mut cmd = CmdInfo::default();
    let size = Size::new(64, 64);
    let l0 = cmd.layer_mut(LayerId::L0);
    l0.layer_en = true;
    l0.share_fd = fd;
    l0.clip_size = size;
    let des1 = cmd.layer_mut(LayerId::Des1);
    des1.layer_en = true;
    des1.share_fd = fd + 1000;
    des1.scale_out_size = size;
    cmd
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

pub const PATIENCE: Duration = Duration::from_secs(5);

/// Wait for `core` to be running, then finish it.
pub fn finish_next(hw: &SimHardware, core: usize) {
    assert!(
        wait_until(PATIENCE, || hw.is_busy(core)),
        "core {core} never started"
    );
    assert!(hw.finish(core));
}
