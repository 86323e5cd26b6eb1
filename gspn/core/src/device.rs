use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use gspn_spec::abi::{decode_cmd_array, patch_release_fences};
use gspn_spec::{
    Capability, ChipFamily, CmdInfo, CtlCode, ErrorCode, IoctlRequest, CAPABILITY_SIZE,
    CMD_INFO_SIZE,
};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::cores::{CoreManager, CoreStatus};
use crate::error::{GspnError, Result};
use crate::hal::{BufferProvider, CoreId, FenceProvider, HardwareRegs, TimelineHandle};
use crate::pool::CommandPool;
pub use crate::pool::Occupancy;
use crate::program::CoefCache;
use crate::sync::{Completion, Event, WakeSignal};
use crate::worker;

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) frames: AtomicU64,
    pub(crate) commands: AtomicU64,
    pub(crate) completions: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) hardware_timeouts: AtomicU64,
    pub(crate) recoveries: AtomicU64,
    pub(crate) drained: AtomicU64,
    pub(crate) leak_repairs: AtomicU64,
    pub(crate) fence_wait_failures: AtomicU64,
    pub(crate) triggers: AtomicU64,
    pub(crate) exec_time_us: AtomicU64,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Frames accepted.
    pub frames: u64,
    /// Commands accepted.
    pub commands: u64,
    /// Commands that completed without error.
    pub completions: u64,
    /// Commands that completed with an error.
    pub failures: u64,
    /// Cores that stayed busy past their deadline.
    pub hardware_timeouts: u64,
    /// Recovery invocations.
    pub recoveries: u64,
    /// Queued commands returned unexecuted by a suspend.
    pub drained: u64,
    /// Times the pool lists had to be rebuilt.
    pub leak_repairs: u64,
    /// Acquire fences that failed to signal in time.
    pub fence_wait_failures: u64,
    /// Hardware triggers issued.
    pub triggers: u64,
    /// Summed execution time of completed commands.
    pub exec_time_us: u64,
    /// Asynchronous commands whose release fences are still pending.
    pub remain_async: usize,
    /// Free command slots.
    pub empty_slots: usize,
    /// Free cores.
    pub free_cores: usize,
}

/// Result of [`GspnDevice::suspend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SuspendOutcome {
    /// The pipeline drained within the wait.
    Drained,
    /// The wait expired; registers were dumped and suspend proceeded anyway.
    Forced,
}

/// State shared by callers, the worker thread and interrupt callbacks.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) hw: Arc<dyn HardwareRegs>,
    pub(crate) buffers: Arc<dyn BufferProvider>,
    pub(crate) fences: Arc<dyn FenceProvider>,
    capability: OnceLock<Capability>,
    pub(crate) pool: CommandPool,
    pub(crate) cores: CoreManager,
    pub(crate) wake: Arc<WakeSignal>,
    pub(crate) sync_done: Event,
    pub(crate) suspend_done: Completion,
    pub(crate) suspend_round: AtomicU64,
    suspending: AtomicBool,
    shutdown: AtomicBool,
    pub(crate) remain_async: AtomicUsize,
    pub(crate) coef: Mutex<CoefCache>,
    pub(crate) stats: Stats,
}

impl Shared {
    pub(crate) fn capability(&self) -> &Capability {
        self.capability.get_or_init(|| {
            let chip_id = self.hw.chip_id();
            let family = ChipFamily::from_chip_id(chip_id);
            if family == ChipFamily::Baseline {
                tracing::info!(chip_id = format_args!("{chip_id:#010x}"), "unknown chip id, using baseline capability");
            }
            Capability::for_chip(chip_id)
        })
    }

    pub(crate) fn is_suspending(&self) -> bool {
        self.suspending.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Reason a blocked caller must give up, if any.
    pub(crate) fn interrupt_reason(&self) -> Option<GspnError> {
        if self.is_shutdown() {
            Some(GspnError::Interrupted)
        } else if self.is_suspending() {
            Some(GspnError::DeviceSuspended)
        } else {
            None
        }
    }

    pub(crate) fn set_suspending(&self, value: bool) {
        self.suspending.store(value, Ordering::Release);
    }

    pub(crate) fn wake_everyone(&self) {
        self.wake.raise();
        self.pool.wake_waiters();
        self.sync_done.notify_all();
    }

    fn dispatch_ioctl(&self, pid: u32, raw: u32, user: &mut [u8]) -> Result<()> {
        let req = IoctlRequest::decode(raw);
        tracing::debug!(
            pid,
            nr = req.nr,
            count = req.count,
            async_flag = req.async_flag,
            param_size = req.param_size,
            "ioctl"
        );
        match req.ctl_code() {
            Some(CtlCode::GetCapability) => {
                let got = (req.param_size as usize).min(user.len());
                if got < CAPABILITY_SIZE {
                    return Err(GspnError::BufferTooSmall {
                        got,
                        need: CAPABILITY_SIZE,
                    });
                }
                self.capability()
                    .encode_into(user)
                    .map_err(|err| GspnError::CopyToUser(err.to_string()))
            }
            Some(CtlCode::SetParam) => {
                let n = req.count as usize;
                if n == 0 || n > self.config.cmd_array_max {
                    return Err(GspnError::InvalidArgument(format!(
                        "command count {n} outside 1..={}",
                        self.config.cmd_array_max
                    )));
                }
                if (req.param_size as usize) < CMD_INFO_SIZE {
                    return Err(GspnError::InvalidArgument(format!(
                        "parameter size {} smaller than a command ({CMD_INFO_SIZE})",
                        req.param_size
                    )));
                }
                let mut cmds = decode_cmd_array(user, n)
                    .map_err(|err| GspnError::CopyFromUser(err.to_string()))?;
                self.submit(&mut cmds, req.async_flag, pid)?;
                if req.async_flag {
                    for (index, cmd) in cmds.iter().enumerate() {
                        patch_release_fences(user, index, cmd)
                            .map_err(|err| GspnError::CopyToUser(err.to_string()))?;
                    }
                }
                Ok(())
            }
            None => Err(GspnError::Ctl(req.nr)),
        }
    }

    // Runs after the worker has stopped; nothing else touches the slots.
    fn teardown(&self) {
        for id in 0..self.pool.size() {
            let mut guard = self.pool.slot(id);
            let kcmd = &mut *guard;
            self.unmap_buffers(kcmd);
            for handle in kcmd.buffers.iter_mut().filter_map(Option::take) {
                self.buffers.release(handle);
            }
            for fence in kcmd.acq_fences.drain(..).chain(kcmd.rls_fences.drain(..)) {
                self.fences.put(fence);
            }
        }
        for core in self.cores.iter() {
            self.hw.disable(core.id());
            self.fences.destroy_timeline(*core.timeline());
        }
    }
}

/// A probed GSPN device: the pool, the cores and the running worker thread.
pub struct GspnDevice {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for GspnDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GspnDevice")
            .field("cores", &self.shared.cores.len())
            .field("slots", &self.shared.pool.size())
            .field("suspending", &self.shared.is_suspending())
            .finish()
    }
}

impl GspnDevice {
    /// Create timelines, claim interrupts and start the worker thread.
    pub fn probe(
        config: SchedulerConfig,
        hw: Arc<dyn HardwareRegs>,
        buffers: Arc<dyn BufferProvider>,
        fences: Arc<dyn FenceProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let timelines = (0..config.core_count)
            .map(|core| fences.create_timeline(&format!("gspn_core{core}")))
            .collect::<std::result::Result<Vec<TimelineHandle>, _>>()?;

        let wake = Arc::new(WakeSignal::new());
        for core in 0..config.core_count {
            let wake = wake.clone();
            hw.request_irq(core, Arc::new(move || wake.raise()))?;
        }

        let shared = Arc::new(Shared {
            pool: CommandPool::new(config.kcmd_max),
            cores: CoreManager::new(timelines),
            coef: Mutex::new(CoefCache::new(config.coef_cache_max)),
            config,
            hw,
            buffers,
            fences,
            capability: OnceLock::new(),
            wake,
            sync_done: Event::new(),
            suspend_done: Completion::new(),
            suspend_round: AtomicU64::new(0),
            suspending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            remain_async: AtomicUsize::new(0),
            stats: Stats::default(),
        });
        let cap = *shared.capability();

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("gspn-worker".into())
            .spawn(move || worker::run(worker_shared))
            .map_err(|err| GspnError::Thread(err.to_string()))?;

        tracing::info!(
            cores = shared.cores.len(),
            slots = shared.pool.size(),
            version = cap.version,
            "gspn device probed"
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Cached capability report.
    pub fn capability(&self) -> Capability {
        *self.shared.capability()
    }

    /// Configuration the device runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Handle a raw ioctl; `user` is the caller's parameter block.
    pub fn ioctl(&self, pid: u32, raw: u32, user: &mut [u8]) -> std::result::Result<(), ErrorCode> {
        self.shared.dispatch_ioctl(pid, raw, user).map_err(|err| {
            tracing::warn!(pid, error = %err, "ioctl failed");
            err.code()
        })
    }

    /// Submit a frame of commands. Asynchronous submissions return once queued,
    /// with release-fence fds written into `cmds`; synchronous ones wait for completion.
    pub fn submit(&self, cmds: &mut [CmdInfo], async_flag: bool, pid: u32) -> Result<()> {
        self.shared.submit(cmds, async_flag, pid)
    }

    /// Drain the pipeline and block further submissions.
    pub fn suspend(&self) -> SuspendOutcome {
        self.shared.suspend()
    }

    /// Accept submissions again; scaler coefficients are regenerated on next use.
    pub fn resume(&self) {
        self.shared.resume();
    }

    /// Whether a suspend is in effect.
    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspending()
    }

    /// Interrupt entry point for `core`; only wakes the worker.
    pub fn irq(&self, core: CoreId) {
        tracing::trace!(core, "irq");
        self.shared.wake.raise();
    }

    /// Current status of one core.
    pub fn core_status(&self, core: CoreId) -> CoreStatus {
        self.shared.cores.core(core).status()
    }

    /// Timeline carrying `core`'s release fences.
    pub fn core_timeline(&self, core: CoreId) -> TimelineHandle {
        *self.shared.cores.core(core).timeline()
    }

    /// Which list holds each slot, taken under every list lock.
    pub fn occupancy(&self) -> Occupancy {
        let shared = &self.shared;
        let fills = shared.cores.fill_guards();
        let (empty, dissociation) = shared.pool.snapshot_lists();
        Occupancy {
            total: shared.pool.size(),
            empty,
            fill: fills.iter().map(|fill| fill.iter().copied().collect()).collect(),
            dissociation,
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DeviceStats {
        let shared = &self.shared;
        let s = &shared.stats;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DeviceStats {
            frames: load(&s.frames),
            commands: load(&s.commands),
            completions: load(&s.completions),
            failures: load(&s.failures),
            hardware_timeouts: load(&s.hardware_timeouts),
            recoveries: load(&s.recoveries),
            drained: load(&s.drained),
            leak_repairs: load(&s.leak_repairs),
            fence_wait_failures: load(&s.fence_wait_failures),
            triggers: load(&s.triggers),
            exec_time_us: load(&s.exec_time_us),
            remain_async: shared.remain_async.load(Ordering::Acquire),
            empty_slots: shared.pool.empty_len(),
            free_cores: shared.cores.free_count(),
        }
    }
}

impl Drop for GspnDevice {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.shutdown.store(true, Ordering::Release);
        shared.wake_everyone();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("gspn worker panicked");
            }
        }
        shared.teardown();
        tracing::info!("gspn device removed");
    }
}
