//! In-process buffer, fence and register providers.
//!
//! They keep enough bookkeeping (reference counts, signal counts, trigger
//! logs) for tests to check that the scheduler acquires and releases every
//! resource exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::hal::{
    regs, BufferHandle, BufferProvider, BusyBits, CoreId, DeviceAddress, FenceHandle,
    FenceProvider, HalError, HardwareRegs, IrqHandler, TimelineHandle,
};

#[derive(Debug, Default)]
struct BufferState {
    next: u64,
    live: HashMap<u64, i32>,
    mapped: HashSet<(CoreId, u64)>,
    failing_fds: HashSet<i32>,
    failing_maps: HashSet<i32>,
    resolved: Vec<i32>,
    resolves: u64,
    releases: u64,
    maps: u64,
    unmaps: u64,
}

/// DMA-buffer stand-in. Every positive fd resolves unless marked failing.
#[derive(Debug, Default)]
pub struct SimBuffers {
    state: Mutex<BufferState>,
}

impl SimBuffers {
    /// Provider with no failures configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make resolving `fd` fail.
    pub fn fail_fd(&self, fd: i32) {
        self.state.lock().failing_fds.insert(fd);
    }

    /// Make mapping the buffer behind `fd` fail.
    pub fn fail_map(&self, fd: i32) {
        self.state.lock().failing_maps.insert(fd);
    }

    /// Successful resolves.
    pub fn resolves(&self) -> u64 {
        self.state.lock().resolves
    }

    /// Releases.
    pub fn releases(&self) -> u64 {
        self.state.lock().releases
    }

    /// Successful maps.
    pub fn maps(&self) -> u64 {
        self.state.lock().maps
    }

    /// Unmaps.
    pub fn unmaps(&self) -> u64 {
        self.state.lock().unmaps
    }

    /// Handles resolved but not yet released.
    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Mappings not yet undone.
    pub fn mapped(&self) -> usize {
        self.state.lock().mapped.len()
    }

    /// Every fd passed to a successful resolve, in order.
    pub fn resolved_fds(&self) -> Vec<i32> {
        self.state.lock().resolved.clone()
    }

    /// Device address the sim assigns to `fd`.
    pub fn address_of(fd: i32) -> u32 {
        (fd as u32) << 12
    }
}

impl BufferProvider for SimBuffers {
    fn resolve(&self, fd: i32) -> Result<BufferHandle, HalError> {
        let mut state = self.state.lock();
        if fd <= 0 || state.failing_fds.contains(&fd) {
            return Err(HalError::UnknownBuffer(fd));
        }
        state.next += 1;
        let id = state.next;
        state.live.insert(id, fd);
        state.resolved.push(fd);
        state.resolves += 1;
        Ok(BufferHandle(id))
    }

    fn map(&self, core: CoreId, handle: &BufferHandle) -> Result<DeviceAddress, HalError> {
        let mut state = self.state.lock();
        let fd = match state.live.get(&handle.0) {
            Some(&fd) if !state.failing_maps.contains(&fd) => fd,
            _ => {
                return Err(HalError::Map {
                    core,
                    handle: handle.0,
                })
            }
        };
        state.mapped.insert((core, handle.0));
        state.maps += 1;
        Ok(DeviceAddress(Self::address_of(fd)))
    }

    fn unmap(&self, core: CoreId, handle: &BufferHandle) {
        let mut state = self.state.lock();
        if state.mapped.remove(&(core, handle.0)) {
            state.unmaps += 1;
        } else {
            tracing::warn!(core, handle = handle.0, "unmap of a buffer that is not mapped");
        }
    }

    fn release(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        if state.live.remove(&handle.0).is_some() {
            state.releases += 1;
        } else {
            tracing::warn!(handle = handle.0, "release of an unknown buffer");
        }
    }
}

#[derive(Debug)]
struct TimelineState {
    name: String,
    value: u64,
    signals: u64,
    destroyed: bool,
}

#[derive(Debug, Clone, Copy)]
enum FenceKind {
    Timeline { timeline: u64, target: u64 },
    External { signaled: bool },
}

#[derive(Debug, Default)]
struct FenceState {
    next: u64,
    next_fd: i32,
    timelines: HashMap<u64, TimelineState>,
    fences: HashMap<u64, FenceKind>,
    handles: HashMap<u64, u64>,
    fds: HashMap<i32, u64>,
    fail_create: bool,
    fail_after: Option<u64>,
    created: u64,
    puts: u64,
}

impl FenceState {
    fn id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    fn fd(&mut self) -> i32 {
        if self.next_fd == 0 {
            self.next_fd = 100;
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    fn is_signaled(&self, fence: u64) -> bool {
        match self.fences.get(&fence) {
            Some(FenceKind::Timeline { timeline, target }) => match self.timelines.get(timeline) {
                Some(tl) => tl.destroyed || tl.value >= *target,
                None => true,
            },
            Some(FenceKind::External { signaled }) => *signaled,
            None => true,
        }
    }
}

/// Sync-timeline stand-in with counter timelines and externally signalled fences.
#[derive(Debug, Default)]
pub struct SimFences {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl SimFences {
    /// Provider with no failures configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent fence creation fail; `false` also lifts [`SimFences::fail_create_after`].
    pub fn fail_create(&self, fail: bool) {
        let mut state = self.state.lock();
        state.fail_create = fail;
        if !fail {
            state.fail_after = None;
        }
    }

    /// Let `count` more fence creations succeed, then fail the rest.
    pub fn fail_create_after(&self, count: u64) {
        let mut state = self.state.lock();
        let created = state.created;
        state.fail_after = Some(created + count);
    }

    /// Create a fence owned by a producer outside the scheduler; returns its fd.
    pub fn external_fence(&self, signaled: bool) -> i32 {
        let mut state = self.state.lock();
        let id = state.id();
        let fd = state.fd();
        state.fences.insert(id, FenceKind::External { signaled });
        state.fds.insert(fd, id);
        fd
    }

    /// Signal an external fence.
    pub fn signal_external(&self, fd: i32) {
        let mut state = self.state.lock();
        if let Some(id) = state.fds.get(&fd).copied() {
            if let Some(FenceKind::External { signaled }) = state.fences.get_mut(&id) {
                *signaled = true;
            }
        }
        self.cond.notify_all();
    }

    /// Whether the fence behind `fd` has signalled; `None` for unknown fds.
    pub fn is_signaled_fd(&self, fd: i32) -> Option<bool> {
        let state = self.state.lock();
        let id = state.fds.get(&fd).copied()?;
        Some(state.is_signaled(id))
    }

    /// Current value of a timeline.
    pub fn timeline_value(&self, timeline: &TimelineHandle) -> Option<u64> {
        self.state.lock().timelines.get(&timeline.0).map(|tl| tl.value)
    }

    /// Number of signals a timeline received.
    pub fn signal_count(&self, timeline: &TimelineHandle) -> u64 {
        self.state
            .lock()
            .timelines
            .get(&timeline.0)
            .map_or(0, |tl| tl.signals)
    }

    /// Signals across every timeline.
    pub fn total_signals(&self) -> u64 {
        self.state.lock().timelines.values().map(|tl| tl.signals).sum()
    }

    /// Timelines not yet destroyed, by name.
    pub fn live_timelines(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .timelines
            .values()
            .filter(|tl| !tl.destroyed)
            .map(|tl| tl.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Handles not yet put.
    pub fn live_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Fences successfully created.
    pub fn created(&self) -> u64 {
        self.state.lock().created
    }
}

impl FenceProvider for SimFences {
    fn create_timeline(&self, name: &str) -> Result<TimelineHandle, HalError> {
        let mut state = self.state.lock();
        let id = state.id();
        state.timelines.insert(
            id,
            TimelineState {
                name: name.to_string(),
                value: 0,
                signals: 0,
                destroyed: false,
            },
        );
        Ok(TimelineHandle(id))
    }

    fn create_fence(
        &self,
        timeline: &TimelineHandle,
        target: u64,
    ) -> Result<(FenceHandle, i32), HalError> {
        let mut state = self.state.lock();
        let exhausted = state.fail_after.is_some_and(|limit| state.created >= limit);
        if state.fail_create || exhausted {
            return Err(HalError::Fence("fence creation disabled".into()));
        }
        match state.timelines.get(&timeline.0) {
            Some(tl) if !tl.destroyed => {}
            _ => return Err(HalError::Fence(format!("timeline {} is gone", timeline.0))),
        }
        let fence = state.id();
        let handle = state.id();
        let fd = state.fd();
        state.fences.insert(
            fence,
            FenceKind::Timeline {
                timeline: timeline.0,
                target,
            },
        );
        state.handles.insert(handle, fence);
        state.fds.insert(fd, fence);
        state.created += 1;
        Ok((FenceHandle(handle), fd))
    }

    fn import(&self, fd: i32) -> Result<FenceHandle, HalError> {
        let mut state = self.state.lock();
        let fence = state
            .fds
            .get(&fd)
            .copied()
            .ok_or_else(|| HalError::Fence(format!("fd {fd} is not a fence")))?;
        let handle = state.id();
        state.handles.insert(handle, fence);
        Ok(FenceHandle(handle))
    }

    fn wait(&self, fence: &FenceHandle, timeout: Duration) -> Result<(), HalError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let id = *state
            .handles
            .get(&fence.0)
            .ok_or_else(|| HalError::Fence(format!("handle {} is not live", fence.0)))?;
        while !state.is_signaled(id) {
            if self.cond.wait_until(&mut state, deadline).timed_out() && !state.is_signaled(id) {
                return Err(HalError::FenceTimeout);
            }
        }
        Ok(())
    }

    fn put(&self, fence: FenceHandle) {
        let mut state = self.state.lock();
        if state.handles.remove(&fence.0).is_some() {
            state.puts += 1;
        } else {
            tracing::warn!(handle = fence.0, "put of an unknown fence handle");
        }
    }

    fn signal(&self, timeline: &TimelineHandle) {
        let mut state = self.state.lock();
        if let Some(tl) = state.timelines.get_mut(&timeline.0) {
            tl.value += 1;
            tl.signals += 1;
        }
        self.cond.notify_all();
    }

    fn destroy_timeline(&self, timeline: TimelineHandle) {
        let mut state = self.state.lock();
        if let Some(tl) = state.timelines.get_mut(&timeline.0) {
            tl.destroyed = true;
        }
        self.cond.notify_all();
    }
}

/// How a simulated core finishes a triggered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Stays busy until [`SimHardware::finish`] is called.
    Manual,
    /// Finishes and raises its interrupt after a fixed delay.
    Latency(Duration),
    /// Never finishes; only [`HardwareRegs::try_recover`] clears it.
    Wedged,
}

#[derive(Default)]
struct SimCore {
    regs: BTreeMap<u32, u32>,
    busy: bool,
    enabled: bool,
    generation: u64,
    irq: Option<IrqHandler>,
}

struct SimInner {
    chip_id: u32,
    cores: Mutex<Vec<SimCore>>,
    modes: Mutex<Vec<SimMode>>,
    failing_enable: Mutex<HashSet<CoreId>>,
    trigger_log: Mutex<Vec<(CoreId, u32)>>,
    triggers: AtomicU64,
    recoveries: AtomicU64,
    enables: AtomicU64,
    disables: AtomicU64,
    dumps: AtomicU64,
}

impl SimInner {
    fn complete(&self, core: CoreId, generation: Option<u64>) -> bool {
        let irq = {
            let mut cores = self.cores.lock();
            let sim = &mut cores[core];
            if !sim.busy || generation.is_some_and(|g| g != sim.generation) {
                return false;
            }
            sim.busy = false;
            sim.irq.clone()
        };
        if let Some(irq) = irq {
            irq();
        }
        true
    }
}

/// Register block of `n` simulated cores.
#[derive(Clone)]
pub struct SimHardware {
    inner: Arc<SimInner>,
}

impl std::fmt::Debug for SimHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHardware")
            .field("chip_id", &self.inner.chip_id)
            .field("triggers", &self.triggers())
            .finish()
    }
}

impl SimHardware {
    /// `cores` manual-mode cores reporting `chip_id`.
    pub fn new(cores: usize, chip_id: u32) -> Self {
        Self {
            inner: Arc::new(SimInner {
                chip_id,
                cores: Mutex::new((0..cores).map(|_| SimCore::default()).collect()),
                modes: Mutex::new(vec![SimMode::Manual; cores]),
                failing_enable: Mutex::new(HashSet::new()),
                trigger_log: Mutex::new(Vec::new()),
                triggers: AtomicU64::new(0),
                recoveries: AtomicU64::new(0),
                enables: AtomicU64::new(0),
                disables: AtomicU64::new(0),
                dumps: AtomicU64::new(0),
            }),
        }
    }

    /// Set how one core finishes future triggers.
    pub fn set_mode(&self, core: CoreId, mode: SimMode) {
        self.inner.modes.lock()[core] = mode;
    }

    /// Set every core's mode.
    pub fn set_all_modes(&self, mode: SimMode) {
        self.inner.modes.lock().iter_mut().for_each(|m| *m = mode);
    }

    /// Make enabling `core` fail.
    pub fn fail_enable(&self, core: CoreId, fail: bool) {
        let mut failing = self.inner.failing_enable.lock();
        if fail {
            failing.insert(core);
        } else {
            failing.remove(&core);
        }
    }

    /// Finish the running job on `core` and raise its interrupt; false if it was idle.
    pub fn finish(&self, core: CoreId) -> bool {
        self.inner.complete(core, None)
    }

    /// Whether `core` is running.
    pub fn is_busy(&self, core: CoreId) -> bool {
        self.inner.cores.lock()[core].busy
    }

    /// Whether `core` is powered.
    pub fn is_enabled(&self, core: CoreId) -> bool {
        self.inner.cores.lock()[core].enabled
    }

    /// `(core, L0 Y address)` for every trigger, in order.
    pub fn trigger_log(&self) -> Vec<(CoreId, u32)> {
        self.inner.trigger_log.lock().clone()
    }

    /// Total triggers.
    pub fn triggers(&self) -> u64 {
        self.inner.triggers.load(Ordering::Acquire)
    }

    /// Recovery invocations.
    pub fn recoveries(&self) -> u64 {
        self.inner.recoveries.load(Ordering::Acquire)
    }

    /// Enable calls that succeeded.
    pub fn enables(&self) -> u64 {
        self.inner.enables.load(Ordering::Acquire)
    }

    /// Disable calls.
    pub fn disables(&self) -> u64 {
        self.inner.disables.load(Ordering::Acquire)
    }

    /// Register dumps taken.
    pub fn dumps(&self) -> u64 {
        self.inner.dumps.load(Ordering::Acquire)
    }

    fn on_trigger(&self, core: CoreId, sim: &mut SimCore) {
        sim.busy = true;
        sim.generation += 1;
        let l0_y = sim
            .regs
            .get(&regs::layer(0, regs::LAYER_ADDR_Y))
            .copied()
            .unwrap_or(0);
        self.inner.trigger_log.lock().push((core, l0_y));
        self.inner.triggers.fetch_add(1, Ordering::AcqRel);
        if let SimMode::Latency(delay) = self.inner.modes.lock()[core] {
            let inner = self.inner.clone();
            let generation = sim.generation;
            // A detached timer thread per trigger is fine at simulation scale.
            let spawned = thread::Builder::new()
                .name(format!("gspn-sim-core{core}"))
                .spawn(move || {
                    thread::sleep(delay);
                    inner.complete(core, Some(generation));
                });
            if let Err(err) = spawned {
                tracing::error!(core, error = %err, "failed to start simulated completion timer");
            }
        }
    }
}

impl HardwareRegs for SimHardware {
    fn chip_id(&self) -> u32 {
        self.inner.chip_id
    }

    fn write(&self, core: CoreId, offset: u32, value: u32) {
        let mut cores = self.inner.cores.lock();
        let sim = &mut cores[core];
        if offset == regs::CTRL && value & regs::CTRL_TRIGGER != 0 {
            self.on_trigger(core, sim);
            return;
        }
        sim.regs.insert(offset, value);
    }

    fn read(&self, core: CoreId, offset: u32) -> u32 {
        let cores = self.inner.cores.lock();
        let sim = &cores[core];
        if offset == regs::STATUS {
            return if sim.busy {
                regs::STATUS_MOD1_BUSY | regs::STATUS_MOD2_BUSY
            } else {
                0
            };
        }
        sim.regs.get(&offset).copied().unwrap_or(0)
    }

    fn busy(&self, core: CoreId) -> BusyBits {
        let status = self.read(core, regs::STATUS);
        BusyBits {
            mod1: status & regs::STATUS_MOD1_BUSY != 0,
            mod2: status & regs::STATUS_MOD2_BUSY != 0,
        }
    }

    fn enable(&self, core: CoreId) -> Result<(), HalError> {
        if self.inner.failing_enable.lock().contains(&core) {
            return Err(HalError::Enable(core));
        }
        self.inner.cores.lock()[core].enabled = true;
        self.inner.enables.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn disable(&self, core: CoreId) {
        self.inner.cores.lock()[core].enabled = false;
        self.inner.disables.fetch_add(1, Ordering::AcqRel);
    }

    fn dump_registers(&self, core: CoreId) -> Vec<(u32, u32)> {
        self.inner.dumps.fetch_add(1, Ordering::AcqRel);
        let cores = self.inner.cores.lock();
        let mut dump: Vec<(u32, u32)> = cores[core]
            .regs
            .iter()
            .filter(|(&offset, _)| offset < regs::COEF_TAB)
            .map(|(&offset, &value)| (offset, value))
            .collect();
        dump.push((regs::STATUS, u32::from(cores[core].busy) * 3));
        dump
    }

    fn try_recover(&self, core: CoreId) {
        let mut cores = self.inner.cores.lock();
        let sim = &mut cores[core];
        sim.busy = false;
        sim.generation += 1;
        sim.regs.clear();
        self.inner.recoveries.fetch_add(1, Ordering::AcqRel);
    }

    fn request_irq(&self, core: CoreId, handler: IrqHandler) -> Result<(), HalError> {
        let mut cores = self.inner.cores.lock();
        let sim = cores.get_mut(core).ok_or(HalError::Irq(core))?;
        sim.irq = Some(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn buffers_count_every_reference() {
        let buffers = SimBuffers::new();
        let handle = buffers.resolve(7).unwrap();
        assert_eq!(buffers.map(1, &handle).unwrap(), DeviceAddress(7 << 12));
        buffers.unmap(1, &handle);
        buffers.release(handle);
        assert_eq!((buffers.resolves(), buffers.releases()), (1, 1));
        assert_eq!((buffers.maps(), buffers.unmaps()), (1, 1));
        assert_eq!(buffers.live(), 0);
        assert_eq!(buffers.resolve(-1), Err(HalError::UnknownBuffer(-1)));
        buffers.fail_fd(9);
        assert!(buffers.resolve(9).is_err());
    }

    #[test]
    fn timeline_fence_signals_at_target() {
        let fences = SimFences::new();
        let tl = fences.create_timeline("core0").unwrap();
        let (first, fd1) = fences.create_fence(&tl, 1).unwrap();
        let (second, fd2) = fences.create_fence(&tl, 2).unwrap();
        assert_eq!(fd1, 100);
        fences.signal(&tl);
        assert_eq!(fences.is_signaled_fd(fd1), Some(true));
        assert_eq!(fences.is_signaled_fd(fd2), Some(false));
        fences.wait(&first, Duration::from_millis(1)).unwrap();
        assert_eq!(
            fences.wait(&second, Duration::from_millis(5)),
            Err(HalError::FenceTimeout)
        );
        fences.destroy_timeline(tl);
        assert_eq!(fences.is_signaled_fd(fd2), Some(true));
        fences.put(first);
        fences.put(second);
        assert_eq!(fences.live_handles(), 0);
    }

    #[test]
    fn external_fence_import_and_wait() {
        let fences = Arc::new(SimFences::new());
        let fd = fences.external_fence(false);
        let handle = fences.import(fd).unwrap();
        let signaller = {
            let fences = fences.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fences.signal_external(fd);
            })
        };
        fences.wait(&handle, Duration::from_secs(5)).unwrap();
        signaller.join().unwrap();
        assert!(fences.import(12345).is_err());
    }

    #[test]
    fn creation_failure_injection() {
        let fences = SimFences::new();
        let tl = fences.create_timeline("core0").unwrap();
        fences.fail_create_after(1);
        assert!(fences.create_fence(&tl, 1).is_ok());
        assert!(fences.create_fence(&tl, 2).is_err());
    }

    #[test]
    fn manual_core_raises_irq_on_finish() {
        let hw = SimHardware::new(1, 0);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        hw.request_irq(
            0,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        hw.write(0, regs::layer(0, regs::LAYER_ADDR_Y), 0x7000);
        hw.write(0, regs::CTRL, regs::CTRL_TRIGGER);
        assert!(hw.busy(0).any());
        assert!(hw.finish(0));
        assert!(!hw.finish(0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(hw.trigger_log(), vec![(0, 0x7000)]);
    }

    #[test]
    fn latency_core_finishes_by_itself() {
        let hw = SimHardware::new(1, 0);
        hw.set_mode(0, SimMode::Latency(Duration::from_millis(5)));
        hw.write(0, regs::CTRL, regs::CTRL_TRIGGER);
        let deadline = Instant::now() + Duration::from_secs(5);
        while hw.is_busy(0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!hw.is_busy(0));
    }

    #[test]
    fn recovery_clears_a_wedged_core() {
        let hw = SimHardware::new(2, 0);
        hw.set_mode(1, SimMode::Wedged);
        hw.write(1, regs::CTRL, regs::CTRL_TRIGGER);
        assert!(!hw.dump_registers(1).is_empty());
        hw.try_recover(1);
        assert!(!hw.busy(1).any());
        assert_eq!((hw.recoveries(), hw.dumps()), (1, 1));
    }
}
