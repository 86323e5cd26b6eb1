//! The scheduler thread.
//!
//! One pass: sleep until the computed deadline or a wake, reap idle cores,
//! recover cores that overran their deadline, then dispatch queued commands
//! onto free cores. Only this thread moves a core away from `Free`.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use gspn_spec::{LayerId, PlaneAddr};
use parking_lot::MutexGuard;

use crate::cores::CoreStatus;
use crate::device::{Shared, Stats};
use crate::error::{GspnError, Result};
use crate::hal::{CoreId, FenceHandle};
use crate::kcmd::{Frame, Kcmd, SlotId};
use crate::program::{self, CoefKey};
use crate::sync::WakeReason;

#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    /// Split commands with parts left, keyed by the core that owns them.
    pub(crate) pending_splits: VecDeque<(SlotId, CoreId)>,
    /// Last suspend round this thread has completed.
    pub(crate) settled_round: u64,
}

impl WorkerState {
    /// Remaining parts stay on the owning core so its timeline completes in fill order.
    fn take_split(&mut self, core: CoreId) -> Option<SlotId> {
        let pos = self.pending_splits.iter().position(|&(_, owner)| owner == core)?;
        self.pending_splits.remove(pos).map(|(slot, _)| slot)
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    let mut state = WorkerState::default();
    tracing::info!("gspn worker started");
    while !shared.is_shutdown() {
        if shared.is_suspending() {
            shared.suspend_pass(&mut state);
        }
        let deadline = shared.next_deadline(&state);
        let reason = shared.wake.wait(deadline);
        if shared.is_shutdown() {
            break;
        }
        shared.reap(&mut state);
        if reason == WakeReason::TimedOut {
            shared.recover_timeouts(&mut state);
        }
        if !shared.is_suspending() {
            shared.dispatch(&mut state);
        }
    }
    tracing::info!("gspn worker stopped");
}

impl Shared {
    /// When the worker must look again without being woken.
    fn next_deadline(&self, state: &WorkerState) -> Option<Instant> {
        let now = Instant::now();
        let nudge = now + self.config.dispatch_nudge();
        if !self.is_suspending() {
            let free_with_work = self
                .cores
                .iter()
                .any(|core| core.status() == CoreStatus::Free && core.fill_len() > 0);
            let split_ready = state
                .pending_splits
                .iter()
                .any(|&(_, core)| self.cores.core(core).status() == CoreStatus::Free);
            if free_with_work || split_ready {
                return Some(nudge);
            }
        }

        let mut earliest: Option<Instant> = None;
        for core in self.cores.iter() {
            let Some((slot, _)) = core.current() else {
                continue;
            };
            if core.status() != CoreStatus::Busy {
                return Some(nudge);
            }
            let start = self.pool.slot(slot).start_time.unwrap_or(now);
            let due = start + self.config.exec_timeout();
            earliest = Some(earliest.map_or(due, |e| e.min(due)));
        }
        earliest.map(|due| due.max(now))
    }

    /// Retire whatever the hardware has finished, plus commands whose programming failed.
    pub(crate) fn reap(&self, state: &mut WorkerState) {
        for core in self.cores.iter() {
            let id = core.id();
            if core.current().is_none() {
                continue;
            }
            if core.status() == CoreStatus::Busy && self.hw.busy(id).any() {
                continue;
            }
            self.complete_on_core(id, None, state);
        }
    }

    fn recover_timeouts(&self, state: &mut WorkerState) {
        let now = Instant::now();
        for core in self.cores.iter() {
            let id = core.id();
            let Some((slot, _)) = core.current() else {
                continue;
            };
            if core.status() != CoreStatus::Busy {
                continue;
            }
            let Some(start) = self.pool.slot(slot).start_time else {
                continue;
            };
            let elapsed = now.saturating_duration_since(start);
            if elapsed < self.config.exec_timeout() || !self.hw.busy(id).any() {
                continue;
            }

            let span = tracing::info_span!("gspn_recover", core = id, slot);
            let _enter = span.enter();
            let registers = self.hw.dump_registers(id);
            tracing::error!(
                elapsed_ms = elapsed.as_millis() as u64,
                registers = ?registers,
                "hardware timeout, recovering core"
            );
            self.hw.try_recover(id);
            Stats::bump(&self.stats.hardware_timeouts);
            Stats::bump(&self.stats.recoveries);
            self.complete_on_core(id, Some(GspnError::HardwareTimeout(id)), state);
        }
    }

    /// Unbind `core` and account for the part it ran.
    fn complete_on_core(&self, core: CoreId, forced: Option<GspnError>, state: &mut WorkerState) {
        let Some((slot, part)) = self.cores.unbind(core) else {
            return;
        };
        let mut kcmd = self.pool.slot(slot);
        if let Some(err) = forced {
            kcmd.error.get_or_insert(err);
        }
        self.unmap_buffers(&mut kcmd);
        self.hw.disable(core);
        let exec_us = kcmd.exec_time_us() as u64;
        self.stats.exec_time_us.fetch_add(exec_us, Ordering::Relaxed);
        kcmd.start_time = None;
        kcmd.occupied_core = None;

        if kcmd.error.is_none() {
            kcmd.sub_cmd_done_cnt += 1;
            if kcmd.sub_cmd_done_cnt < kcmd.sub_cmd_total {
                tracing::debug!(
                    core,
                    slot,
                    part = part.unwrap_or(0),
                    done = kcmd.sub_cmd_done_cnt,
                    total = kcmd.sub_cmd_total,
                    "split part finished"
                );
                let owner = kcmd.fence_core;
                drop(kcmd);
                state.pending_splits.push_back((slot, owner));
                return;
            }
        }
        tracing::debug!(core, slot, exec_us, "command finished");
        self.finish(slot, kcmd);
    }

    /// Complete a command that is not bound to any core.
    pub(crate) fn fail_unbound(&self, slot: SlotId, err: GspnError) {
        let mut kcmd = self.pool.slot(slot);
        kcmd.error.get_or_insert(err);
        self.unmap_buffers(&mut kcmd);
        self.finish(slot, kcmd);
    }

    /// Full completion: release resources, report, retire.
    fn finish(&self, slot: SlotId, mut kcmd: MutexGuard<'_, Kcmd>) {
        kcmd.done_flag = true;
        match &kcmd.error {
            Some(err) => {
                Stats::bump(&self.stats.failures);
                tracing::error!(slot, pid = kcmd.pid, error = %err, "command failed");
            }
            None => Stats::bump(&self.stats.completions),
        }
        for handle in kcmd.buffers.iter_mut().filter_map(Option::take) {
            self.buffers.release(handle);
        }
        for fence in kcmd.acq_fences.drain(..) {
            self.fences.put(fence);
        }
        self.discharge(&mut kcmd);
        let frame = kcmd.frame.clone();
        drop(kcmd);
        self.retire(slot, frame);
    }

    /// Tell whoever waits on this command that it is over.
    pub(crate) fn discharge(&self, kcmd: &mut Kcmd) {
        if let (Some(frame), Some(err)) = (&kcmd.frame, &kcmd.error) {
            frame.record_error(err);
        }
        if kcmd.is_async() {
            let timeline = *self.cores.core(kcmd.fence_core).timeline();
            self.fences.signal(&timeline);
            for fence in kcmd.rls_fences.drain(..) {
                self.fences.put(fence);
            }
            let _ = self
                .remain_async
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        } else {
            match &kcmd.frame {
                Some(frame) if frame.bump_done() => {}
                _ => tracing::warn!(pid = kcmd.pid, "synchronous command has no done counter"),
            }
            self.sync_done.notify_all();
        }
    }

    fn retire(&self, slot: SlotId, frame: Option<Arc<Frame>>) {
        let all_done = frame.as_ref().is_some_and(|frame| frame.mark_completed());
        match frame {
            Some(frame) if !self.is_suspending() => {
                if all_done {
                    let moved = self.pool.retire_frame(&frame);
                    tracing::debug!(frame = frame.id(), moved, "frame retired");
                }
            }
            _ => {
                self.pool.retire_single(slot);
            }
        }
    }

    fn dispatch(&self, state: &mut WorkerState) {
        for core in self.cores.iter() {
            let id = core.id();
            if core.status() != CoreStatus::Free {
                continue;
            }
            if let Some(slot) = state.take_split(id) {
                let part = self.pool.slot(slot).sub_cmd_done_cnt;
                self.dispatch_one(id, slot, part);
                continue;
            }
            if let Some(slot) = self.cores.pop_fill(id, &self.pool) {
                self.dispatch_one(id, slot, 0);
            }
        }
    }

    fn dispatch_one(&self, core: CoreId, slot: SlotId, part: u32) {
        let split = {
            let kcmd = self.pool.slot(slot);
            kcmd.is_split()
        };
        if let Err(err) = self.cores.bind(core, slot, split.then_some(part)) {
            tracing::error!(core, slot, error = %err, "bind failed");
            self.fail_unbound(slot, err);
            return;
        }
        {
            let mut kcmd = self.pool.slot(slot);
            kcmd.occupied_core = Some(core);
            if let Some(entry) = kcmd.sub_cmd_core.get_mut(part as usize) {
                *entry = Some(core);
            }
        }
        if let Err(err) = self.program(core, slot, part) {
            tracing::error!(core, slot, error = %err, "programming failed");
            self.pool.slot(slot).error = Some(err);
            self.wake.raise();
        }
    }

    /// Enable, map, validate, write registers, wait acquire fences and trigger.
    fn program(&self, core: CoreId, slot: SlotId, part: u32) -> Result<()> {
        self.hw.enable(core).map_err(|err| {
            tracing::warn!(core, error = %err, "core enable failed");
            GspnError::CoreEnable(core)
        })?;

        let mut kcmd = self.pool.slot(slot);
        self.map_buffers(&mut kcmd, core)?;
        program::validate(self.capability(), &kcmd.cmd)?;
        if kcmd.cmd.misc.scale_en {
            let key = CoefKey::for_cmd(&kcmd.cmd);
            let mut coef = self.coef.lock();
            program::write_coefficients(self.hw.as_ref(), core, coef.get(&key));
        }
        program::write_registers(self.hw.as_ref(), core, &kcmd.cmd, part);
        self.cores.set_status(core, CoreStatus::Configured);

        if kcmd.is_async() && !kcmd.acq_fences.is_empty() {
            let fences = std::mem::take(&mut kcmd.acq_fences);
            drop(kcmd);
            self.wait_acquire_fences(slot, fences);
            kcmd = self.pool.slot(slot);
        }

        kcmd.start_time = Some(Instant::now());
        program::trigger(self.hw.as_ref(), core);
        Stats::bump(&self.stats.triggers);
        self.cores.set_status(core, CoreStatus::Busy);
        tracing::debug!(core, slot, part, "triggered");
        Ok(())
    }

    /// Map every resolved buffer onto `core` and fill in the plane addresses.
    fn map_buffers(&self, kcmd: &mut Kcmd, core: CoreId) -> Result<()> {
        kcmd.mapped_core = Some(core);
        for id in LayerId::ALL {
            let i = id.index();
            let Some(handle) = kcmd.buffers[i] else {
                continue;
            };
            let addr = self.buffers.map(core, &handle).map_err(|err| {
                tracing::warn!(core, layer = id.name(), error = %err, "buffer map failed");
                GspnError::Map { layer: id, core }
            })?;
            kcmd.mapped[i] = true;
            let layer = kcmd.cmd.layer_mut(id);
            layer.addr = PlaneAddr {
                y: addr.0,
                u: addr.0.wrapping_add(layer.uv_offset),
                v: addr.0.wrapping_add(layer.v_offset),
            };
        }
        Ok(())
    }

    pub(crate) fn unmap_buffers(&self, kcmd: &mut Kcmd) {
        let Some(core) = kcmd.mapped_core.take() else {
            return;
        };
        for i in 0..kcmd.mapped.len() {
            if !std::mem::take(&mut kcmd.mapped[i]) {
                continue;
            }
            if let Some(handle) = &kcmd.buffers[i] {
                self.buffers.unmap(core, handle);
            }
        }
    }

    /// Wait on each fence in turn; after the first failure the rest get the short timeout.
    fn wait_acquire_fences(&self, slot: SlotId, fences: Vec<FenceHandle>) {
        let mut timeout = self.config.fence_wait();
        for fence in fences {
            if let Err(err) = self.fences.wait(&fence, timeout) {
                tracing::warn!(slot, error = %err, "acquire fence wait failed");
                Stats::bump(&self.stats.fence_wait_failures);
                timeout = self.config.fence_wait_degraded();
            }
            self.fences.put(fence);
        }
    }
}
