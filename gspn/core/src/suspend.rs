//! Suspend and resume.
//!
//! A suspend bumps the round counter, raises the flag and wakes everybody.
//! While the flag is up the worker stops dispatching, hands queued commands
//! back unexecuted and, once every core is idle, completes the round the
//! caller is waiting on.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::device::{Shared, SuspendOutcome};
use crate::error::GspnError;
use crate::worker::WorkerState;

impl Shared {
    /// One worker pass while suspending.
    pub(crate) fn suspend_pass(&self, state: &mut WorkerState) {
        while let Some((slot, _)) = state.pending_splits.pop_front() {
            self.fail_unbound(slot, GspnError::DeviceSuspended);
        }

        let drained = self.cores.drain_fill();
        if !drained.is_empty() {
            for &slot in &drained {
                let mut kcmd = self.pool.slot(slot);
                for fence in kcmd.acq_fences.drain(..) {
                    self.fences.put(fence);
                }
                for handle in kcmd.buffers.iter_mut().filter_map(Option::take) {
                    self.buffers.release(handle);
                }
                kcmd.error = Some(GspnError::DeviceSuspended);
                kcmd.done_flag = true;
                self.discharge(&mut kcmd);
                if let Some(frame) = kcmd.frame.clone() {
                    frame.mark_completed();
                }
            }
            self.stats
                .drained
                .fetch_add(drained.len() as u64, Ordering::Relaxed);
            self.pool.release(&drained);
            tracing::info!(count = drained.len(), "returned queued commands unexecuted");
        }

        let round = self.suspend_round.load(Ordering::Acquire);
        if round <= state.settled_round || !self.cores.all_free() {
            return;
        }
        let flushed = self.pool.flush_dissociation();
        if self.pool.recover_leaks() {
            self.stats.leak_repairs.fetch_add(1, Ordering::Relaxed);
        }
        state.settled_round = round;
        tracing::info!(round, flushed, "pipeline drained for suspend");
        self.suspend_done.complete(round);
    }

    pub(crate) fn suspend(&self) -> SuspendOutcome {
        let round = self.suspend_round.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(round, "suspend requested");
        self.set_suspending(true);
        self.wake_everyone();

        let deadline = Instant::now() + self.config.suspend_wait();
        if self.suspend_done.wait_until(round, deadline) {
            return SuspendOutcome::Drained;
        }
        for core in self.cores.iter() {
            let registers = self.hw.dump_registers(core.id());
            tracing::error!(
                core = core.id(),
                status = ?core.status(),
                registers = ?registers,
                "suspend drain overran its wait"
            );
        }
        SuspendOutcome::Forced
    }

    pub(crate) fn resume(&self) {
        self.coef.lock().invalidate();
        self.set_suspending(false);
        tracing::info!("resumed");
        self.wake.raise();
    }
}
