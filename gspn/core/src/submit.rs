//! Caller side of `SET_PARAM`: slot acquisition, buffer resolution, fence
//! setup and the synchronous completion wait.

use std::sync::atomic::Ordering;
use std::time::Instant;

use gspn_spec::{CmdInfo, LayerId, NO_FD};

use crate::device::{Shared, Stats};
use crate::error::{GspnError, Result};
use crate::hal::{CoreId, FenceHandle};
use crate::kcmd::{Frame, Kcmd};
use crate::pool::ClaimedSlots;
use crate::program;

impl Shared {
    pub(crate) fn submit(&self, cmds: &mut [CmdInfo], async_flag: bool, pid: u32) -> Result<()> {
        let span = tracing::info_span!(
            "gspn_submit",
            pid,
            count = cmds.len(),
            async_flag,
            core = tracing::field::Empty
        );
        let _enter = span.enter();

        let n = cmds.len();
        if n == 0 || n > self.config.cmd_array_max {
            return Err(GspnError::InvalidArgument(format!(
                "command count {n} outside 1..={}",
                self.config.cmd_array_max
            )));
        }
        if let Some(err) = self.interrupt_reason() {
            return Err(err);
        }

        let deadline = Instant::now() + self.config.capacity_wait();
        let ids = self
            .pool
            .acquire_blocking(n, deadline, || self.interrupt_reason())?;
        let claimed = ClaimedSlots::new(&self.pool, ids, |kcmd| self.rollback_slot(kcmd));
        let frame = Frame::new(n, async_flag);

        for (index, (user, &id)) in cmds.iter().zip(claimed.ids()).enumerate() {
            let mut cmd = *user;
            cmd.misc.async_flag = async_flag;
            if !async_flag {
                cmd.clear_fences();
            }
            program::apply_enable_rules(&mut cmd)?;

            let mut kcmd = self.pool.slot(id);
            kcmd.cmd = cmd;
            kcmd.pid = pid;
            kcmd.user_index = index;
            kcmd.sub_cmd_total = cmd.split_total();
            kcmd.frame = Some(frame.clone());
            self.resolve_buffers(&mut kcmd)?;
        }

        let core = self.cores.select_least_loaded()?;
        span.record("core", core);

        {
            let mut point = self.cores.core(core).fence_point();
            let base = *point;
            for &id in claimed.ids() {
                self.pool.slot(id).fence_core = core;
            }
            if async_flag {
                for (k, &id) in claimed.ids().iter().enumerate() {
                    let mut kcmd = self.pool.slot(id);
                    self.import_acquire_fences(&mut kcmd)?;
                    self.create_release_fences(&mut kcmd, core, base + k as u64 + 1)?;
                }
                *point = base + n as u64;
                self.remain_async.fetch_add(n, Ordering::AcqRel);
            }
            self.cores.enqueue_fill(core, claimed.ids(), &self.pool);
        }

        if async_flag {
            for (user, &id) in cmds.iter_mut().zip(claimed.ids()) {
                let kcmd = self.pool.slot(id);
                for dest in LayerId::DESTINATIONS {
                    user.layer_mut(dest).rls_fen_fd = kcmd.cmd.layer(dest).rls_fen_fd;
                }
            }
        }
        claimed.commit();
        Stats::bump(&self.stats.frames);
        self.stats.commands.fetch_add(n as u64, Ordering::Relaxed);
        tracing::debug!(frame = frame.id(), "frame queued");
        self.wake.raise();

        if async_flag {
            return Ok(());
        }
        self.wait_sync(&frame)
    }

    fn wait_sync(&self, frame: &Frame) -> Result<()> {
        let deadline = Instant::now() + self.config.sync_wait();
        let all_done = || frame.done_count().is_some_and(|done| done >= frame.len());
        self.sync_done
            .wait_until(deadline, || all_done() || self.interrupt_reason().is_some());
        if all_done() {
            return match frame.first_error() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        if let Some(err) = self.interrupt_reason() {
            return Err(err);
        }
        tracing::warn!(
            frame = frame.id(),
            done = frame.done_count().unwrap_or(0),
            total = frame.len(),
            "synchronous frame did not complete in time"
        );
        Err(GspnError::Timeout)
    }

    /// Take a reference on every enabled layer's buffer. Layers holding the
    /// sentinel fd never reach the provider.
    fn resolve_buffers(&self, kcmd: &mut Kcmd) -> Result<()> {
        for id in LayerId::ALL {
            let layer = kcmd.cmd.layer(id);
            if !layer.has_buffer() {
                continue;
            }
            let fd = layer.share_fd;
            match self.buffers.resolve(fd) {
                Ok(handle) => kcmd.buffers[id.index()] = Some(handle),
                Err(err) => {
                    tracing::warn!(layer = id.name(), fd, error = %err, "buffer resolution failed");
                    return Err(GspnError::BufferResolution { layer: id, fd });
                }
            }
        }
        Ok(())
    }

    fn import_acquire_fences(&self, kcmd: &mut Kcmd) -> Result<()> {
        for id in LayerId::ALL {
            let layer = kcmd.cmd.layer(id);
            if !layer.has_acquire_fence() {
                continue;
            }
            let fd = layer.acq_fen_fd;
            let fence = self
                .fences
                .import(fd)
                .map_err(|err| GspnError::FenceCreation(format!("acquire fd {fd}: {err}")))?;
            kcmd.acq_fences.push(fence);
        }
        Ok(())
    }

    /// One release fence per enabled destination, all at `target` on `core`'s timeline.
    fn create_release_fences(&self, kcmd: &mut Kcmd, core: CoreId, target: u64) -> Result<()> {
        let timeline = *self.cores.core(core).timeline();
        for dest in LayerId::DESTINATIONS {
            if !kcmd.cmd.layer(dest).layer_en {
                kcmd.cmd.layer_mut(dest).rls_fen_fd = NO_FD;
                continue;
            }
            let (fence, fd): (FenceHandle, i32) = self
                .fences
                .create_fence(&timeline, target)
                .map_err(|err| GspnError::FenceCreation(err.to_string()))?;
            kcmd.rls_fences.push(fence);
            kcmd.cmd.layer_mut(dest).rls_fen_fd = fd;
        }
        Ok(())
    }

    /// Undo everything a failed submission took for one slot.
    fn rollback_slot(&self, kcmd: &mut Kcmd) {
        for handle in kcmd.buffers.iter_mut().filter_map(Option::take) {
            self.buffers.release(handle);
        }
        for fence in kcmd.acq_fences.drain(..).chain(kcmd.rls_fences.drain(..)) {
            self.fences.put(fence);
        }
    }
}
