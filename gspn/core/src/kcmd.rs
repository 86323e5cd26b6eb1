use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gspn_spec::{CmdInfo, LAYER_COUNT, SPLIT_PARTS_MAX};
use parking_lot::Mutex;

use crate::error::GspnError;
use crate::hal::{BufferHandle, CoreId, FenceHandle};

/// Index of a slot in the command pool.
pub type SlotId = usize;

/// Which list currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// On the empty list.
    Empty,
    /// Held by a submitter between acquire and enqueue.
    Claimed,
    /// Queued on a core's fill list.
    Fill(CoreId),
    /// In flight on the dissociation list.
    Dissociated,
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Batch of commands submitted by one call and retired together.
#[derive(Debug)]
pub struct Frame {
    id: u64,
    len: u32,
    async_flag: bool,
    done_cnt: Option<AtomicU32>,
    completed: AtomicU32,
    first_error: Mutex<Option<GspnError>>,
}

impl Frame {
    /// Frame of `len` commands; synchronous frames carry a done counter.
    pub fn new(len: usize, async_flag: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            len: len as u32,
            async_flag,
            done_cnt: (!async_flag).then(|| AtomicU32::new(0)),
            completed: AtomicU32::new(0),
            first_error: Mutex::new(None),
        })
    }

    /// Process-unique id used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of member commands.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the frame has no members.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Submitted asynchronously.
    pub fn is_async(&self) -> bool {
        self.async_flag
    }

    /// Completions reported to the synchronous waiter; `None` for asynchronous frames.
    pub fn done_count(&self) -> Option<u32> {
        self.done_cnt.as_ref().map(|cnt| cnt.load(Ordering::Acquire))
    }

    /// Count one member towards the synchronous waiter; false when there is no counter.
    pub(crate) fn bump_done(&self) -> bool {
        match &self.done_cnt {
            Some(cnt) => {
                cnt.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Members whose `done_flag` is set.
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Record one member as done; returns true once every member is.
    pub(crate) fn mark_completed(&self) -> bool {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1 >= self.len
    }

    /// Keep the first failure reported by any member.
    pub(crate) fn record_error(&self, err: &GspnError) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err.clone());
        }
    }

    /// First failure reported by any member.
    pub fn first_error(&self) -> Option<GspnError> {
        self.first_error.lock().clone()
    }
}

/// One command slot.
#[derive(Debug)]
pub struct Kcmd {
    /// Current owner list.
    pub location: Location,
    /// Copy of the submitted command, with derived flags applied.
    pub cmd: CmdInfo,
    /// Submitting process.
    pub pid: u32,
    /// Position inside the caller's command array.
    pub user_index: usize,
    /// Resolved buffer per layer.
    pub buffers: [Option<BufferHandle>; LAYER_COUNT],
    /// Layers whose buffer is mapped onto `mapped_core`.
    pub mapped: [bool; LAYER_COUNT],
    /// Core the buffers are currently mapped onto.
    pub mapped_core: Option<CoreId>,
    /// Imported acquire fences, consumed before trigger.
    pub acq_fences: Vec<FenceHandle>,
    /// Release fences handed to the caller.
    pub rls_fences: Vec<FenceHandle>,
    /// Trigger cycles this command needs.
    pub sub_cmd_total: u32,
    /// Trigger cycles finished.
    pub sub_cmd_done_cnt: u32,
    /// Core that ran each part.
    pub sub_cmd_core: [Option<CoreId>; SPLIT_PARTS_MAX as usize],
    /// Set exactly once, when the command fully completes.
    pub done_flag: bool,
    /// Failure to report on completion.
    pub error: Option<GspnError>,
    /// Trigger time of the current part.
    pub start_time: Option<Instant>,
    /// Core the command is bound to.
    pub occupied_core: Option<CoreId>,
    /// Core whose fill queue took the command; its timeline carries the release fences
    /// and every split part runs there.
    pub fence_core: CoreId,
    /// Batch this command belongs to.
    pub frame: Option<Arc<Frame>>,
}

impl Default for Kcmd {
    fn default() -> Self {
        Self {
            location: Location::Empty,
            cmd: CmdInfo::default(),
            pid: 0,
            user_index: 0,
            buffers: [None; LAYER_COUNT],
            mapped: [false; LAYER_COUNT],
            mapped_core: None,
            acq_fences: Vec::new(),
            rls_fences: Vec::new(),
            sub_cmd_total: 1,
            sub_cmd_done_cnt: 0,
            sub_cmd_core: [None; SPLIT_PARTS_MAX as usize],
            done_flag: false,
            error: None,
            start_time: None,
            occupied_core: None,
            fence_core: 0,
            frame: None,
        }
    }
}

impl Kcmd {
    /// Zero the slot, keeping its location; every fd field returns to the sentinel.
    pub fn reset(&mut self) {
        let location = self.location;
        *self = Kcmd {
            location,
            ..Kcmd::default()
        };
    }

    /// Whether this slot belongs to `frame`.
    pub fn in_frame(&self, frame: &Arc<Frame>) -> bool {
        self.frame.as_ref().is_some_and(|own| Arc::ptr_eq(own, frame))
    }

    /// Command is split across more than one trigger.
    pub fn is_split(&self) -> bool {
        self.sub_cmd_total > 1
    }

    /// Asynchronous command.
    pub fn is_async(&self) -> bool {
        self.cmd.misc.async_flag
    }

    /// Microseconds since the current part was triggered.
    pub fn exec_time_us(&self) -> u128 {
        self.start_time
            .map(|start| start.elapsed().as_micros())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gspn_spec::NO_FD;

    #[test]
    fn reset_restores_sentinels_and_keeps_location() {
        let mut kcmd = Kcmd {
            location: Location::Fill(1),
            ..Kcmd::default()
        };
        kcmd.cmd.layers[0].share_fd = 5;
        kcmd.done_flag = true;
        kcmd.buffers[0] = Some(BufferHandle(3));
        kcmd.reset();
        assert_eq!(kcmd.location, Location::Fill(1));
        assert!(!kcmd.done_flag);
        assert!(kcmd.buffers.iter().all(Option::is_none));
        assert_eq!(kcmd.cmd.layers[0].share_fd, NO_FD);
    }

    #[test]
    fn async_frames_have_no_done_counter() {
        let frame = Frame::new(2, true);
        assert_eq!(frame.done_count(), None);
        assert!(!frame.bump_done());

        let frame = Frame::new(2, false);
        assert!(frame.bump_done());
        assert_eq!(frame.done_count(), Some(1));
    }

    #[test]
    fn frame_completes_on_last_member() {
        let frame = Frame::new(3, false);
        assert!(!frame.mark_completed());
        assert!(!frame.mark_completed());
        assert!(frame.mark_completed());
        assert_eq!(frame.completed(), 3);
    }

    #[test]
    fn frame_identity_is_by_pointer() {
        let a = Frame::new(1, false);
        let b = Frame::new(1, false);
        let kcmd = Kcmd {
            frame: Some(a.clone()),
            ..Kcmd::default()
        };
        assert!(kcmd.in_frame(&a));
        assert!(!kcmd.in_frame(&b));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn first_error_sticks() {
        let frame = Frame::new(2, false);
        frame.record_error(&GspnError::Timeout);
        frame.record_error(&GspnError::Interrupted);
        assert_eq!(frame.first_error(), Some(GspnError::Timeout));
    }
}
