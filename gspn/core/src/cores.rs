use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::error::{GspnError, Result};
use crate::hal::{CoreId, TimelineHandle};
use crate::kcmd::{Location, SlotId};
use crate::pool::CommandPool;

/// Hardware core state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoreStatus {
    /// No command bound.
    Free,
    /// Command bound, not yet programmed.
    Occupied,
    /// Registers written, waiting on acquire fences or trigger.
    Configured,
    /// Triggered and running.
    Busy,
}

#[derive(Debug)]
struct CoreState {
    status: CoreStatus,
    current: Option<SlotId>,
    sub_index: Option<u32>,
}

/// One hardware execution unit.
#[derive(Debug)]
pub struct Core {
    id: CoreId,
    state: Mutex<CoreState>,
    fill: Mutex<VecDeque<SlotId>>,
    timeline: TimelineHandle,
    // Next timeline point to hand out; guards fence creation and the matching enqueue.
    fence_point: Mutex<u64>,
}

impl Core {
    fn new(id: CoreId, timeline: TimelineHandle) -> Self {
        Self {
            id,
            state: Mutex::new(CoreState {
                status: CoreStatus::Free,
                current: None,
                sub_index: None,
            }),
            fill: Mutex::new(VecDeque::new()),
            timeline,
            fence_point: Mutex::new(0),
        }
    }

    /// Core index.
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Timeline signalled when this core retires an asynchronous command.
    pub fn timeline(&self) -> &TimelineHandle {
        &self.timeline
    }

    /// Current status.
    pub fn status(&self) -> CoreStatus {
        self.state.lock().status
    }

    /// Bound command and split part, if any.
    pub fn current(&self) -> Option<(SlotId, Option<u32>)> {
        let state = self.state.lock();
        state.current.map(|slot| (slot, state.sub_index))
    }

    /// Queued commands.
    pub fn fill_len(&self) -> usize {
        self.fill.lock().len()
    }

    pub(crate) fn fence_point(&self) -> MutexGuard<'_, u64> {
        self.fence_point.lock()
    }
}

/// Owner of every core, their fill lists and the free-core count.
#[derive(Debug)]
pub struct CoreManager {
    cores: Vec<Core>,
    free_cnt: AtomicUsize,
}

impl CoreManager {
    /// One core per timeline, all free.
    pub fn new(timelines: Vec<TimelineHandle>) -> Self {
        let cores: Vec<Core> = timelines
            .into_iter()
            .enumerate()
            .map(|(id, timeline)| Core::new(id, timeline))
            .collect();
        let free_cnt = AtomicUsize::new(cores.len());
        Self { cores, free_cnt }
    }

    /// Number of cores.
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Whether there are no cores.
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Borrow one core.
    pub fn core(&self, id: CoreId) -> &Core {
        &self.cores[id]
    }

    /// Iterate cores in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Core> {
        self.cores.iter()
    }

    /// Cores with nothing bound.
    pub fn free_count(&self) -> usize {
        self.free_cnt.load(Ordering::Acquire)
    }

    /// Every core is free.
    pub fn all_free(&self) -> bool {
        self.free_count() == self.cores.len()
    }

    /// Core with the shortest fill list; the lowest id wins ties.
    pub fn select_least_loaded(&self) -> Result<CoreId> {
        let mut best: Option<(CoreId, usize)> = None;
        for core in &self.cores {
            let len = core.fill_len();
            if best.map_or(true, |(_, best_len)| len < best_len) {
                best = Some((core.id, len));
            }
        }
        best.map(|(id, _)| id)
            .ok_or_else(|| GspnError::InvalidArgument("no cores configured".into()))
    }

    /// Bind `slot` (part `sub_index` of a split command) to a free core.
    pub fn bind(&self, id: CoreId, slot: SlotId, sub_index: Option<u32>) -> Result<()> {
        let mut state = self.cores[id].state.lock();
        if state.status != CoreStatus::Free {
            return Err(GspnError::CoreNotFree(id));
        }
        state.status = CoreStatus::Occupied;
        state.current = Some(slot);
        state.sub_index = sub_index;
        self.free_cnt.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Move a bound core between Occupied, Configured and Busy.
    pub fn set_status(&self, id: CoreId, status: CoreStatus) {
        let mut state = self.cores[id].state.lock();
        debug_assert!(status != CoreStatus::Free && state.current.is_some());
        state.status = status;
    }

    /// Release the core; returns what was bound to it.
    pub fn unbind(&self, id: CoreId) -> Option<(SlotId, Option<u32>)> {
        let mut state = self.cores[id].state.lock();
        let slot = state.current.take()?;
        let sub_index = state.sub_index.take();
        state.status = CoreStatus::Free;
        self.free_cnt.fetch_add(1, Ordering::AcqRel);
        Some((slot, sub_index))
    }

    /// Append `ids` to a core's fill list in order.
    pub fn enqueue_fill(&self, id: CoreId, ids: &[SlotId], pool: &CommandPool) {
        let mut fill = self.cores[id].fill.lock();
        for &slot in ids {
            pool.slot(slot).location = Location::Fill(id);
            fill.push_back(slot);
        }
    }

    /// Pop the head of a core's fill list onto the dissociation list.
    pub fn pop_fill(&self, id: CoreId, pool: &CommandPool) -> Option<SlotId> {
        let mut fill = self.cores[id].fill.lock();
        let slot = fill.pop_front()?;
        pool.dissociate(slot);
        Some(slot)
    }

    /// Empty every fill list; returns the slots in core then queue order.
    pub fn drain_fill(&self) -> Vec<SlotId> {
        let mut guards = self.fill_guards();
        guards.iter_mut().flat_map(|fill| fill.drain(..)).collect()
    }

    /// Some fill list is non-empty.
    pub fn has_queued(&self) -> bool {
        self.cores.iter().any(|core| core.fill_len() > 0)
    }

    /// Lock every fill list in id order.
    pub(crate) fn fill_guards(&self) -> Vec<MutexGuard<'_, VecDeque<SlotId>>> {
        self.cores.iter().map(|core| core.fill.lock()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> CoreManager {
        CoreManager::new((0..n as u64).map(TimelineHandle).collect())
    }

    fn load(mgr: &CoreManager, pool: &CommandPool, counts: &[usize]) {
        for (core, &count) in counts.iter().enumerate() {
            let ids = pool.try_acquire(count).unwrap();
            mgr.enqueue_fill(core, &ids, pool);
        }
    }

    #[test]
    fn least_loaded_picks_shortest_queue() {
        let mgr = manager(3);
        let pool = CommandPool::new(8);
        load(&mgr, &pool, &[3, 1, 2]);
        assert_eq!(mgr.select_least_loaded().unwrap(), 1);
    }

    #[test]
    fn least_loaded_tie_goes_to_lowest_id() {
        let mgr = manager(2);
        let pool = CommandPool::new(8);
        load(&mgr, &pool, &[2, 2]);
        assert_eq!(mgr.select_least_loaded().unwrap(), 0);
    }

    #[test]
    fn bind_requires_free_core() {
        let mgr = manager(1);
        mgr.bind(0, 4, None).unwrap();
        assert_eq!(mgr.free_count(), 0);
        assert_eq!(mgr.core(0).status(), CoreStatus::Occupied);
        assert_eq!(mgr.bind(0, 5, None), Err(GspnError::CoreNotFree(0)));

        mgr.set_status(0, CoreStatus::Busy);
        assert_eq!(mgr.unbind(0), Some((4, None)));
        assert!(mgr.all_free());
        assert_eq!(mgr.core(0).current(), None);
        assert_eq!(mgr.unbind(0), None);
        assert_eq!(mgr.free_count(), 1);
    }

    #[test]
    fn fill_list_is_fifo() {
        let mgr = manager(1);
        let pool = CommandPool::new(3);
        let ids = pool.try_acquire(3).unwrap();
        mgr.enqueue_fill(0, &ids, &pool);
        assert_eq!(pool.slot(ids[1]).location, Location::Fill(0));
        let popped: Vec<_> = std::iter::from_fn(|| mgr.pop_fill(0, &pool)).collect();
        assert_eq!(popped, ids);
        assert_eq!(pool.slot(ids[2]).location, Location::Dissociated);
    }

    #[test]
    fn drain_empties_every_fill_list() {
        let mgr = manager(2);
        let pool = CommandPool::new(4);
        load(&mgr, &pool, &[1, 2]);
        assert_eq!(mgr.drain_fill().len(), 3);
        assert!(!mgr.has_queued());
    }

    #[test]
    fn no_cores_is_a_configuration_error() {
        assert!(manager(0).select_least_loaded().is_err());
    }
}
