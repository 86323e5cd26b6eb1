use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use crate::error::{GspnError, Result};
use crate::kcmd::{Frame, Kcmd, Location, SlotId};

#[derive(Debug, Default)]
struct EmptyList {
    queue: VecDeque<SlotId>,
    releases: u64,
}

/// Fixed arena of command slots plus the empty and dissociation lists.
///
/// Per-core fill lists live in [`crate::cores::CoreManager`]. Lock order is
/// fill lists, then dissociation, then empty, then individual slots.
#[derive(Debug)]
pub struct CommandPool {
    slots: Box<[Mutex<Kcmd>]>,
    empty: Mutex<EmptyList>,
    capacity: Condvar,
    dissociation: Mutex<VecDeque<SlotId>>,
}

impl CommandPool {
    /// Pool of `size` slots, all on the empty list.
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Mutex::new(Kcmd::default())).collect(),
            empty: Mutex::new(EmptyList {
                queue: (0..size).collect(),
                releases: 0,
            }),
            capacity: Condvar::new(),
            dissociation: Mutex::new(VecDeque::new()),
        }
    }

    /// Total slot count.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Lock one slot.
    pub fn slot(&self, id: SlotId) -> MutexGuard<'_, Kcmd> {
        self.slots[id].lock()
    }

    /// Slots currently on the empty list.
    pub fn empty_len(&self) -> usize {
        self.empty.lock().queue.len()
    }

    /// Slots currently on the dissociation list.
    pub fn dissociated_len(&self) -> usize {
        self.dissociation.lock().len()
    }

    /// Number of release operations performed so far.
    pub fn releases(&self) -> u64 {
        self.empty.lock().releases
    }

    /// Take exactly `n` slots or none.
    pub fn try_acquire(&self, n: usize) -> Result<Vec<SlotId>> {
        let mut empty = self.empty.lock();
        if empty.queue.len() < n {
            return Err(GspnError::InsufficientCapacity {
                need: n,
                have: empty.queue.len(),
            });
        }
        Ok(self.take(&mut empty, n))
    }

    /// Wait until `n` slots are free, `interrupt` reports a reason to stop, or `deadline` passes.
    pub fn acquire_blocking(
        &self,
        n: usize,
        deadline: Instant,
        interrupt: impl Fn() -> Option<GspnError>,
    ) -> Result<Vec<SlotId>> {
        if n > self.size() {
            return Err(GspnError::InsufficientCapacity {
                need: n,
                have: self.size(),
            });
        }
        let mut empty = self.empty.lock();
        loop {
            if let Some(err) = interrupt() {
                return Err(err);
            }
            if empty.queue.len() >= n {
                return Ok(self.take(&mut empty, n));
            }
            if self.capacity.wait_until(&mut empty, deadline).timed_out() {
                if let Some(err) = interrupt() {
                    return Err(err);
                }
                if empty.queue.len() >= n {
                    return Ok(self.take(&mut empty, n));
                }
                tracing::warn!(need = n, have = empty.queue.len(), "timed out waiting for free command slots");
                return Err(GspnError::Timeout);
            }
        }
    }

    fn take(&self, empty: &mut EmptyList, n: usize) -> Vec<SlotId> {
        let ids: Vec<SlotId> = empty.queue.drain(..n).collect();
        for &id in &ids {
            let mut kcmd = self.slots[id].lock();
            kcmd.reset();
            kcmd.location = Location::Claimed;
        }
        ids
    }

    /// Return slots that are on no list to the empty list.
    pub fn release(&self, ids: &[SlotId]) {
        if ids.is_empty() {
            return;
        }
        let mut empty = self.empty.lock();
        self.push_empty(&mut empty, ids.iter().copied());
    }

    fn push_empty(&self, empty: &mut EmptyList, ids: impl IntoIterator<Item = SlotId>) {
        for id in ids {
            let mut kcmd = self.slots[id].lock();
            kcmd.reset();
            kcmd.location = Location::Empty;
            empty.queue.push_back(id);
        }
        empty.releases += 1;
        self.capacity.notify_all();
    }

    /// Wake capacity waiters so they re-check their interrupt conditions.
    pub fn wake_waiters(&self) {
        let _empty = self.empty.lock();
        self.capacity.notify_all();
    }

    /// Put a slot just taken off a fill list onto the dissociation list.
    ///
    /// Call with the fill list still locked so the slot is never on no list.
    pub fn dissociate(&self, id: SlotId) {
        let mut dissociation = self.dissociation.lock();
        dissociation.push_back(id);
        self.slots[id].lock().location = Location::Dissociated;
    }

    /// Move every dissociated member of `frame` to the empty list in one step.
    pub fn retire_frame(&self, frame: &Arc<Frame>) -> usize {
        let mut dissociation = self.dissociation.lock();
        let mut empty = self.empty.lock();
        let mut members = Vec::new();
        dissociation.retain(|&id| {
            if self.slots[id].lock().in_frame(frame) {
                members.push(id);
                false
            } else {
                true
            }
        });
        let moved = members.len();
        if moved > 0 {
            self.push_empty(&mut empty, members);
        }
        moved
    }

    /// Move one dissociated slot to the empty list, ignoring its frame.
    pub fn retire_single(&self, id: SlotId) -> bool {
        let mut dissociation = self.dissociation.lock();
        let Some(pos) = dissociation.iter().position(|&d| d == id) else {
            return false;
        };
        dissociation.remove(pos);
        let mut empty = self.empty.lock();
        self.push_empty(&mut empty, [id]);
        true
    }

    /// Move the whole dissociation list to the empty list.
    pub fn flush_dissociation(&self) -> usize {
        let mut dissociation = self.dissociation.lock();
        if dissociation.is_empty() {
            return 0;
        }
        let mut empty = self.empty.lock();
        let ids: Vec<SlotId> = dissociation.drain(..).collect();
        let moved = ids.len();
        self.push_empty(&mut empty, ids);
        moved
    }

    /// Rebuild the empty list from the slot array.
    ///
    /// Only valid once every core is free and every fill list is empty.
    /// Slots held by an in-progress submission are left alone. Returns true
    /// when the lists had drifted and were repaired.
    pub fn recover_leaks(&self) -> bool {
        let mut dissociation = self.dissociation.lock();
        let mut empty = self.empty.lock();
        let claimed: Vec<SlotId> = (0..self.size())
            .filter(|&id| self.slots[id].lock().location == Location::Claimed)
            .collect();
        let expected = self.size() - claimed.len();
        let listed: HashSet<SlotId> = empty.queue.iter().copied().collect();
        let drifted = !dissociation.is_empty()
            || empty.queue.len() != expected
            || listed.len() != empty.queue.len();
        if !drifted {
            return false;
        }
        tracing::warn!(
            empty = empty.queue.len(),
            expected,
            dissociated = dissociation.len(),
            "command pool lists drifted, rebuilding empty list"
        );
        dissociation.clear();
        empty.queue.clear();
        let free: Vec<SlotId> = (0..self.size()).filter(|id| !claimed.contains(id)).collect();
        self.push_empty(&mut empty, free);
        true
    }

    pub(crate) fn snapshot_lists(&self) -> (Vec<SlotId>, Vec<SlotId>) {
        let dissociation = self.dissociation.lock();
        let empty = self.empty.lock();
        (
            empty.queue.iter().copied().collect(),
            dissociation.iter().copied().collect(),
        )
    }
}

/// Point-in-time view of which list holds each slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    /// Pool size.
    pub total: usize,
    /// Empty list contents.
    pub empty: Vec<SlotId>,
    /// Fill list contents per core.
    pub fill: Vec<Vec<SlotId>>,
    /// Dissociation list contents.
    pub dissociation: Vec<SlotId>,
}

impl Occupancy {
    /// Slots on any list.
    pub fn listed(&self) -> usize {
        self.empty.len() + self.fill.iter().map(Vec::len).sum::<usize>() + self.dissociation.len()
    }

    /// Slots held by in-progress submissions or the drain.
    pub fn claimed(&self) -> usize {
        self.total.saturating_sub(self.listed())
    }

    /// Every slot is on exactly one list.
    pub fn is_conserved(&self) -> bool {
        self.listed() == self.total && self.is_exclusive()
    }

    /// No slot appears twice across the lists.
    pub fn is_exclusive(&self) -> bool {
        let mut seen = HashSet::new();
        self.empty
            .iter()
            .chain(self.fill.iter().flatten())
            .chain(self.dissociation.iter())
            .all(|id| seen.insert(*id))
    }
}

/// Slots taken from the pool by one submission.
///
/// Dropping the guard before [`ClaimedSlots::commit`] returns the slots to
/// the empty list after running `rollback` on each.
pub struct ClaimedSlots<'a> {
    pool: &'a CommandPool,
    ids: Vec<SlotId>,
    rollback: Option<Box<dyn FnMut(&mut Kcmd) + 'a>>,
}

impl<'a> ClaimedSlots<'a> {
    /// Guard `ids`, running `rollback` on every slot if the submission fails.
    pub fn new(
        pool: &'a CommandPool,
        ids: Vec<SlotId>,
        rollback: impl FnMut(&mut Kcmd) + 'a,
    ) -> Self {
        Self {
            pool,
            ids,
            rollback: Some(Box::new(rollback)),
        }
    }

    /// Claimed slot ids in submission order.
    pub fn ids(&self) -> &[SlotId] {
        &self.ids
    }

    /// The slots now belong to a fill list.
    pub fn commit(mut self) {
        self.rollback = None;
        self.ids.clear();
    }
}

impl Drop for ClaimedSlots<'_> {
    fn drop(&mut self) {
        let Some(mut rollback) = self.rollback.take() else {
            return;
        };
        for &id in &self.ids {
            rollback(&mut *self.pool.slot(id));
        }
        tracing::debug!(slots = self.ids.len(), "rolling back claimed command slots");
        self.pool.release(&self.ids);
    }
}
