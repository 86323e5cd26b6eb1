use gspn_core::cores::CoreManager;
use gspn_core::hal::TimelineHandle;
use gspn_core::kcmd::{Location, SlotId};
use gspn_core::pool::CommandPool;
use proptest::prelude::*;

const SLOTS: usize = 12;
const CORES: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Enqueue(usize),
    Abandon,
    Pop(usize),
    RetireOne,
    Flush,
    Drain,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..=4usize).prop_map(Op::Acquire),
        (0..CORES).prop_map(Op::Enqueue),
        Just(Op::Abandon),
        (0..CORES).prop_map(Op::Pop),
        Just(Op::RetireOne),
        Just(Op::Flush),
        Just(Op::Drain),
    ]
}

fn check(pool: &CommandPool, cores: &CoreManager, claimed: &[Vec<SlotId>]) {
    let held: usize = claimed.iter().map(Vec::len).sum();
    let fill: usize = cores.iter().map(|core| core.fill_len()).sum();
    assert_eq!(pool.empty_len() + fill + pool.dissociated_len() + held, SLOTS);

    let count = |want: Location| {
        (0..SLOTS)
            .filter(|&id| pool.slot(id).location == want)
            .count()
    };
    assert_eq!(count(Location::Empty), pool.empty_len());
    assert_eq!(count(Location::Dissociated), pool.dissociated_len());
    assert_eq!(count(Location::Claimed), held);
    for core in cores.iter() {
        assert_eq!(count(Location::Fill(core.id())), core.fill_len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_slot_stays_on_exactly_one_list(ops in prop::collection::vec(op(), 1..60)) {
        let pool = CommandPool::new(SLOTS);
        let cores = CoreManager::new((0..CORES as u64).map(TimelineHandle).collect());
        let mut claimed: Vec<Vec<SlotId>> = Vec::new();
        let mut dissociated: Vec<SlotId> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(n) => {
                    let before = pool.empty_len();
                    match pool.try_acquire(n) {
                        Ok(ids) => {
                            prop_assert_eq!(ids.len(), n);
                            claimed.push(ids);
                        }
                        Err(_) => prop_assert_eq!(pool.empty_len(), before),
                    }
                }
                Op::Enqueue(core) => {
                    if let Some(ids) = claimed.pop() {
                        cores.enqueue_fill(core, &ids, &pool);
                    }
                }
                Op::Abandon => {
                    if let Some(ids) = claimed.pop() {
                        pool.release(&ids);
                    }
                }
                Op::Pop(core) => {
                    if let Some(id) = cores.pop_fill(core, &pool) {
                        dissociated.push(id);
                    }
                }
                Op::RetireOne => {
                    if let Some(id) = dissociated.pop() {
                        prop_assert!(pool.retire_single(id));
                    }
                }
                Op::Flush => {
                    prop_assert_eq!(pool.flush_dissociation(), dissociated.len());
                    dissociated.clear();
                }
                Op::Drain => {
                    let drained = cores.drain_fill();
                    pool.release(&drained);
                }
            }
            check(&pool, &cores, &claimed);
        }

        for ids in claimed.drain(..) {
            pool.release(&ids);
        }
        let drained = cores.drain_fill();
        pool.release(&drained);
        pool.flush_dissociation();
        prop_assert!(!pool.recover_leaks());
        prop_assert_eq!(pool.empty_len(), SLOTS);
    }
}
