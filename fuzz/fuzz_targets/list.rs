#![no_main]

mod common;

use std::collections::HashSet;

use basis_sync::{List, NodeTable};
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

use self::common::{THREADS, run_threads};

#[derive(Debug, Arbitrary)]
enum Action {
    Insert,
    Pop { to: u8 },
    Push { index: u8, to: u8 },
    Steal { from: u8, to: u8 },
}

const LISTS: usize = 3;

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let table = NodeTable::new();
    let lists: [List<u64>; LISTS] = std::array::from_fn(|_| List::new(&table));

    run_threads(action_sets, |tid, actions| {
        let mut held = Vec::new();
        for action in actions {
            match action {
                Action::Insert => {
                    let id = table.insert((tid * 1_000_000 + held.len()) as u64);
                    held.push(id);
                }
                Action::Pop { to } => {
                    if let Some(id) = lists[to as usize % LISTS].try_pop(&table) {
                        held.push(id);
                    }
                }
                Action::Push { index, to } => {
                    if !held.is_empty() {
                        let id = held.swap_remove(index as usize % held.len());
                        lists[to as usize % LISTS].push(&table, id);
                    }
                }
                Action::Steal { from, to } => {
                    let (from, to) = (from as usize % LISTS, to as usize % LISTS);
                    for id in lists[from].steal(&table) {
                        lists[to].push(&table, id);
                    }
                }
            }
        }
        held.into_iter().for_each(|id| lists[0].push(&table, id));
    });

    // Every node ends up on exactly one list.
    let mut seen = HashSet::new();
    for list in &lists {
        for id in list.steal(&table) {
            assert!(seen.insert(id), "{id:?} linked twice");
        }
    }
    assert_eq!(seen.len(), table.len());
});
