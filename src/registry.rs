//! Task registry (C3): the dispatcher-owned map from `task_id` to
//! worker, with a monotonic id counter. Per spec.md §4.3/§5, no worker
//! ever reads or mutates this structure — only the dispatcher touches
//! it.

use crate::clock::TimeSource;
use crate::wire::{Commandline, Run, Task, Timing};
use crate::worker::Worker;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// One owning entry: the worker's shared state plus the join handle
/// for its thread, kept together (Design Notes: "a single owning map
/// ... each entry holding both the worker state and the join handle"
/// instead of the source's parallel arrays).
struct Entry {
    worker: Arc<Worker>,
    join: JoinHandle<()>,
}

#[derive(Default)]
pub struct Registry {
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Assigns a fresh id, starts the worker and inserts it. Ids are
    /// never reused even after removal (spec.md §4.3).
    pub fn insert(
        &mut self,
        timing: Timing,
        commandline: Commandline,
        clock: Arc<dyn TimeSource>,
    ) -> u64 {
        let task_id = self.next_id;
        self.next_id += 1;
        let (worker, join) = Worker::spawn(task_id, timing, commandline, clock);
        self.entries.insert(task_id, Entry { worker, join });
        task_id
    }

    /// Stops the worker and removes it, joining its thread so the
    /// registry never holds a zombie entry. Returns `false` if the id
    /// is unknown.
    pub fn remove(&mut self, task_id: u64) -> bool {
        match self.entries.remove(&task_id) {
            Some(entry) => {
                entry.worker.stop();
                let _ = entry.join.join();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: u64) -> bool {
        self.entries.contains_key(&task_id)
    }

    pub fn runs(&self, task_id: u64) -> Option<Vec<Run>> {
        self.entries.get(&task_id).map(|e| e.worker.runs_snapshot())
    }

    pub fn has_run(&self, task_id: u64) -> Option<bool> {
        self.entries.get(&task_id).map(|e| e.worker.has_run())
    }

    pub fn last_stdout(&self, task_id: u64) -> Option<Vec<u8>> {
        self.entries
            .get(&task_id)
            .and_then(|e| e.worker.last_stdout_snapshot())
    }

    pub fn last_stderr(&self, task_id: u64) -> Option<Vec<u8>> {
        self.entries
            .get(&task_id)
            .and_then(|e| e.worker.last_stderr_snapshot())
    }

    /// Task descriptors of every currently registered worker, in
    /// insertion order (spec.md §4.3: "any deterministic order;
    /// implementations should use insertion order"). There is no
    /// stopped-but-present state (every entry here is alive, per
    /// SPEC_FULL §9's resolution of the source's tautological
    /// is-running filter), so this simply lists everything registered.
    pub fn snapshot_running(&self) -> Vec<Task> {
        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| {
                let entry = &self.entries[&id];
                Task {
                    task_id: id,
                    timing: entry.worker.timing,
                    commandline: entry.worker.commandline.clone(),
                }
            })
            .collect()
    }

    /// Stops and joins every worker. Called once at shutdown
    /// (`TERMINATE`), after the OK reply has already been written per
    /// spec.md §4.5's TERMINATE ordering.
    pub fn shutdown(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.worker.stop();
            let _ = entry.join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    fn commandline() -> Commandline {
        Commandline {
            argv: vec![b"/bin/true".to_vec()],
        }
    }

    fn idle_timing() -> Timing {
        // Matches nothing: the worker parks without ever running.
        Timing {
            minutes: 0,
            hours: 0,
            days_of_week: 0,
        }
    }

    #[test]
    fn ids_are_assigned_monotonically() {
        let clock: Arc<dyn TimeSource> = VirtualClock::new(0);
        let mut registry = Registry::new();
        let id0 = registry.insert(idle_timing(), commandline(), clock.clone());
        let id1 = registry.insert(idle_timing(), commandline(), clock.clone());
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        registry.shutdown();
    }

    #[test]
    fn remove_unknown_task_returns_false() {
        let mut registry = Registry::new();
        assert!(!registry.remove(99));
    }

    #[test]
    fn list_reflects_insert_and_remove() {
        let clock: Arc<dyn TimeSource> = VirtualClock::new(0);
        let mut registry = Registry::new();
        let id = registry.insert(idle_timing(), commandline(), clock);
        assert_eq!(registry.snapshot_running().len(), 1);
        assert!(registry.remove(id));
        assert_eq!(registry.snapshot_running().len(), 0);
    }

    #[test]
    fn ids_are_never_reused() {
        let clock: Arc<dyn TimeSource> = VirtualClock::new(0);
        let mut registry = Registry::new();
        let id0 = registry.insert(idle_timing(), commandline(), clock.clone());
        registry.remove(id0);
        let id1 = registry.insert(idle_timing(), commandline(), clock);
        assert_ne!(id0, id1);
        assert_eq!(id1, 1);
        registry.shutdown();
    }
}
