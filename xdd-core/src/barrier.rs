//! N-party synchronization primitive with an occupant roster for
//! diagnostics (spec.md §4.1, C1).

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// The kind of thread occupying a barrier, used purely for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupantKind {
    Main,
    Support,
    Target,
    Worker,
}

/// A descriptor an entrant supplies to `Barrier::wait`. Linked into the
/// barrier's roster for the duration of the wait.
#[derive(Debug, Clone)]
pub struct Occupant {
    pub name: String,
    pub kind: OccupantKind,
    pub data: Option<String>,
}

impl Occupant {
    pub fn new(name: impl Into<String>, kind: OccupantKind) -> Self {
        Self { name: name.into(), kind, data: None }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

#[derive(Debug, Clone)]
struct RosterEntry {
    occupant: Occupant,
    entered_at: Instant,
}

struct BarrierState {
    parties: usize,
    count: usize,
    generation: u64,
    roster: Vec<RosterEntry>,
}

/// An N-party barrier. The last entrant to call `wait` releases every
/// other entrant and, if it supplied `is_owner = true`, clears the
/// roster.
pub struct Barrier {
    name: String,
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Barrier {
    pub fn new(name: impl Into<String>, parties: usize) -> Self {
        Self {
            name: name.into(),
            parties,
            state: Mutex::new(BarrierState {
                parties,
                count: 0,
                generation: 0,
                roster: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Enter the barrier and block until `parties` entrants have arrived.
    /// `is_owner` entrants clear the roster on release; exactly one
    /// entrant per generation should pass `is_owner = true` (typically the
    /// plan coordinator or the target supervisor that created the
    /// barrier).
    pub fn wait(&self, occupant: Occupant, is_owner: bool) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let my_generation = guard.generation;
        guard.roster.push(RosterEntry { occupant, entered_at: Instant::now() });
        guard.count += 1;

        if guard.count == guard.parties {
            if is_owner {
                guard.roster.clear();
            }
            guard.count = 0;
            guard.generation = guard.generation.wrapping_add(1);
            self.cond.notify_all();
        } else {
            while guard.generation == my_generation {
                guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    /// Snapshot of the current roster, for the interactive/debug path.
    pub fn roster(&self) -> Vec<(String, OccupantKind, Instant)> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .roster
            .iter()
            .map(|e| (e.occupant.name.clone(), e.occupant.kind, e.entered_at))
            .collect()
    }
}

/// Process-wide registry of barriers, tracked by name. Teardown destroys
/// every registered barrier; destroying an unregistered (or already
/// destroyed) name is idempotent.
#[derive(Default)]
pub struct BarrierRegistry {
    barriers: Mutex<HashMap<String, std::sync::Arc<Barrier>>>,
}

impl BarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new barrier. Panics (debug-only) on a
    /// duplicate name, since two distinct barriers sharing a name is
    /// always a programming error in the coordinator's bring-up path.
    pub fn create(&self, name: impl Into<String>, parties: usize) -> std::sync::Arc<Barrier> {
        let name = name.into();
        let barrier = std::sync::Arc::new(Barrier::new(name.clone(), parties));
        let mut guard = self.barriers.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(!guard.contains_key(&name), "duplicate barrier name {name}");
        guard.insert(name, barrier.clone());
        barrier
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<Barrier>> {
        self.barriers.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Remove a single barrier from the registry. A no-op if the name is
    /// not present.
    pub fn destroy(&self, name: &str) {
        self.barriers.lock().unwrap_or_else(|e| e.into_inner()).remove(name);
    }

    /// Destroy every registered barrier. Never panics, so it is safe to
    /// call during an aborted shutdown.
    pub fn destroy_all(&self) {
        self.barriers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// List every barrier's name, party count, and roster — the
    /// interactive/debug "list all barriers" operation from spec.md §4.1.
    pub fn list(&self) -> Vec<(String, usize, Vec<(String, OccupantKind, Instant)>)> {
        let guard = self.barriers.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .values()
            .map(|b| (b.name().to_string(), b.parties(), b.roster()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.barriers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn releases_all_parties_simultaneously() {
        let barrier = Arc::new(Barrier::new("test-barrier", 4));
        let mut handles = Vec::new();
        for i in 0..4 {
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait(Occupant::new(format!("worker-{i}"), OccupantKind::Worker), i == 0);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(barrier.roster().is_empty());
    }

    #[test]
    fn non_owner_release_keeps_roster() {
        let barrier = Arc::new(Barrier::new("test-barrier", 2));
        let b2 = barrier.clone();
        let h = thread::spawn(move || {
            b2.wait(Occupant::new("a", OccupantKind::Worker), false);
        });
        barrier.wait(Occupant::new("b", OccupantKind::Worker), false);
        h.join().unwrap();
        assert_eq!(barrier.roster().len(), 2);
    }

    #[test]
    fn registry_destroy_all_is_idempotent() {
        let registry = BarrierRegistry::new();
        registry.create("a", 1);
        registry.create("b", 2);
        assert_eq!(registry.len(), 2);
        registry.destroy_all();
        assert!(registry.is_empty());
        registry.destroy_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_destroy_unknown_is_noop() {
        let registry = BarrierRegistry::new();
        registry.destroy("nonexistent");
        assert!(registry.is_empty());
    }

    #[test]
    fn barrier_can_be_reused_across_generations() {
        let barrier = Arc::new(Barrier::new("reusable", 2));
        for round in 0..3 {
            let b2 = barrier.clone();
            let h = thread::spawn(move || {
                b2.wait(Occupant::new(format!("round-{round}"), OccupantKind::Target), false);
            });
            barrier.wait(Occupant::new("owner", OccupantKind::Main), true);
            h.join().unwrap();
        }
    }
}
