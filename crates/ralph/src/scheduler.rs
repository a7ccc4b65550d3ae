//! Scheduler (§4.4): the unit state machine and ready queue, shared by the worker
//! pool, backed by a live `Condvar`-guarded ready queue rather than static
//! per-level batching: a worker calls `dispatch()` whenever it is free, blocks when
//! nothing is ready, and is woken the instant `complete()`/`fail()` unblocks a
//! successor. This lets a fast unit in level N start before a slow sibling in level
//! N finishes, which static level-batching cannot do.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use ralph_types::{Event, EventType, UnitStatus};

use crate::graph::{DependencyGraph, ReadyQueue};

struct State {
    statuses: HashMap<String, UnitStatus>,
    ready: ReadyQueue,
    errors: HashMap<String, String>,
    shutting_down: bool,
}

pub struct Scheduler {
    graph: DependencyGraph,
    state: Mutex<State>,
    condvar: Condvar,
}

/// Emitted as a side effect of a scheduler transition; the caller is responsible for
/// publishing these to the event bus, keeping this module free of an `ralph-events`
/// dependency.
pub type EmittedEvents = Vec<Event>;

impl Scheduler {
    /// Initial population: all units `pending`, ready set computed immediately.
    /// Returns the `unit.queued` events for every unit found ready at registration.
    pub fn register(graph: DependencyGraph, unit_ids: &[String]) -> (Self, EmittedEvents) {
        let mut statuses = HashMap::new();
        for id in unit_ids {
            statuses.insert(id.clone(), UnitStatus::Pending);
        }
        let ready_ids = graph.ready(&statuses);
        let mut ready = ReadyQueue::default();
        let mut events = Vec::new();
        for id in &ready_ids {
            statuses.insert(id.clone(), UnitStatus::Ready);
            ready.push(id.clone());
            events.push(queued_event(id));
        }
        let scheduler = Scheduler {
            graph,
            state: Mutex::new(State { statuses, ready, errors: HashMap::new(), shutting_down: false }),
            condvar: Condvar::new(),
        };
        (scheduler, events)
    }

    /// Returns up to one ready unit, transitioning it to `in-progress`. Blocks the
    /// caller until a unit becomes ready, the scheduler is told to shut down, or
    /// every unit has reached a terminal state (in which case `None`).
    pub fn dispatch(&self) -> Option<String> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        loop {
            if let Some(id) = state.ready.pop() {
                state.statuses.insert(id.clone(), UnitStatus::InProgress);
                return Some(id);
            }
            if state.shutting_down || self.all_terminal(&state) {
                return None;
            }
            state = self.condvar.wait(state).expect("scheduler mutex poisoned");
        }
    }

    fn all_terminal(&self, state: &State) -> bool {
        state.statuses.values().all(|s| s.is_terminal() || *s == UnitStatus::Blocked)
    }

    /// Marks `unit_id` complete, re-evaluates successors, and returns the
    /// `unit.completed` event followed by `unit.queued` for every newly ready unit.
    pub fn complete(&self, unit_id: &str) -> EmittedEvents {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().expect("scheduler mutex poisoned");
            state.statuses.insert(unit_id.to_string(), UnitStatus::Complete);
            events.push(completed_event(unit_id));
            for successor in self.graph.successors(unit_id) {
                let ready_now = self.graph.predecessors(successor).iter().all(|p| {
                    state.statuses.get(p.as_str()).copied().unwrap_or_default() == UnitStatus::Complete
                });
                if ready_now && state.statuses.get(successor.as_str()).copied() == Some(UnitStatus::Pending) {
                    state.statuses.insert(successor.clone(), UnitStatus::Ready);
                    state.ready.push(successor.clone());
                    events.push(queued_event(successor));
                }
            }
        }
        self.condvar.notify_all();
        events
    }

    /// Marks `unit_id` failed and every transitive successor `blocked`. Blocked
    /// units are **not** reclaimable in the same run (§4.4 invariant).
    ///
    /// Does not itself emit a `unit.failed` bus event — the worker already emitted
    /// one carrying the real error message before calling this, and a second,
    /// message-less event here would race it on the bus and could clobber the real
    /// message in persisted state.
    pub fn fail(&self, unit_id: &str, err: String) -> EmittedEvents {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().expect("scheduler mutex poisoned");
            state.statuses.insert(unit_id.to_string(), UnitStatus::Failed);
            state.errors.insert(unit_id.to_string(), err);
            for blocked in self.graph.propagate_blocked(unit_id, &state.statuses) {
                state.statuses.insert(blocked.clone(), UnitStatus::Blocked);
                events.push(blocked_event(&blocked, unit_id));
            }
        }
        self.condvar.notify_all();
        events
    }

    /// Tells any blocked `dispatch()` callers to stop waiting and return `None`.
    pub fn shutdown(&self) {
        self.state.lock().expect("scheduler mutex poisoned").shutting_down = true;
        self.condvar.notify_all();
    }

    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.state.lock().expect("scheduler mutex poisoned").statuses.get(unit_id).copied()
    }

    pub fn is_finished(&self) -> bool {
        let state = self.state.lock().expect("scheduler mutex poisoned");
        self.all_terminal(&state)
    }
}

fn queued_event(unit: &str) -> Event {
    Event { timestamp: chrono::Utc::now(), event_type: EventType::UnitQueued, unit: Some(unit.to_string()), task: None, pr: None, error: None }
}

fn completed_event(unit: &str) -> Event {
    Event { timestamp: chrono::Utc::now(), event_type: EventType::UnitCompleted, unit: Some(unit.to_string()), task: None, pr: None, error: None }
}

fn blocked_event(unit: &str, blocking_predecessor: &str) -> Event {
    Event {
        timestamp: chrono::Utc::now(),
        event_type: EventType::UnitBlocked { blocking_predecessor: blocking_predecessor.to_string() },
        unit: Some(unit.to_string()),
        task: None,
        pr: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_graph(pairs: &[(&str, &[&str])]) -> (DependencyGraph, Vec<String>) {
        let units: Vec<(String, Vec<String>)> =
            pairs.iter().map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect())).collect();
        let ids: Vec<String> = units.iter().map(|(id, _)| id.clone()).collect();
        (DependencyGraph::build(&units).unwrap(), ids)
    }

    #[test]
    fn register_computes_initial_ready_set() {
        let (graph, ids) = build_graph(&[("a", &[]), ("b", &["a"])]);
        let (scheduler, events) = Scheduler::register(graph, &ids);
        assert_eq!(scheduler.status_of("a"), Some(UnitStatus::Ready));
        assert_eq!(scheduler.status_of("b"), Some(UnitStatus::Pending));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn complete_unblocks_successor() {
        let (graph, ids) = build_graph(&[("a", &[]), ("b", &["a"])]);
        let (scheduler, _) = Scheduler::register(graph, &ids);
        let dispatched = scheduler.dispatch().unwrap();
        assert_eq!(dispatched, "a");
        let events = scheduler.complete("a");
        assert!(events.iter().any(|e| matches!(e.event_type, EventType::UnitQueued) && e.unit.as_deref() == Some("b")));
        assert_eq!(scheduler.dispatch(), Some("b".to_string()));
    }

    #[test]
    fn fail_blocks_transitive_successors() {
        let (graph, ids) = build_graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let (scheduler, _) = Scheduler::register(graph, &ids);
        scheduler.dispatch();
        scheduler.fail("a", "boom".to_string());
        assert_eq!(scheduler.status_of("b"), Some(UnitStatus::Blocked));
        assert_eq!(scheduler.status_of("c"), Some(UnitStatus::Blocked));
    }

    #[test]
    fn dispatch_returns_none_once_everything_terminal() {
        let (graph, ids) = build_graph(&[("a", &[])]);
        let (scheduler, _) = Scheduler::register(graph, &ids);
        scheduler.dispatch();
        scheduler.complete("a");
        assert_eq!(scheduler.dispatch(), None);
    }

    #[test]
    fn blocked_units_are_not_reclaimable() {
        let (graph, ids) = build_graph(&[("a", &[]), ("b", &["a"])]);
        let (scheduler, _) = Scheduler::register(graph, &ids);
        scheduler.dispatch();
        scheduler.fail("a", "boom".to_string());
        assert_eq!(scheduler.status_of("b"), Some(UnitStatus::Blocked));
        assert_eq!(scheduler.dispatch(), None);
    }

    #[test]
    fn concurrent_dispatch_never_hands_out_the_same_unit_twice() {
        use std::sync::Arc;
        let (graph, ids) = build_graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let (scheduler, _) = Scheduler::register(graph, &ids);
        let scheduler = Arc::new(scheduler);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let s = Arc::clone(&scheduler);
            handles.push(std::thread::spawn(move || s.dispatch()));
        }
        let mut seen: Vec<String> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
