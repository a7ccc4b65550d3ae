//! The dependency graph over unit identifiers (§4.3): Kahn's algorithm with a ready
//! queue that is an insertion-ordered `VecDeque` guarded by a `HashSet` for
//! membership, not a name-sorted set, because §4.3 requires "insertion order
//! (discovery order), not name."

use std::collections::{HashMap, HashSet, VecDeque};

use ralph_types::UnitStatus;

use crate::error::OrchestratorError;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Discovery order, preserved for ready-queue tie-breaking.
    order: Vec<String>,
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build a graph from `(unit id, depends_on)` pairs in discovery order. Fails
    /// with `UnknownDependency` if any `depends_on` entry names a unit not present
    /// in `units`, and with `Cycle` if the resulting graph is not a DAG.
    pub fn build(units: &[(String, Vec<String>)]) -> Result<Self, OrchestratorError> {
        let known: HashSet<&str> = units.iter().map(|(id, _)| id.as_str()).collect();
        let mut order = Vec::with_capacity(units.len());
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();

        for (id, _) in units {
            order.push(id.clone());
            predecessors.entry(id.clone()).or_default();
            successors.entry(id.clone()).or_default();
        }

        for (id, deps) in units {
            for dep in deps {
                if !known.contains(dep.as_str()) {
                    return Err(OrchestratorError::UnknownDependency {
                        unit: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                predecessors.entry(id.clone()).or_default().push(dep.clone());
                successors.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        let graph = DependencyGraph { order, predecessors, successors };
        graph.detect_cycle()?;
        Ok(graph)
    }

    pub fn predecessors(&self, unit: &str) -> &[String] {
        self.predecessors.get(unit).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn successors(&self, unit: &str) -> &[String] {
        self.successors.get(unit).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All `u` with status `pending` and every predecessor status `complete`.
    pub fn ready(&self, statuses: &HashMap<String, UnitStatus>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                statuses.get(id.as_str()).copied().unwrap_or_default() == UnitStatus::Pending
                    && self
                        .predecessors(id)
                        .iter()
                        .all(|p| statuses.get(p.as_str()).copied().unwrap_or_default() == UnitStatus::Complete)
            })
            .cloned()
            .collect()
    }

    /// Transitive closure of successors, memoized per call (the graph is immutable
    /// once built, so there is no cache to invalidate).
    pub fn dependents(&self, unit: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self.successors(unit).to_vec().into();
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            out.push(next.clone());
            for succ in self.successors(&next) {
                queue.push_back(succ.clone());
            }
        }
        out
    }

    /// Kahn-layered topological ordering: units with no predecessors at level 0,
    /// units whose predecessors are all in levels `< N` at level `N`.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            indegree.insert(id, self.predecessors(id).len());
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut unit_level: HashMap<String, usize> = HashMap::new();
        let mut remaining: VecDeque<String> = self.order.clone().into();
        let mut placed: HashSet<String> = HashSet::new();

        while placed.len() < self.order.len() {
            let mut this_level = Vec::new();
            let mut next_remaining = VecDeque::new();
            while let Some(id) = remaining.pop_front() {
                let ready = self.predecessors(&id).iter().all(|p| placed.contains(p));
                if ready {
                    this_level.push(id.clone());
                } else {
                    next_remaining.push_back(id);
                }
            }
            if this_level.is_empty() {
                // Remaining units form a cycle that `build()` should already have
                // rejected; bail out rather than loop forever.
                break;
            }
            let level_index = levels.len();
            for id in &this_level {
                unit_level.insert(id.clone(), level_index);
                placed.insert(id.clone());
            }
            levels.push(this_level);
            remaining = next_remaining;
        }
        levels
    }

    /// Transitive successors of `failed` that should become `blocked`, i.e. every
    /// downstream unit not already in a terminal state.
    pub fn propagate_blocked(&self, failed: &str, statuses: &HashMap<String, UnitStatus>) -> Vec<String> {
        self.dependents(failed)
            .into_iter()
            .filter(|id| !statuses.get(id.as_str()).copied().unwrap_or_default().is_terminal())
            .collect()
    }

    fn detect_cycle(&self) -> Result<(), OrchestratorError> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            indegree.insert(id, self.predecessors(id).len());
        }
        let mut queue: VecDeque<String> = self
            .order
            .iter()
            .filter(|id| indegree[id.as_str()] == 0)
            .cloned()
            .collect();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for succ in self.successors(&id) {
                let deg = indegree.get_mut(succ.as_str()).expect("successor must be known");
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    queue.push_back(succ.clone());
                }
            }
        }
        if seen.len() != self.order.len() {
            let stuck: Vec<&str> = self.order.iter().map(String::as_str).filter(|id| !seen.contains(*id)).collect();
            return Err(OrchestratorError::Cycle(stuck.join(" -> ")));
        }
        Ok(())
    }
}

/// Insertion-ordered ready queue used by the scheduler (§4.3's explicit tie-break).
/// A plain `Vec` already preserves insertion order; this wrapper just guards against
/// double-insertion so a unit cannot be queued twice.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: VecDeque<String>,
    queued: HashSet<String>,
}

impl ReadyQueue {
    pub fn push(&mut self, unit: String) {
        if self.queued.insert(unit.clone()) {
            self.queue.push_back(unit);
        }
    }

    pub fn pop(&mut self) -> Option<String> {
        let next = self.queue.pop_front();
        if let Some(ref id) = next {
            self.queued.remove(id);
        }
        next
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(pairs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        pairs
            .iter()
            .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = DependencyGraph::build(&units(&[("a", &["missing"])])).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownDependency { .. }));
    }

    #[test]
    fn cycle_is_detected() {
        let err = DependencyGraph::build(&units(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        assert!(matches!(err, OrchestratorError::Cycle(_)));
    }

    #[test]
    fn ready_requires_all_predecessors_complete() {
        let graph = DependencyGraph::build(&units(&[("a", &[]), ("b", &["a"])])).unwrap();
        let mut statuses = HashMap::new();
        statuses.insert("a".to_string(), UnitStatus::Pending);
        statuses.insert("b".to_string(), UnitStatus::Pending);
        assert_eq!(graph.ready(&statuses), vec!["a".to_string()]);

        statuses.insert("a".to_string(), UnitStatus::Complete);
        assert_eq!(graph.ready(&statuses), vec!["b".to_string()]);
    }

    #[test]
    fn dependents_is_transitive() {
        let graph = DependencyGraph::build(&units(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])).unwrap();
        let mut deps = graph.dependents("a");
        deps.sort();
        assert_eq!(deps, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn levels_group_by_max_dependency_depth() {
        let graph = DependencyGraph::build(&units(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])])).unwrap();
        let levels = graph.levels();
        assert_eq!(levels.len(), 2);
        let mut level0 = levels[0].clone();
        level0.sort();
        assert_eq!(level0, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(levels[1], vec!["c".to_string()]);
    }

    #[test]
    fn propagate_blocked_skips_already_terminal_units() {
        let graph = DependencyGraph::build(&units(&[("a", &[]), ("b", &["a"]), ("c", &["a"])])).unwrap();
        let mut statuses = HashMap::new();
        statuses.insert("a".to_string(), UnitStatus::Failed);
        statuses.insert("b".to_string(), UnitStatus::Pending);
        statuses.insert("c".to_string(), UnitStatus::Complete);
        let blocked = graph.propagate_blocked("a", &statuses);
        assert_eq!(blocked, vec!["b".to_string()]);
    }

    #[test]
    fn ready_queue_preserves_insertion_order_not_name_order() {
        let mut q = ReadyQueue::default();
        q.push("zeta".to_string());
        q.push("alpha".to_string());
        assert_eq!(q.pop(), Some("zeta".to_string()));
        assert_eq!(q.pop(), Some("alpha".to_string()));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn ready_queue_ignores_duplicate_pushes() {
        let mut q = ReadyQueue::default();
        q.push("a".to_string());
        q.push("a".to_string());
        assert_eq!(q.len(), 1);
    }
}
