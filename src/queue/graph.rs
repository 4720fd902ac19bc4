use std::collections::{BTreeSet, HashMap, HashSet};

use super::OperationId;

/// Dependency edges between queued operations.
///
/// Every queued operation is a node. An edge `a -> b` means `a` may not
/// dispatch while `b` is still queued. Edges to ids that are not queued are
/// kept but count as satisfied.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    depends_on: HashMap<OperationId, BTreeSet<OperationId>>,
    dependents: HashMap<OperationId, BTreeSet<OperationId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.depends_on.contains_key(id)
    }

    /// Whether adding `id` with `deps` would close a cycle.
    pub fn would_cycle(&self, id: OperationId, deps: &BTreeSet<OperationId>) -> bool {
        if deps.contains(&id) {
            return true;
        }

        let mut stack: Vec<OperationId> = deps.iter().copied().collect();
        let mut visited = HashSet::new();

        while let Some(current) = stack.pop() {
            if current == id {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = self.depends_on.get(&current) {
                stack.extend(next.iter().copied());
            }
        }

        false
    }

    /// Add a node, rejecting it if it would introduce a cycle.
    pub fn insert(&mut self, id: OperationId, deps: &BTreeSet<OperationId>) -> Result<(), OperationId> {
        if self.would_cycle(id, deps) {
            return Err(id);
        }
        for dep in deps {
            self.dependents.entry(*dep).or_default().insert(id);
        }
        self.depends_on.insert(id, deps.clone());
        Ok(())
    }

    /// Remove a node, returning the queued operations that were waiting on it.
    pub fn remove(&mut self, id: &OperationId) -> BTreeSet<OperationId> {
        if let Some(deps) = self.depends_on.remove(id) {
            for dep in deps {
                if let Some(waiting) = self.dependents.get_mut(&dep) {
                    waiting.remove(id);
                    if waiting.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }

        self.dependents
            .get(id)
            .map(|waiting| {
                waiting
                    .iter()
                    .filter(|w| self.contains(w))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any of `id`'s dependencies is still queued.
    pub fn has_outstanding(&self, id: &OperationId) -> bool {
        self.depends_on
            .get(id)
            .is_some_and(|deps| deps.iter().any(|dep| self.contains(dep)))
    }
}
