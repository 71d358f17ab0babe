//! Resource graph and dependency resolution
//!
//! Computes the order in which resources must converge. A resource comes
//! after every resource it depends on, whether the dependency was declared
//! with `depends_on` or inferred from a property reference.

use crate::error::{Result, StackError};
use crate::model::Resource;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Directed edge: `to` cannot start before `from` settles
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// Declared resources in declaration order
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
    /// Ids resolved outside this graph (outputs of an enclosing pass)
    externals: BTreeSet<String>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource, rejecting duplicate ids
    pub fn add(&mut self, resource: Resource) -> Result<()> {
        if self.index.contains_key(&resource.id) {
            return Err(StackError::DuplicateResource(resource.id));
        }
        self.index.insert(resource.id.clone(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Declare ids whose outputs are supplied from outside this graph
    pub fn with_externals<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.externals.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn externals(&self) -> &BTreeSet<String> {
        &self.externals
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Dependencies of `id` that live inside this graph
    pub fn internal_dependencies(&self, id: &str) -> Vec<String> {
        self.get(id)
            .map(|r| {
                r.dependencies()
                    .into_iter()
                    .filter(|d| self.contains(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All edges between declared resources, in declaration order
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.resources
            .iter()
            .flat_map(|r| {
                self.internal_dependencies(&r.id)
                    .into_iter()
                    .map(|from| DependencyEdge {
                        from,
                        to: r.id.clone(),
                    })
            })
            .collect()
    }

    /// Direct dependents of `id`
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.dependencies().contains(id))
            .map(|r| r.id.as_str())
            .collect()
    }

    /// Every resource that directly or transitively depends on `id`
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(&current) {
                if seen.insert(dependent.to_string()) {
                    stack.push(dependent.to_string());
                }
            }
        }
        self.resources
            .iter()
            .filter(|r| seen.contains(&r.id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Referenced ids not declared in this graph
    pub fn external_references(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .flat_map(|r| r.dependencies())
            .filter(|d| !self.contains(d))
            .collect()
    }

    /// Reject dependencies on ids that are neither declared nor external
    pub fn validate(&self) -> Result<()> {
        for resource in &self.resources {
            for dep in resource.dependencies() {
                if !self.contains(&dep) && !self.externals.contains(&dep) {
                    return Err(StackError::DanglingReference {
                        resource: resource.id.clone(),
                        target: dep,
                    });
                }
            }
        }
        Ok(())
    }

    /// Topologically sort the graph, breaking ties by declaration order.
    pub fn plan(&self) -> Result<ConvergencePlan> {
        self.validate()?;

        let n = self.resources.len();
        let deps: Vec<Vec<usize>> = self
            .resources
            .iter()
            .map(|r| {
                self.internal_dependencies(&r.id)
                    .iter()
                    .filter_map(|d| self.index.get(d).copied())
                    .collect()
            })
            .collect();

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut remaining: Vec<usize> = vec![0; n];
        for (i, ds) in deps.iter().enumerate() {
            remaining[i] = ds.len();
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut depth = vec![0usize; n];

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                depth[dependent] = depth[dependent].max(depth[next] + 1);
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < n {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let members = self.find_cycle(&deps, &placed);
            return Err(StackError::CycleDetected { members });
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); if n == 0 { 0 } else { max_depth + 1 }];
        for &i in &order {
            levels[depth[i]].push(self.resources[i].id.clone());
        }

        let order: Vec<String> = order
            .into_iter()
            .map(|i| self.resources[i].id.clone())
            .collect();

        debug!(
            resources = order.len(),
            levels = levels.len(),
            "Computed convergence plan"
        );

        Ok(ConvergencePlan { order, levels })
    }

    // Walk dependency edges among unplaced nodes until one repeats.
    fn find_cycle(&self, deps: &[Vec<usize>], placed: &HashSet<usize>) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnPath,
            Done,
        }

        fn visit(
            node: usize,
            deps: &[Vec<usize>],
            placed: &HashSet<usize>,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::OnPath;
            path.push(node);
            for &next in &deps[node] {
                if placed.contains(&next) {
                    continue;
                }
                match marks[next] {
                    Mark::OnPath => {
                        let start = path.iter().position(|&p| p == next).unwrap_or(0);
                        return Some(path[start..].to_vec());
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(next, deps, placed, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; deps.len()];
        for start in 0..deps.len() {
            if placed.contains(&start) || marks[start] != Mark::New {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = visit(start, deps, placed, &mut marks, &mut path) {
                return cycle
                    .into_iter()
                    .map(|i| self.resources[i].id.clone())
                    .collect();
            }
        }

        // Unreachable for a graph that failed to sort; fall back to the stuck set.
        (0..deps.len())
            .filter(|i| !placed.contains(i))
            .map(|i| self.resources[i].id.clone())
            .collect()
    }
}

/// Ordered sequence of resource ids to converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePlan {
    order: Vec<String>,
    /// Resources grouped by dependency depth; a level only depends on earlier ones
    levels: Vec<Vec<String>>,
}

impl ConvergencePlan {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|i| i == id)
    }

    /// Order for tearing the graph down
    pub fn reversed(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }
}
