//! The assignment cache: cluster name -> current endpoint set.
//!
//! The table is an immutable map behind an [`ArcSwap`]. Readers load a
//! snapshot without locking; the single writer (the worker) publishes a new
//! map per update. Each entry is replaced as a whole, so a reader sees either
//! the old or the new endpoint set of a cluster, never a mix.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;

use crate::resource::{ClusterLoadAssignment, EndpointAddress};

type Table = HashMap<String, Arc<ClusterEntry>>;

/// What the cache knows about a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// The cluster has not been seen via CDS.
    Unknown,
    /// The cluster is known via CDS but EDS has not answered for it yet.
    AwaitingEndpoints,
    /// EDS supplied an assignment with this many endpoints (possibly zero).
    Ready {
        /// Number of endpoints in the assignment.
        endpoints: usize,
    },
}

struct ClusterEntry {
    assignment: Option<Arc<ClusterLoadAssignment>>,
    /// Indices of the endpoints `select` rotates over.
    candidates: Vec<usize>,
    cursor: AtomicUsize,
}

impl ClusterEntry {
    fn pending() -> Self {
        Self {
            assignment: None,
            candidates: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn assigned(assignment: Arc<ClusterLoadAssignment>) -> Self {
        let endpoints = assignment.endpoints();
        let mut candidates: Vec<usize> = endpoints
            .iter()
            .enumerate()
            .filter(|(_, ep)| ep.health.is_serving())
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            // Nothing is serving; rotate over everything rather than answer nothing.
            candidates = (0..endpoints.len()).collect();
        }
        Self {
            assignment: Some(assignment),
            candidates,
            cursor: AtomicUsize::new(0),
        }
    }

    fn status(&self) -> ClusterStatus {
        match &self.assignment {
            None => ClusterStatus::AwaitingEndpoints,
            Some(cla) => ClusterStatus::Ready {
                endpoints: cla.endpoints().len(),
            },
        }
    }

    fn select(&self) -> Option<EndpointAddress> {
        let assignment = self.assignment.as_ref()?;
        if self.candidates.is_empty() {
            return None;
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed) % self.candidates.len();
        let index = self.candidates[turn];
        Some(assignment.endpoints()[index].address.clone())
    }
}

impl fmt::Debug for ClusterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEntry")
            .field("status", &self.status())
            .field("candidates", &self.candidates.len())
            .finish()
    }
}

/// Concurrency-safe store of cluster assignments.
///
/// Cloning is cheap and yields a handle to the same table.
///
/// # Selection
///
/// [`AssignmentCache::select`] rotates round robin over the endpoints whose
/// health status is serving (not unhealthy, draining or timed out), in the
/// order the control plane listed them. If no endpoint is serving it rotates
/// over all of them. Replacing a cluster's assignment restarts its rotation
/// at the first candidate.
/// Endpoint weights and localities are kept but not used for selection.
#[derive(Clone, Default)]
pub struct AssignmentCache {
    table: Arc<ArcSwap<Table>>,
}

impl fmt::Debug for AssignmentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.load();
        f.debug_struct("AssignmentCache")
            .field("clusters", &table.len())
            .finish()
    }
}

impl AssignmentCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a cluster's assignment.
    ///
    /// `None` records the cluster as known with no endpoints yet, replacing
    /// any assignment it had.
    pub fn set_assignment(&self, cluster_name: &str, assignment: Option<ClusterLoadAssignment>) {
        let entry = Arc::new(match assignment {
            Some(cla) => ClusterEntry::assigned(Arc::new(cla)),
            None => ClusterEntry::pending(),
        });
        self.table.rcu(|table| {
            let mut table = Table::clone(table);
            table.insert(cluster_name.to_string(), Arc::clone(&entry));
            table
        });
    }

    /// Register clusters learned from CDS.
    ///
    /// Clusters that are already known keep their current assignment.
    /// Returns the number of clusters that were new.
    pub fn register_clusters<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> usize {
        let names: Vec<&str> = names.into_iter().collect();
        let mut added = 0;
        self.table.rcu(|table| {
            added = 0;
            let mut table = Table::clone(table);
            for name in &names {
                if !table.contains_key(*name) {
                    table.insert(name.to_string(), Arc::new(ClusterEntry::pending()));
                    added += 1;
                }
            }
            table
        });
        added
    }

    /// Drop every cluster not in `keep`, returning the removed names (sorted).
    pub fn retain_clusters(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        self.table.rcu(|table| {
            removed = table
                .keys()
                .filter(|name| !keep.contains(*name))
                .cloned()
                .collect();
            let mut table = Table::clone(table);
            table.retain(|name, _| keep.contains(name));
            table
        });
        removed.sort();
        removed
    }

    /// Replace the assignments of known clusters, in one atomic publish.
    ///
    /// Each assignment fully replaces the cluster's previous endpoint set.
    /// Assignments for clusters the cache does not know are skipped; their
    /// names are returned.
    pub fn replace_assignments(&self, assignments: Vec<ClusterLoadAssignment>) -> Vec<String> {
        let entries: Vec<(String, Arc<ClusterEntry>)> = assignments
            .into_iter()
            .map(|cla| {
                let name = cla.cluster_name().to_string();
                (name, Arc::new(ClusterEntry::assigned(Arc::new(cla))))
            })
            .collect();

        let mut skipped = Vec::new();
        self.table.rcu(|table| {
            skipped.clear();
            let mut table = Table::clone(table);
            for (name, entry) in &entries {
                match table.get_mut(name) {
                    Some(slot) => *slot = Arc::clone(entry),
                    None => skipped.push(name.clone()),
                }
            }
            table
        });
        skipped
    }

    /// A point-in-time snapshot of the known cluster names, sorted.
    pub fn cluster_names(&self) -> Vec<String> {
        let table = self.table.load();
        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort();
        names
    }

    /// What the cache knows about `cluster_name`.
    pub fn status(&self, cluster_name: &str) -> ClusterStatus {
        self.table
            .load()
            .get(cluster_name)
            .map_or(ClusterStatus::Unknown, |entry| entry.status())
    }

    /// The current assignment of `cluster_name`, if EDS supplied one.
    pub fn assignment(&self, cluster_name: &str) -> Option<Arc<ClusterLoadAssignment>> {
        self.table
            .load()
            .get(cluster_name)
            .and_then(|entry| entry.assignment.clone())
    }

    /// Pick one endpoint address for `cluster_name`.
    ///
    /// Returns `None` if the cluster is unknown or has no endpoints. Never
    /// blocks, and is safe to call concurrently with updates.
    pub fn select(&self, cluster_name: &str) -> Option<EndpointAddress> {
        self.table.load().get(cluster_name)?.select()
    }

    /// Number of known clusters.
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    /// Returns true if no cluster is known.
    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}
