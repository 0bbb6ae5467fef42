//! Dependency graph analysis.
//!
//! The [`DependencyGraph`] is built from a [`RequirementSet`] snapshot and
//! knows nothing about how the snapshot was stored. Edges point from a
//! prerequisite to the record that needs it, so a topological order lists
//! prerequisites first.
//!
//! Edges come from both relations: `B ∈ A.dependencies` and `A ∈ B.blocks`
//! each contribute the edge `B → A`. A snapshot with reciprocity violations
//! therefore still yields the full graph.

use std::{collections::BTreeSet, fmt};

use nonempty::NonEmpty;
use petgraph::{Direction, algo::tarjan_scc, graphmap::DiGraphMap};
use serde::Serialize;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::domain::{RequirementId, RequirementSet, Status};

/// Weight of a record with no usable effort value.
const UNIT_WEIGHT: f64 = 1.0;

/// The relation a reference was declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// The `dependencies` column.
    Dependencies,
    /// The `blocks` column.
    Blocks,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependencies => f.write_str("dependencies"),
            Self::Blocks => f.write_str("blocks"),
        }
    }
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    /// No record with this id exists.
    Unknown,
    /// The record exists but is tombstoned.
    Tombstoned,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("not in the snapshot"),
            Self::Tombstoned => f.write_str("deleted"),
        }
    }
}

/// A reference to a record that is not part of the live graph.
///
/// These are kept out of the graph and reported separately from cycles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Error)]
#[error("{from} lists {to} in {relation}, but {to} is {kind}")]
pub struct UnknownReference {
    /// The record holding the reference.
    pub from: RequirementId,
    /// The unresolved id.
    pub to: RequirementId,
    /// Where the reference was declared.
    pub relation: Relation,
    /// Why it could not be resolved.
    pub kind: ReferenceKind,
}

/// A strongly connected component of size > 1, or a single self-dependent
/// record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cycle {
    members: NonEmpty<RequirementId>,
}

impl Cycle {
    /// The members of the cycle, in id order.
    pub fn members(&self) -> impl Iterator<Item = &RequirementId> {
        self.members.iter()
    }

    /// Number of records in the cycle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; a cycle has at least one member.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether the cycle contains the given record.
    #[must_use]
    pub fn contains(&self, id: &RequirementId) -> bool {
        self.members.iter().any(|member| member == id)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<_> = self.members.iter().map(RequirementId::as_str).collect();
        write!(f, "{{{}}}", ids.join(", "))
    }
}

impl Serialize for Cycle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.members.iter())
    }
}

/// Errors from operations that require an acyclic graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The graph contains cycles.
    #[error("dependency graph contains {} cycle(s): {}", .0.len(), display_cycles(.0))]
    CycleDetected(Vec<Cycle>),
}

fn display_cycles(cycles: &[Cycle]) -> String {
    cycles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The longest chain of blocking dependencies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalPath {
    /// The chain, prerequisites first.
    pub ids: Vec<RequirementId>,
    /// Sum of effort along the chain.
    pub total_effort: f64,
}

/// A directed graph over the live records of a snapshot.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Node index → id. Sorted, so index order is id order.
    ids: Vec<RequirementId>,
    /// Node index → effort weight.
    weights: Vec<f64>,
    /// Node index → status.
    statuses: Vec<Status>,
    /// Nodes are indices into `ids`; edges point prerequisite → dependent.
    graph: DiGraphMap<usize, ()>,
    unknown: Vec<UnknownReference>,
}

impl DependencyGraph {
    /// Builds the graph from the live records of `set`.
    ///
    /// Effort is read from `effort_column`; records without a usable value
    /// weigh 1.
    #[instrument(level = "debug", skip(set), fields(records = set.len()))]
    #[must_use]
    pub fn build(set: &RequirementSet, effort_column: &str) -> Self {
        let live: Vec<_> = set.live().collect();
        let ids: Vec<RequirementId> = live.iter().map(|record| record.id.clone()).collect();
        let weights = live
            .iter()
            .map(|record| record.effort(effort_column).unwrap_or(UNIT_WEIGHT))
            .collect();
        let statuses = live.iter().map(|record| record.status).collect();

        let mut graph = DiGraphMap::with_capacity(ids.len(), ids.len() * 2);
        for index in 0..ids.len() {
            graph.add_node(index);
        }

        let mut unknown = Vec::new();
        for (index, record) in live.iter().enumerate() {
            for dependency in &record.dependencies {
                match resolve(set, &ids, dependency) {
                    Ok(prerequisite) => {
                        graph.add_edge(prerequisite, index, ());
                    }
                    Err(kind) => unknown.push(UnknownReference {
                        from: record.id.clone(),
                        to: dependency.clone(),
                        relation: Relation::Dependencies,
                        kind,
                    }),
                }
            }
            for blocked in &record.blocks {
                match resolve(set, &ids, blocked) {
                    Ok(dependent) => {
                        graph.add_edge(index, dependent, ());
                    }
                    Err(kind) => unknown.push(UnknownReference {
                        from: record.id.clone(),
                        to: blocked.clone(),
                        relation: Relation::Blocks,
                        kind,
                    }),
                }
            }
        }

        for reference in &unknown {
            warn!(%reference, "unresolved reference");
        }

        Self {
            ids,
            weights,
            statuses,
            graph,
            unknown,
        }
    }

    /// Number of live records in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// References that point outside the live graph.
    #[must_use]
    pub fn unknown_references(&self) -> &[UnknownReference] {
        &self.unknown
    }

    /// Every cycle in the graph.
    ///
    /// One linear Tarjan pass. Each strongly connected component with more
    /// than one member is reported in full, as is every self-dependent
    /// record. Members are sorted by id and cycles are sorted, so output is
    /// stable across runs. An acyclic graph yields an empty list.
    #[must_use]
    pub fn cycles(&self) -> Vec<Cycle> {
        let mut cycles = Vec::new();

        for component in tarjan_scc(&self.graph) {
            let is_cycle = match component.as_slice() {
                [] => false,
                [node] => self.graph.contains_edge(*node, *node),
                _ => true,
            };
            if !is_cycle {
                continue;
            }

            let mut members = component;
            members.sort_unstable();
            let members: Vec<_> = members.into_iter().map(|n| self.ids[n].clone()).collect();
            if let Some(members) = NonEmpty::from_vec(members) {
                cycles.push(Cycle { members });
            }
        }

        cycles.sort();
        cycles
    }

    /// Whether the graph contains any cycle.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.cycles().is_empty()
    }

    /// A topological order, prerequisites first.
    ///
    /// Kahn's algorithm; among records that are ready at the same time the
    /// smallest id goes first.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph is cyclic.
    pub fn topological_order(&self) -> Result<Vec<RequirementId>, GraphError> {
        self.sorted_indices()
            .map(|order| order.into_iter().map(|n| self.ids[n].clone()).collect())
    }

    fn sorted_indices(&self) -> Result<Vec<usize>, GraphError> {
        let cycles = self.cycles();
        if !cycles.is_empty() {
            return Err(GraphError::CycleDetected(cycles));
        }

        let mut indegree: Vec<usize> = (0..self.ids.len())
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<usize> = (0..self.ids.len())
            .filter(|&n| indegree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.ids.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        Ok(order)
    }

    /// The longest effort-weighted chain of dependencies.
    ///
    /// `longest[n] = effort[n] + max(longest[p] for each prerequisite p)`,
    /// computed in one pass over the topological order. Ties go to the
    /// earliest node in that order. An empty graph yields an empty path.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph is cyclic.
    pub fn critical_path(&self) -> Result<CriticalPath, GraphError> {
        let order = self.sorted_indices()?;

        let mut longest = vec![0.0_f64; self.ids.len()];
        let mut previous: Vec<Option<usize>> = vec![None; self.ids.len()];
        let mut end: Option<usize> = None;

        for &node in &order {
            let mut best: Option<usize> = None;
            let mut prerequisites: Vec<usize> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .collect();
            prerequisites.sort_unstable();
            for prerequisite in prerequisites {
                if best.is_none_or(|b| longest[prerequisite] > longest[b]) {
                    best = Some(prerequisite);
                }
            }

            longest[node] = self.weights[node] + best.map_or(0.0, |b| longest[b]);
            previous[node] = best;

            if end.is_none_or(|e| longest[node] > longest[e]) {
                end = Some(node);
            }
        }

        let Some(end) = end else {
            return Ok(CriticalPath {
                ids: Vec::new(),
                total_effort: 0.0,
            });
        };

        let mut path = vec![end];
        let mut cursor = end;
        while let Some(prerequisite) = previous[cursor] {
            path.push(prerequisite);
            cursor = prerequisite;
        }
        path.reverse();

        Ok(CriticalPath {
            ids: path.into_iter().map(|n| self.ids[n].clone()).collect(),
            total_effort: longest[end],
        })
    }

    /// Direct prerequisites of a record, in id order.
    #[must_use]
    pub fn prerequisites(&self, id: &RequirementId) -> Vec<RequirementId> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Records that directly depend on this one, in id order.
    #[must_use]
    pub fn dependents(&self, id: &RequirementId) -> Vec<RequirementId> {
        self.neighbours(id, Direction::Outgoing)
    }

    /// Every transitive prerequisite of a record, in id order.
    ///
    /// Terminates on cyclic graphs; a record inside a cycle lists itself.
    #[must_use]
    pub fn blocking_chain(&self, id: &RequirementId) -> Vec<RequirementId> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };

        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for prerequisite in self.graph.neighbors_directed(node, Direction::Incoming) {
                if seen.insert(prerequisite) {
                    stack.push(prerequisite);
                }
            }
        }

        seen.into_iter().map(|n| self.ids[n].clone()).collect()
    }

    /// Records that are not complete but whose prerequisites all are.
    #[must_use]
    pub fn ready(&self) -> Vec<RequirementId> {
        (0..self.ids.len())
            .filter(|&n| self.statuses[n] != Status::Complete)
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .all(|p| p != n && self.statuses[p] == Status::Complete)
            })
            .map(|n| self.ids[n].clone())
            .collect()
    }

    fn index_of(&self, id: &RequirementId) -> Option<usize> {
        self.ids.binary_search(id).ok()
    }

    fn neighbours(&self, id: &RequirementId, direction: Direction) -> Vec<RequirementId> {
        let Some(node) = self.index_of(id) else {
            return Vec::new();
        };
        let mut neighbours: Vec<_> = self.graph.neighbors_directed(node, direction).collect();
        neighbours.sort_unstable();
        neighbours.into_iter().map(|n| self.ids[n].clone()).collect()
    }
}

fn resolve(
    set: &RequirementSet,
    ids: &[RequirementId],
    target: &RequirementId,
) -> Result<usize, ReferenceKind> {
    ids.binary_search(target).map_err(|_| {
        if set.contains(target) {
            ReferenceKind::Tombstoned
        } else {
            ReferenceKind::Unknown
        }
    })
}

/// Everything the graph engine reports about a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GraphAnalysis {
    /// Every cycle; empty for a DAG.
    pub cycles: Vec<Cycle>,
    /// Prerequisites-first order, when acyclic.
    pub order: Option<Vec<RequirementId>>,
    /// The critical path, when acyclic.
    pub critical_path: Option<CriticalPath>,
    /// References outside the live graph.
    pub unknown_references: Vec<UnknownReference>,
}

impl GraphAnalysis {
    /// Runs every graph check over `set`.
    #[instrument(level = "debug", skip(set))]
    #[must_use]
    pub fn run(set: &RequirementSet, effort_column: &str) -> Self {
        let graph = DependencyGraph::build(set, effort_column);
        let cycles = graph.cycles();
        for cycle in &cycles {
            warn!(%cycle, "dependency cycle");
        }
        let (order, critical_path) = if cycles.is_empty() {
            (graph.topological_order().ok(), graph.critical_path().ok())
        } else {
            (None, None)
        };

        Self {
            cycles,
            order,
            critical_path,
            unknown_references: graph.unknown_references().to_vec(),
        }
    }
}
