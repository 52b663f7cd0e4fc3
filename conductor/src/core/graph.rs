//! Dependency graph analysis over work units.
//!
//! Units live in a flat arena sorted by id and are addressed by index; edges
//! are index pairs. Only hard edges take part in cycle detection, depth,
//! critical path, bottlenecks and parallel groups. Soft edges are kept for the
//! export and nothing else.
//!
//! A built graph is immutable. Derived results are cached on first use, so a
//! graph can be shared across lanes behind an `Arc` and queried concurrently.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::OnceLock;

use thiserror::Error;

use crate::core::invariants::validate_unit_id;
use crate::core::types::{DependencyEdge, EdgeKind, WorkUnit};

/// Tolerance used when comparing accumulated path weights.
const WEIGHT_EPSILON: f64 = 1e-9;

/// Default hard out-degree at which a unit counts as a bottleneck.
pub const DEFAULT_BOTTLENECK_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Hard edges form a cycle. Nodes are listed in cycle order.
    #[error("dependency cycle: {} -> {}", .cycle.join(" -> "), .cycle.first().map(String::as_str).unwrap_or(""))]
    Cycle { cycle: Vec<String> },
    #[error("duplicate work unit '{0}'")]
    DuplicateUnit(String),
    #[error("invalid work unit id: {0}")]
    InvalidUnitId(String),
    #[error("edge {from} -> {to} references unknown unit '{missing}'")]
    UnknownUnit {
        from: String,
        to: String,
        missing: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct IndexedEdge {
    from: usize,
    to: usize,
    kind: EdgeKind,
}

/// Immutable DAG of work units.
#[derive(Debug)]
pub struct DependencyGraph {
    units: Vec<WorkUnit>,
    index: HashMap<String, usize>,
    edges: Vec<IndexedEdge>,
    /// Hard successors per node, ascending index (= ascending id).
    successors: Vec<Vec<usize>>,
    /// Hard predecessors per node, ascending index.
    predecessors: Vec<Vec<usize>>,
    topo: Vec<usize>,
    depths: Vec<usize>,
    longest_to: OnceLock<Vec<f64>>,
    critical_path: OnceLock<Vec<usize>>,
    groups: OnceLock<Vec<Vec<String>>>,
}

impl DependencyGraph {
    /// Build a graph from units and explicit edges.
    ///
    /// Fails on duplicate ids, edges naming unknown units, or a cycle among
    /// hard edges.
    pub fn build(mut units: Vec<WorkUnit>, edges: Vec<DependencyEdge>) -> Result<Self, GraphError> {
        units.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            validate_unit_id(&unit.id).map_err(GraphError::InvalidUnitId)?;
            if index.insert(unit.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateUnit(unit.id.clone()));
            }
        }

        let mut seen = HashSet::new();
        let mut indexed = Vec::with_capacity(edges.len());
        let mut successors = vec![Vec::new(); units.len()];
        let mut predecessors = vec![Vec::new(); units.len()];
        for edge in &edges {
            let from = resolve(&index, edge, &edge.from)?;
            let to = resolve(&index, edge, &edge.to)?;
            let entry = IndexedEdge {
                from,
                to,
                kind: edge.kind,
            };
            if !seen.insert(entry) {
                continue;
            }
            indexed.push(entry);
            if edge.kind == EdgeKind::Hard {
                successors[from].push(to);
                predecessors[to].push(from);
            }
        }
        for list in successors.iter_mut().chain(predecessors.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }
        indexed.sort_by_key(|e| (e.from, e.to, e.kind));

        if let Some(cycle) = find_cycle(&successors) {
            return Err(GraphError::Cycle {
                cycle: cycle.into_iter().map(|i| units[i].id.clone()).collect(),
            });
        }

        let topo = topological_order(&successors, &predecessors);
        let depths = compute_depths(&topo, &predecessors);

        Ok(Self {
            units,
            index,
            edges: indexed,
            successors,
            predecessors,
            topo,
            depths,
            longest_to: OnceLock::new(),
            critical_path: OnceLock::new(),
            groups: OnceLock::new(),
        })
    }

    /// Build a graph whose edges come from each unit's dependency sets.
    pub fn from_units(units: Vec<WorkUnit>) -> Result<Self, GraphError> {
        let mut edges = Vec::new();
        for unit in &units {
            for dep in &unit.dependencies {
                edges.push(DependencyEdge::hard(dep.clone(), unit.id.clone()));
            }
            for dep in &unit.soft_dependencies {
                edges.push(DependencyEdge::soft(dep.clone(), unit.id.clone()));
            }
        }
        Self::build(units, edges)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Units in ascending id order.
    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn unit(&self, id: &str) -> Option<&WorkUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    /// All edges (hard and soft), sorted by (from, to, kind).
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.edges
            .iter()
            .map(|e| DependencyEdge {
                from: self.units[e.from].id.clone(),
                to: self.units[e.to].id.clone(),
                kind: e.kind,
            })
            .collect()
    }

    /// Hard prerequisites of `id`, ascending.
    pub fn hard_dependencies(&self, id: &str) -> Vec<&str> {
        self.ids_of(id, &self.predecessors)
    }

    /// Units that hard-depend on `id`, ascending.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.ids_of(id, &self.successors)
    }

    /// Units in a deterministic topological order (ties broken by id).
    pub fn topological_order(&self) -> Vec<&str> {
        self.topo.iter().map(|&i| self.units[i].id.as_str()).collect()
    }

    /// Length of the longest hard chain ending at `id`, counted in edges.
    pub fn depth(&self, id: &str) -> Option<usize> {
        self.index.get(id).map(|&i| self.depths[i])
    }

    /// Heaviest weighted hard chain ending at `id`, including its own weight.
    pub fn longest_path_to(&self, id: &str) -> Option<f64> {
        let i = *self.index.get(id)?;
        Some(self.longest_to()[i])
    }

    /// The heaviest weighted chain of hard dependencies.
    ///
    /// When several chains weigh the same, the one whose next node has the
    /// lexicographically smaller id wins, starting from the first node.
    pub fn critical_path(&self) -> Vec<&str> {
        self.critical_path
            .get_or_init(|| self.compute_critical_path())
            .iter()
            .map(|&i| self.units[i].id.as_str())
            .collect()
    }

    pub fn critical_path_length(&self) -> f64 {
        self.longest_to()
            .iter()
            .copied()
            .fold(0.0, f64::max)
    }

    /// Units with at least `threshold` direct hard dependents, ascending.
    pub fn bottlenecks(&self, threshold: usize) -> Vec<&str> {
        self.successors
            .iter()
            .enumerate()
            .filter(|(_, succ)| succ.len() >= threshold)
            .map(|(i, _)| self.units[i].id.as_str())
            .collect()
    }

    /// Units grouped by depth, in increasing depth order.
    ///
    /// No hard edge joins two units of the same depth, so each group can run
    /// in parallel once every earlier group it depends on is complete.
    pub fn parallel_groups(&self) -> &[Vec<String>] {
        self.groups.get_or_init(|| {
            let levels = self.depths.iter().copied().max().map_or(0, |d| d + 1);
            let mut groups = vec![Vec::new(); levels];
            for (i, &depth) in self.depths.iter().enumerate() {
                groups[depth].push(self.units[i].id.clone());
            }
            groups
        })
    }

    fn ids_of(&self, id: &str, adjacency: &[Vec<usize>]) -> Vec<&str> {
        match self.index.get(id) {
            Some(&i) => adjacency[i]
                .iter()
                .map(|&j| self.units[j].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    fn weight(&self, i: usize) -> f64 {
        self.units[i].weight
    }

    fn longest_to(&self) -> &[f64] {
        self.longest_to.get_or_init(|| {
            let mut best = vec![0.0; self.units.len()];
            for &v in &self.topo {
                let upstream = self.predecessors[v]
                    .iter()
                    .map(|&u| best[u])
                    .fold(0.0, f64::max);
                best[v] = upstream + self.weight(v);
            }
            best
        })
    }

    fn compute_critical_path(&self) -> Vec<usize> {
        // Heaviest chain starting at each node, so the walk can pick the
        // smallest qualifying successor at every hop.
        let mut longest_from = vec![0.0; self.units.len()];
        for &v in self.topo.iter().rev() {
            let downstream = self.successors[v]
                .iter()
                .map(|&w| longest_from[w])
                .fold(0.0, f64::max);
            longest_from[v] = downstream + self.weight(v);
        }

        let length = self.critical_path_length();
        let Some(mut current) = (0..self.units.len()).find(|&v| approx_eq(longest_from[v], length))
        else {
            return Vec::new();
        };

        let mut path = vec![current];
        loop {
            let remaining = longest_from[current] - self.weight(current);
            let next = self.successors[current]
                .iter()
                .copied()
                .find(|&w| approx_eq(longest_from[w], remaining));
            match next {
                Some(w) => {
                    path.push(w);
                    current = w;
                }
                None => break,
            }
        }
        path
    }
}

fn resolve(
    index: &HashMap<String, usize>,
    edge: &DependencyEdge,
    id: &str,
) -> Result<usize, GraphError> {
    index
        .get(id)
        .copied()
        .ok_or_else(|| GraphError::UnknownUnit {
            from: edge.from.clone(),
            to: edge.to.clone(),
            missing: id.to_string(),
        })
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= WEIGHT_EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Three-color DFS. Returns the nodes of the first cycle found, in cycle order.
fn find_cycle(successors: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut color = vec![Color::White; successors.len()];
    // (node, next successor cursor); doubles as the current DFS path.
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for start in 0..successors.len() {
        if color[start] != Color::White {
            continue;
        }
        color[start] = Color::Gray;
        stack.push((start, 0));

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let Some(&next) = successors[node].get(frame.1) else {
                color[node] = Color::Black;
                stack.pop();
                continue;
            };
            frame.1 += 1;
            match color[next] {
                Color::White => {
                    color[next] = Color::Gray;
                    stack.push((next, 0));
                }
                Color::Gray => {
                    let entry = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    return Some(stack[entry..].iter().map(|&(n, _)| n).collect());
                }
                Color::Black => {}
            }
        }
    }
    None
}

/// Kahn's algorithm with a min-heap so ties resolve by id.
fn topological_order(successors: &[Vec<usize>], predecessors: &[Vec<usize>]) -> Vec<usize> {
    let mut indegree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(successors.len());
    while let Some(Reverse(v)) = ready.pop() {
        order.push(v);
        for &w in &successors[v] {
            indegree[w] -= 1;
            if indegree[w] == 0 {
                ready.push(Reverse(w));
            }
        }
    }
    order
}

fn compute_depths(topo: &[usize], predecessors: &[Vec<usize>]) -> Vec<usize> {
    let mut depths = vec![0; predecessors.len()];
    for &v in topo {
        depths[v] = predecessors[v]
            .iter()
            .map(|&u| depths[u] + 1)
            .max()
            .unwrap_or(0);
    }
    depths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{diamond, unit, weighted};

    fn ids(groups: &[Vec<String>]) -> Vec<Vec<&str>> {
        groups
            .iter()
            .map(|g| g.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn diamond_critical_path_breaks_ties_lexicographically() {
        let graph = DependencyGraph::from_units(diamond()).expect("build");
        assert_eq!(graph.critical_path(), vec!["A", "B", "D"]);
        assert_eq!(graph.critical_path_length(), 3.0);
        assert_eq!(
            ids(graph.parallel_groups()),
            vec![vec!["A"], vec!["B", "C"], vec!["D"]]
        );
    }

    #[test]
    fn three_node_cycle_is_reported_in_order() {
        let units = vec![unit("A", &["C"]), unit("B", &["A"]), unit("C", &["B"])];
        let err = DependencyGraph::from_units(units).expect_err("cycle");
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["A".to_string(), "B".to_string(), "C".to_string()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: A -> B -> C -> A");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = DependencyGraph::from_units(vec![unit("A", &["A"])]).expect_err("cycle");
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["A".to_string()]
            }
        );
    }

    #[test]
    fn soft_edges_never_form_cycles() {
        let units = vec![
            unit("A", &[]),
            unit("B", &["A"]).soft_depends_on(["C"]),
            unit("C", &["B"]),
        ];
        // C -> B is soft, so A -> B -> C is still a DAG.
        let graph = DependencyGraph::from_units(units).expect("build");
        assert_eq!(graph.critical_path(), vec!["A", "B", "C"]);
    }

    #[test]
    fn reported_cycle_is_a_real_cycle() {
        let units = vec![
            unit("a", &[]),
            unit("b", &["a", "e"]),
            unit("c", &["b"]),
            unit("d", &["c"]),
            unit("e", &["d"]),
            unit("f", &["a"]),
        ];
        let GraphError::Cycle { cycle } = DependencyGraph::from_units(units.clone()).expect_err("cycle")
        else {
            panic!("expected cycle");
        };
        assert!(!cycle.is_empty());
        for (i, id) in cycle.iter().enumerate() {
            let next = &cycle[(i + 1) % cycle.len()];
            let dependent = units.iter().find(|u| &u.id == next).expect("unit");
            assert!(
                dependent.dependencies.contains(id),
                "{id} -> {next} is not a hard edge"
            );
        }
    }

    #[test]
    fn duplicate_and_unknown_units_are_rejected() {
        let err = DependencyGraph::from_units(vec![unit("A", &[]), unit("A", &[])])
            .expect_err("duplicate");
        assert_eq!(err, GraphError::DuplicateUnit("A".to_string()));

        let err = DependencyGraph::from_units(vec![unit("A", &["missing"])]).expect_err("unknown");
        assert!(matches!(err, GraphError::UnknownUnit { missing, .. } if missing == "missing"));
    }

    #[test]
    fn depth_follows_longest_hard_chain() {
        let units = vec![
            unit("a", &[]),
            unit("b", &["a"]),
            unit("c", &["b"]),
            unit("d", &["a", "c"]),
        ];
        let graph = DependencyGraph::from_units(units).expect("build");
        assert_eq!(graph.depth("a"), Some(0));
        assert_eq!(graph.depth("d"), Some(3));
        assert_eq!(graph.depth("zzz"), None);
    }

    #[test]
    fn weights_steer_the_critical_path() {
        let units = vec![
            weighted("A", 1.0, &[]),
            weighted("B", 1.0, &["A"]),
            weighted("C", 5.0, &["A"]),
            weighted("D", 1.0, &["B", "C"]),
        ];
        let graph = DependencyGraph::from_units(units).expect("build");
        assert_eq!(graph.critical_path(), vec!["A", "C", "D"]);
        assert_eq!(graph.critical_path_length(), 7.0);
        assert_eq!(graph.longest_path_to("C"), Some(6.0));
    }

    #[test]
    fn disconnected_components_pick_the_heaviest_chain() {
        let units = vec![
            unit("x", &[]),
            unit("a", &[]),
            unit("b", &["a"]),
            weighted("y", 4.0, &["x"]),
        ];
        let graph = DependencyGraph::from_units(units).expect("build");
        assert_eq!(graph.critical_path(), vec!["x", "y"]);
    }

    #[test]
    fn critical_path_ignores_soft_edges() {
        let base = vec![
            unit("a", &[]),
            unit("b", &["a"]),
            unit("c", &["a"]),
            unit("d", &["b"]),
            unit("e", &["c", "d"]),
            unit("f", &[]),
        ];
        let reference = DependencyGraph::from_units(base.clone()).expect("build");
        let expected_len = reference.critical_path_length();
        let expected_path: Vec<String> = reference
            .critical_path()
            .into_iter()
            .map(str::to_string)
            .collect();

        // Deterministic pseudo-random soft edges, including ones that point
        // backwards along hard chains.
        let ids = ["a", "b", "c", "d", "e", "f"];
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..50 {
            let mut units = base.clone();
            for unit in &mut units {
                seed = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                let pick = ids[(seed >> 33) as usize % ids.len()];
                if pick != unit.id {
                    unit.soft_dependencies.insert(pick.to_string());
                }
            }
            let graph = DependencyGraph::from_units(units).expect("soft edges never fail build");
            assert_eq!(graph.critical_path_length(), expected_len);
            assert_eq!(graph.critical_path(), expected_path);
        }
    }

    #[test]
    fn same_group_units_are_never_connected() {
        let units = vec![
            unit("a", &[]),
            unit("b", &["a"]),
            unit("c", &[]),
            unit("d", &["b", "c"]),
            unit("e", &["c"]),
            unit("f", &["e"]),
        ];
        let graph = DependencyGraph::from_units(units).expect("build");
        for group in graph.parallel_groups() {
            for x in group {
                for y in group {
                    assert!(!reaches(&graph, x, y) || x == y, "{x} reaches {y}");
                }
            }
        }
        for edge in graph.edges().iter().filter(|e| e.kind.is_blocking()) {
            assert!(graph.depth(&edge.from) < graph.depth(&edge.to));
        }
    }

    #[test]
    fn bottlenecks_use_hard_out_degree() {
        let units = vec![
            unit("core", &[]),
            unit("a", &["core"]),
            unit("b", &["core"]),
            unit("c", &[]).soft_depends_on(["core"]),
            unit("d", &["core"]),
        ];
        let graph = DependencyGraph::from_units(units).expect("build");
        assert_eq!(graph.bottlenecks(DEFAULT_BOTTLENECK_THRESHOLD), vec!["core"]);
        assert!(graph.bottlenecks(4).is_empty());
        assert_eq!(graph.dependents("core"), vec!["a", "b", "d"]);
    }

    #[test]
    fn empty_graph_has_no_plan() {
        let graph = DependencyGraph::from_units(Vec::new()).expect("build");
        assert!(graph.critical_path().is_empty());
        assert!(graph.parallel_groups().is_empty());
        assert_eq!(graph.critical_path_length(), 0.0);
    }

    fn reaches(graph: &DependencyGraph, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to && id != from {
                return true;
            }
            if seen.insert(id) {
                stack.extend(graph.dependents(id));
            }
        }
        false
    }
}
