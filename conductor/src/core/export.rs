//! Versioned plan export read by external dashboards and CLIs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::graph::DependencyGraph;
use crate::core::types::{EdgeKind, LifecycleState};

/// Bump when a field changes meaning or disappears.
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExport {
    pub schema_version: u32,
    pub nodes: Vec<ExportNode>,
    pub edges: Vec<ExportEdge>,
    pub critical_path: Vec<String>,
    pub critical_path_length: f64,
    pub bottlenecks: Vec<String>,
    pub parallel_groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportNode {
    pub id: String,
    pub status: LifecycleState,
    pub weight: f64,
    pub depth: usize,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    pub blocking: bool,
}

/// Build the export. `statuses` overrides the declared status with the
/// persisted lifecycle state where one exists.
pub fn export_graph(
    graph: &DependencyGraph,
    statuses: &BTreeMap<String, LifecycleState>,
    bottleneck_threshold: usize,
) -> GraphExport {
    let nodes = graph
        .units()
        .iter()
        .map(|unit| ExportNode {
            id: unit.id.clone(),
            status: statuses.get(&unit.id).copied().unwrap_or(unit.status),
            weight: unit.weight,
            depth: graph.depth(&unit.id).unwrap_or(0),
            metadata: unit.metadata.clone(),
        })
        .collect();
    let edges = graph
        .edges()
        .into_iter()
        .map(|edge| ExportEdge {
            blocking: edge.kind.is_blocking(),
            from: edge.from,
            to: edge.to,
            kind: edge.kind,
        })
        .collect();

    GraphExport {
        schema_version: EXPORT_SCHEMA_VERSION,
        nodes,
        edges,
        critical_path: owned(graph.critical_path()),
        critical_path_length: graph.critical_path_length(),
        bottlenecks: owned(graph.bottlenecks(bottleneck_threshold)),
        parallel_groups: graph.parallel_groups().to_vec(),
    }
}

fn owned(ids: Vec<&str>) -> Vec<String> {
    ids.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{diamond, unit};

    #[test]
    fn export_carries_plan_and_persisted_status() {
        let mut units = diamond();
        units.push(unit("E", &[]).soft_depends_on(["D"]));
        let graph = DependencyGraph::from_units(units).expect("build");
        let statuses = BTreeMap::from([("A".to_string(), LifecycleState::Complete)]);

        let export = export_graph(&graph, &statuses, 2);
        assert_eq!(export.schema_version, EXPORT_SCHEMA_VERSION);
        assert_eq!(export.nodes[0].status, LifecycleState::Complete);
        assert_eq!(export.nodes[1].status, LifecycleState::NotStarted);
        assert_eq!(export.critical_path, vec!["A", "B", "D"]);
        assert_eq!(export.bottlenecks, vec!["A"]);
        let soft = export
            .edges
            .iter()
            .find(|e| e.kind == EdgeKind::Soft)
            .expect("soft edge");
        assert_eq!((soft.from.as_str(), soft.to.as_str(), soft.blocking), ("D", "E", false));
        assert_eq!(export.parallel_groups[0], vec!["A", "E"]);
    }

    #[test]
    fn export_json_uses_stable_field_names() {
        let graph = DependencyGraph::from_units(vec![unit("only", &[])]).expect("build");
        let export = export_graph(&graph, &BTreeMap::new(), 3);
        let value = serde_json::to_value(&export).expect("json");
        for field in [
            "schema_version",
            "nodes",
            "edges",
            "critical_path",
            "bottlenecks",
            "parallel_groups",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["nodes"][0]["status"], "not_started");
    }
}
