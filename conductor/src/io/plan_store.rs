//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::graph::DependencyGraph;
use crate::core::invariants::validate_units;
use crate::core::types::WorkUnit;

pub const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan/v1.schema.json"
));

pub const PLAN_VERSION: u32 = 1;

/// On-disk plan (`.conductor/plan.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFile {
    pub version: u32,
    pub units: Vec<WorkUnit>,
}

impl PlanFile {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self {
            version: PLAN_VERSION,
            units,
        }
    }
}

/// Load and validate a plan (schema + invariants).
pub fn load_plan(plan_path: &Path) -> Result<Vec<WorkUnit>> {
    let contents = fs::read_to_string(plan_path)
        .with_context(|| format!("read plan {}", plan_path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", plan_path.display()))?;
    validate_schema(&value)?;
    let plan: PlanFile = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", plan_path.display()))?;
    validate_plan_invariants(&plan.units)?;
    Ok(plan.units)
}

/// Load a plan and build its dependency graph.
///
/// A cycle surfaces as a [`crate::core::graph::GraphError`] inside the
/// returned error, so callers can downcast it.
pub fn load_graph(plan_path: &Path) -> Result<DependencyGraph> {
    let units = load_plan(plan_path)?;
    let graph = DependencyGraph::from_units(units)?;
    Ok(graph)
}

/// Write a plan with units sorted by id.
pub fn write_plan(plan_path: &Path, units: &[WorkUnit]) -> Result<()> {
    let mut sorted = units.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let mut buf = serde_json::to_string_pretty(&PlanFile::new(sorted))?;
    buf.push('\n');
    fs::write(plan_path, buf).with_context(|| format!("write plan {}", plan_path.display()))
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_plan_invariants(units: &[WorkUnit]) -> Result<()> {
    let errors = validate_units(units);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("plan invariants failed: {}", errors.join("; ")))
}
