//! Semantic invariants on plan declarations not expressible via JSON Schema.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::WorkUnit;

static UNIT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").unwrap());

/// Check a unit id is safe to embed in state keys, paths and branch names.
pub fn validate_unit_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if !UNIT_ID_RE.is_match(id) {
        return Err(format!(
            "id must match [A-Za-z0-9_][A-Za-z0-9._-]* (got '{id}')"
        ));
    }
    if id.contains("..") || id.ends_with('.') || id.ends_with(".lock") {
        return Err(format!("id '{id}' is not a valid branch component"));
    }
    // The state store reserves this suffix for in-flight writes.
    if id.ends_with(".tmp") {
        return Err(format!("id '{id}' must not end in .tmp"));
    }
    Ok(())
}

/// Check plan-level invariants:
/// - ids are well formed and unique
/// - `weight` is finite and positive
/// - no unit depends on itself
/// - every dependency names a declared unit
/// - a dependency is either hard or soft, not both
///
/// Cycles are reported by [`crate::core::graph::DependencyGraph::build`].
pub fn validate_units(units: &[WorkUnit]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for unit in units {
        if let Err(err) = validate_unit_id(&unit.id) {
            errors.push(err);
        }
        if !seen.insert(unit.id.as_str()) {
            errors.push(format!("duplicate id '{}'", unit.id));
        }
    }

    for unit in units {
        if !unit.weight.is_finite() || unit.weight <= 0.0 {
            errors.push(format!("{}: weight must be > 0 (got {})", unit.id, unit.weight));
        }
        let declared = unit
            .dependencies
            .iter()
            .map(|d| (d, "dependency"))
            .chain(unit.soft_dependencies.iter().map(|d| (d, "soft dependency")));
        for (dep, label) in declared {
            if dep == &unit.id {
                errors.push(format!("{}: {label} on itself", unit.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("{}: {label} '{dep}' is not declared", unit.id));
            }
        }
        for dep in unit.dependencies.intersection(&unit.soft_dependencies) {
            errors.push(format!("{}: '{dep}' is both a hard and a soft dependency", unit.id));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unit;

    #[test]
    fn accepts_well_formed_plan() {
        let units = vec![unit("story-1", &[]), unit("story-2", &["story-1"])];
        assert!(validate_units(&units).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let units = vec![
            unit("dup", &[]),
            unit("dup", &[]),
            unit("bad/id", &[]),
            unit("loop", &["loop", "ghost"]).with_weight(0.0),
            unit("both", &["dup"]).soft_depends_on(["dup"]),
        ];
        let errors = validate_units(&units);
        assert!(errors.iter().any(|e| e.contains("duplicate id 'dup'")));
        assert!(errors.iter().any(|e| e.contains("bad/id")));
        assert!(errors.iter().any(|e| e.contains("loop: dependency on itself")));
        assert!(errors.iter().any(|e| e.contains("'ghost' is not declared")));
        assert!(errors.iter().any(|e| e.contains("weight must be > 0")));
        assert!(errors.iter().any(|e| e.contains("both a hard and a soft")));
    }

    #[test]
    fn unit_ids_must_be_branch_safe() {
        assert!(validate_unit_id("story-1.2").is_ok());
        assert!(validate_unit_id("-flag").is_err());
        assert!(validate_unit_id(".hidden").is_err());
        assert!(validate_unit_id("a..b").is_err());
        assert!(validate_unit_id("refs.lock").is_err());
        assert!(validate_unit_id("").is_err());
    }

    #[test]
    fn unit_ids_must_be_storable() {
        assert!(validate_unit_id("build.tmp").is_err());
        assert!(validate_unit_id("tmp-build").is_ok());
        let errors = validate_units(&[unit("build.tmp", &[])]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("build.tmp"));
    }
}
