//! Ordered lifecycle hooks.
//!
//! Hooks observe; they cannot veto. A hook that returns an error is logged
//! and the remaining hooks still run.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::types::LifecycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    BeforeTransition,
    AfterTransition,
    LaneStarted,
    LaneFinished,
}

impl HookPoint {
    pub const ALL: [HookPoint; 4] = [
        HookPoint::BeforeTransition,
        HookPoint::AfterTransition,
        HookPoint::LaneStarted,
        HookPoint::LaneFinished,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub point: HookPoint,
    pub unit: String,
    /// Set for transition events.
    pub from: Option<LifecycleState>,
    pub to: Option<LifecycleState>,
    /// Set for `LaneFinished`: `completed`, `parked` or `failed`.
    pub outcome: Option<String>,
}

impl HookEvent {
    pub fn transition(
        point: HookPoint,
        unit: &str,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Self {
        Self {
            point,
            unit: unit.to_string(),
            from: Some(from),
            to: Some(to),
            outcome: None,
        }
    }

    pub fn lane(point: HookPoint, unit: &str, outcome: Option<&str>) -> Self {
        Self {
            point,
            unit: unit.to_string(),
            from: None,
            to: None,
            outcome: outcome.map(str::to_string),
        }
    }
}

pub type Hook = Box<dyn Fn(&HookEvent) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<HookPoint, Vec<(String, Hook)>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: BTreeMap<_, Vec<&str>> = self
            .hooks
            .iter()
            .map(|(point, hooks)| (point, hooks.iter().map(|(n, _)| n.as_str()).collect()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &names).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that logs every event through `tracing`.
    pub fn with_tracing() -> Self {
        let mut registry = Self::new();
        for point in HookPoint::ALL {
            registry.register(point, "trace", trace_event);
        }
        registry
    }

    /// Register `hook` to run at `point`, after any hooks already registered there.
    pub fn register<F>(&mut self, point: HookPoint, name: impl Into<String>, hook: F)
    where
        F: Fn(&HookEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .entry(point)
            .or_default()
            .push((name.into(), Box::new(hook)));
    }

    /// Run every hook for `event.point` in order. Returns the number that failed.
    pub fn fire(&self, event: &HookEvent) -> usize {
        let Some(hooks) = self.hooks.get(&event.point) else {
            return 0;
        };
        let mut failures = 0;
        for (name, hook) in hooks {
            if let Err(err) = hook(event) {
                failures += 1;
                warn!(hook = %name, point = ?event.point, unit = %event.unit, err = %err, "hook failed");
            }
        }
        failures
    }
}

fn trace_event(event: &HookEvent) -> Result<()> {
    info!(
        point = ?event.point,
        unit = %event.unit,
        from = ?event.from,
        to = ?event.to,
        outcome = ?event.outcome,
        "lifecycle event"
    );
    Ok(())
}
