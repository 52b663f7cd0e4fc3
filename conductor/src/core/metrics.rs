//! Aggregate statistics over escalation records.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::types::{Escalation, EscalationStatus};

/// Category used for escalations without a `category` context tag.
pub const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub resolved: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn record(&mut self, status: EscalationStatus) {
        match status {
            EscalationStatus::Pending => self.pending += 1,
            EscalationStatus::Resolved => self.resolved += 1,
            EscalationStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.resolved + self.cancelled
    }
}

/// Resolution-time summary in seconds, over resolved escalations only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionTimes {
    pub count: usize,
    pub mean_secs: f64,
    pub p50_secs: f64,
    pub p90_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationMetrics {
    pub counts: StatusCounts,
    pub resolution: Option<ResolutionTimes>,
    pub by_category: BTreeMap<String, StatusCounts>,
}

pub fn compute_metrics(escalations: &[Escalation]) -> EscalationMetrics {
    let mut counts = StatusCounts::default();
    let mut by_category: BTreeMap<String, StatusCounts> = BTreeMap::new();
    let mut durations = Vec::new();

    for escalation in escalations {
        counts.record(escalation.status);
        let category = escalation.category().unwrap_or(UNCATEGORIZED).to_string();
        by_category
            .entry(category)
            .or_default()
            .record(escalation.status);
        if escalation.status == EscalationStatus::Resolved
            && let Some(resolved_at) = escalation.resolved_at
        {
            let millis = (resolved_at - escalation.created_at).num_milliseconds().max(0);
            durations.push(millis as f64 / 1000.0);
        }
    }

    EscalationMetrics {
        counts,
        resolution: summarize(durations),
        by_category,
    }
}

fn summarize(mut durations: Vec<f64>) -> Option<ResolutionTimes> {
    if durations.is_empty() {
        return None;
    }
    durations.sort_by(f64::total_cmp);
    let count = durations.len();
    let mean = durations.iter().sum::<f64>() / count as f64;
    Some(ResolutionTimes {
        count,
        mean_secs: mean,
        p50_secs: percentile(&durations, 50.0),
        p90_secs: percentile(&durations, 90.0),
        max_secs: durations[count - 1],
    })
}

/// Nearest-rank percentile over sorted, non-empty input.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
