use std::collections::HashMap;

use uuid::Uuid;

use crate::types::{RunStatus, SequenceAnalytics, SequenceRun};

/// Computes aggregate statistics for a template from its runs. Terminal runs
/// are retained by the store, so this covers the template's full history.
pub fn summarize(template_id: Uuid, runs: &[SequenceRun]) -> SequenceAnalytics {
    let mut active: u64 = 0;
    let mut paused: u64 = 0;
    let mut completed: u64 = 0;
    let mut cancelled: u64 = 0;
    let mut steps_dispatched: u64 = 0;
    let mut steps_skipped: u64 = 0;
    let mut total_completion_secs: f64 = 0.0;
    let mut stop_reasons: HashMap<String, u64> = HashMap::new();

    let mut total_enrolled: u64 = 0;
    for run in runs.iter().filter(|r| r.template_ref == template_id) {
        total_enrolled += 1;
        steps_dispatched += u64::from(run.steps_completed);
        steps_skipped += u64::from(run.steps_skipped);

        match run.status {
            RunStatus::Active => active += 1,
            RunStatus::Paused => paused += 1,
            RunStatus::Completed => {
                completed += 1;
                if let Some(done) = run.completed_at {
                    total_completion_secs +=
                        done.signed_duration_since(run.started_at).num_seconds() as f64;
                }
            }
            RunStatus::Cancelled => cancelled += 1,
        }

        if let Some(reason) = &run.stop_reason {
            *stop_reasons.entry(reason.clone()).or_insert(0) += 1;
        }
    }

    let completion_rate = if total_enrolled > 0 {
        completed as f64 / total_enrolled as f64
    } else {
        0.0
    };
    let avg_completion_secs = if completed > 0 {
        total_completion_secs / completed as f64
    } else {
        0.0
    };

    SequenceAnalytics {
        template_id,
        total_enrolled,
        active,
        paused,
        completed,
        cancelled,
        steps_dispatched,
        steps_skipped,
        completion_rate,
        avg_completion_secs,
        stop_reasons,
    }
}
