//! Read-only accessors over a template's ordered step list.

use std::collections::HashSet;

use chrono::Duration;

use drip_core::{DripError, DripResult};

use crate::types::{SequenceTemplate, StepDefinition};

/// Returns the step at `index`, or `StepNotFound` when the template is shorter.
pub fn step_at(template: &SequenceTemplate, index: u32) -> DripResult<&StepDefinition> {
    template
        .steps
        .get(index as usize)
        .ok_or_else(|| DripError::StepNotFound {
            template_id: template.id.to_string(),
            index,
        })
}

/// Wait before the step at `index` becomes due. A step missing from an edited
/// template has no wait, so the advancer resolves it on the next tick.
pub fn delay_before(template: &SequenceTemplate, index: u32) -> Duration {
    step_at(template, index)
        .map(|step| Duration::days(i64::from(step.delay_days)))
        .unwrap_or_else(|_| Duration::zero())
}

/// Validates that step numbers are 0-based, unique and strictly increasing
/// without gaps, and that every step references content.
pub fn validate_steps(steps: &[StepDefinition]) -> DripResult<()> {
    let mut seen = HashSet::with_capacity(steps.len());
    for (position, step) in steps.iter().enumerate() {
        if !seen.insert(step.step_number) {
            return Err(DripError::InvalidStepDefinition(format!(
                "duplicate step number {}",
                step.step_number
            )));
        }
        if step.step_number as usize != position {
            return Err(DripError::InvalidStepDefinition(format!(
                "step number {} at position {} (expected {})",
                step.step_number, position, position
            )));
        }
        if step.content_ref.trim().is_empty() {
            return Err(DripError::InvalidStepDefinition(format!(
                "step {} has an empty content reference",
                step.step_number
            )));
        }
    }
    Ok(())
}
