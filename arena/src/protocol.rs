//! Two-phase plan-then-apply protocol over an [`Agent`].

use std::path::Path;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::io::agent::{Agent, Step, StepOutput, StepRequest};

/// Separator between plan and apply output in combined views.
pub const STEP_SEPARATOR: &str = "\n---\n";

/// Result of one protocol run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolOutcome {
    pub plan: StepOutput,
    /// `None` when the plan failed and apply was skipped.
    pub apply: Option<StepOutput>,
}

impl ProtocolOutcome {
    /// Apply's result is authoritative; a skipped apply is a failure.
    pub fn succeeded(&self) -> bool {
        self.apply.as_ref().is_some_and(StepOutput::succeeded)
    }

    /// Apply's exit code, or the plan's when apply never ran.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.apply {
            Some(apply) => apply.exit_code,
            None => self.plan.exit_code,
        }
    }

    pub fn combined_stdout(&self) -> String {
        self.combine(|output| &output.stdout)
    }

    pub fn combined_stderr(&self) -> String {
        self.combine(|output| &output.stderr)
    }

    fn combine(&self, field: impl Fn(&StepOutput) -> &String) -> String {
        match &self.apply {
            Some(apply) => format!("{}{STEP_SEPARATOR}{}", field(&self.plan), field(apply)),
            None => field(&self.plan).clone(),
        }
    }

    /// Short reason for a failed run, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        let (step, output) = match &self.apply {
            None => (Step::Plan, &self.plan),
            Some(apply) if !apply.succeeded() => (Step::Apply, apply),
            Some(_) => return None,
        };
        let suffix = if output.timed_out { " (timed out)" } else { "" };
        Some(format!("{step} step failed{suffix}"))
    }
}

/// A step that could not be run at all, as opposed to one that ran and failed.
#[derive(Debug, Error)]
#[error("{step} step could not run: {cause:#}")]
pub struct ProtocolError {
    pub step: Step,
    /// Output of a plan step that completed before apply broke down.
    pub plan: Option<StepOutput>,
    pub cause: anyhow::Error,
}

/// Run the plan step, then, only if it succeeded, the apply step.
///
/// `render_apply` receives the plan's stdout and returns the apply prompt.
pub fn run_plan_then_apply<A, F>(
    agent: &A,
    repo: &Path,
    plan_text: &str,
    render_apply: F,
) -> Result<ProtocolOutcome, ProtocolError>
where
    A: Agent + ?Sized,
    F: FnOnce(&str) -> Result<String>,
{
    let plan = agent
        .run_step(&StepRequest {
            repo,
            step: Step::Plan,
            prompt: plan_text,
        })
        .map_err(|cause| ProtocolError {
            step: Step::Plan,
            plan: None,
            cause,
        })?;
    if !plan.succeeded() {
        warn!(exit_code = ?plan.exit_code, timed_out = plan.timed_out, "plan failed, skipping apply");
        return Ok(ProtocolOutcome { plan, apply: None });
    }

    let apply = render_apply(&plan.stdout).and_then(|apply_text| {
        agent.run_step(&StepRequest {
            repo,
            step: Step::Apply,
            prompt: &apply_text,
        })
    });
    let apply = match apply {
        Ok(apply) => apply,
        Err(cause) => {
            return Err(ProtocolError {
                step: Step::Apply,
                plan: Some(plan),
                cause,
            });
        }
    };
    info!(exit_code = ?apply.exit_code, "apply finished");
    Ok(ProtocolOutcome {
        plan,
        apply: Some(apply),
    })
}
