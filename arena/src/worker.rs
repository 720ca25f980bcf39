//! Processing of one claimed job from `running/` to a terminal state.

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::job::JobRecord;
use crate::core::repo_key::compute_repo_key;
use crate::io::agent::{Agent, Step};
use crate::io::artifacts::ArtifactBundle;
use crate::io::journal::{Journal, LogEntry, round_secs};
use crate::io::paths::ArenaPaths;
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::rules::assemble_rules;
use crate::io::store::{ClaimedJob, JobStore};
use crate::protocol::run_plan_then_apply;

pub const EMPTY_PROMPT: &str = "Empty prompt provided.";

/// Everything a worker thread needs. Shared by reference across the pool.
pub struct WorkerContext<A> {
    pub store: JobStore,
    pub agent: A,
    pub journal: Journal,
    pub prompts: PromptEngine,
}

impl<A: Agent> WorkerContext<A> {
    pub fn new(paths: ArenaPaths, agent: A) -> Result<Self> {
        let journal = Journal::new(paths.log_path.clone());
        Ok(Self {
            store: JobStore::new(paths),
            agent,
            journal,
            prompts: PromptEngine::new()?,
        })
    }

    pub fn paths(&self) -> &ArenaPaths {
        self.store.paths()
    }
}

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub id: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Run `claimed` through validation and the agent protocol, move it to
/// `done/` or `failed/`, and append its log entry.
///
/// Job-level failures (bad record, invalid repo, agent missing, failed
/// steps) are `Ok` outcomes. `Err` means the worker itself could not make
/// progress, e.g. the artifact directory or the queue rename failed.
#[instrument(skip_all, fields(job_id = %claimed.id))]
pub fn process_claimed<A: Agent>(ctx: &WorkerContext<A>, claimed: &ClaimedJob) -> Result<JobOutcome> {
    let started = Instant::now();

    let record = match read_record(&claimed.path) {
        Ok(record) => record,
        Err(err) => {
            let message = format!("invalid job record: {err:#}");
            warn!("{message}");
            return settle(ctx, claimed, LogEntry::new(&claimed.id, false).with_error(message), started);
        }
    };

    let repo_key = record
        .repo_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| compute_repo_key(&record.repo));
    let bundle = ArtifactBundle::new(&ctx.paths().artifacts_dir, &repo_key, &claimed.id);
    bundle.create()?;

    let error = run_job(ctx, claimed, &record, &bundle)?;
    let mut entry = LogEntry::new(&claimed.id, error.is_none());
    entry.error = error;
    entry.repo = Some(record.repo);
    entry.repo_key = Some(repo_key);
    settle(ctx, claimed, entry, started)
}

/// Returns the failure message, or `None` when apply succeeded.
fn run_job<A: Agent>(
    ctx: &WorkerContext<A>,
    claimed: &ClaimedJob,
    record: &JobRecord,
    bundle: &ArtifactBundle,
) -> Result<Option<String>> {
    let repo = Path::new(&record.repo);
    if record.repo.trim().is_empty() || !repo.is_dir() {
        let message = format!("Repository path does not exist: {}", record.repo);
        bundle.write_error(&message)?;
        return Ok(Some(message));
    }
    if record.prompt.trim().is_empty() {
        bundle.write_error(EMPTY_PROMPT)?;
        return Ok(Some(EMPTY_PROMPT.to_string()));
    }

    let rules = assemble_rules(repo, &ctx.paths().agent_rules_path);
    let inputs = PromptInputs {
        job_id: &claimed.id,
        repo: &record.repo,
        prompt: &record.prompt,
        rules: &rules,
    };
    let plan_text = ctx.prompts.render_plan(&inputs)?;
    let outcome = match run_plan_then_apply(&ctx.agent, repo, &plan_text, |plan| {
        ctx.prompts.render_apply(&inputs, plan)
    }) {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = err.to_string();
            warn!("agent protocol failed: {message}");
            if let Some(plan) = &err.plan {
                bundle.write_step(Step::Plan, plan)?;
            }
            bundle.write_error(&message)?;
            return Ok(Some(message));
        }
    };

    bundle.write_step(Step::Plan, &outcome.plan)?;
    if let Some(apply) = &outcome.apply {
        bundle.write_step(Step::Apply, apply)?;
    }
    Ok(outcome.failure_reason())
}

fn settle<A: Agent>(
    ctx: &WorkerContext<A>,
    claimed: &ClaimedJob,
    mut entry: LogEntry,
    started: Instant,
) -> Result<JobOutcome> {
    let state = ctx.store.finish(claimed, entry.ok)?;
    entry.latency_s = Some(round_secs(started.elapsed().as_secs_f64()));
    ctx.journal.append(&entry)?;
    info!(%state, error = entry.error.as_deref().unwrap_or(""), "job finished");
    Ok(JobOutcome {
        id: entry.id,
        ok: entry.ok,
        error: entry.error,
    })
}

fn read_record(path: &Path) -> Result<JobRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobState;
    use crate::io::journal::read_entries;
    use crate::test_support::{ScriptedAgent, ScriptedStep, TestArena};

    fn claim_one<A: Agent>(ctx: &WorkerContext<A>) -> ClaimedJob {
        ctx.store.claim().expect("claim").expect("job available")
    }

    #[test]
    fn successful_job_lands_in_done_with_artifacts() {
        let arena = TestArena::new().expect("arena");
        arena.enqueue("job-1", "add a README").expect("enqueue");
        let ctx = arena.context(ScriptedAgent::succeeding()).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert!(outcome.ok);
        assert_eq!(ctx.store.locate("job-1"), Some(JobState::Done));

        let bundle = ArtifactBundle::new(&arena.paths().artifacts_dir, &arena.repo_key(), "job-1");
        assert_eq!(fs::read_to_string(&bundle.plan_stdout_path).expect("plan"), "1. edit files");
        assert_eq!(fs::read_to_string(&bundle.apply_stdout_path).expect("apply"), "applied");
        assert!(!bundle.error_path.exists());

        let entries = read_entries(&arena.paths().log_path).expect("log");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ok);
        assert_eq!(entries[0].repo_key.as_deref(), Some(arena.repo_key().as_str()));
        assert!(entries[0].latency_s.is_some());
    }

    #[test]
    fn plan_prompt_embeds_task_and_rules() {
        let arena = TestArena::new().expect("arena");
        fs::create_dir_all(arena.repo().join("docs")).expect("docs");
        fs::write(arena.repo().join("docs/rules.md"), "HOST RULE").expect("rules");
        fs::write(&arena.paths().agent_rules_path, "AGENT RULE").expect("agent rules");
        arena.enqueue("job-1", "rename the module").expect("enqueue");
        let ctx = arena.context(ScriptedAgent::succeeding()).expect("ctx");

        process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        let calls = ctx.agent.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].repo, arena.repo());
        let plan_prompt = &calls[0].prompt;
        assert!(plan_prompt.contains("rename the module"));
        let host_at = plan_prompt.find("HOST RULE").expect("host rule");
        let agent_at = plan_prompt.find("AGENT RULE").expect("agent rule");
        assert!(host_at < agent_at);
        assert!(calls[1].prompt.contains("1. edit files"));
    }

    #[test]
    fn missing_repo_fails_without_invoking_agent() {
        let arena = TestArena::new().expect("arena");
        let missing = arena.root().join("nope");
        arena.enqueue_for("job-1", "do it", &missing).expect("enqueue");
        let ctx = arena.context(ScriptedAgent::succeeding()).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert!(!outcome.ok);
        assert!(
            outcome
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with("Repository path does not exist"))
        );
        assert!(ctx.agent.calls().is_empty());
        assert_eq!(ctx.store.locate("job-1"), Some(JobState::Failed));

        let key = compute_repo_key(&missing.to_string_lossy());
        let bundle = ArtifactBundle::new(&arena.paths().artifacts_dir, &key, "job-1");
        assert!(bundle.error_path.exists());
        assert!(!bundle.plan_stdout_path.exists());
    }

    #[test]
    fn blank_prompt_fails_validation() {
        let arena = TestArena::new().expect("arena");
        arena.enqueue("job-1", "   \n").expect("enqueue");
        let ctx = arena.context(ScriptedAgent::succeeding()).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert_eq!(outcome.error.as_deref(), Some(EMPTY_PROMPT));
        assert!(ctx.agent.calls().is_empty());
    }

    #[test]
    fn plan_failure_writes_no_apply_artifacts() {
        let arena = TestArena::new().expect("arena");
        arena.enqueue("job-1", "do it").expect("enqueue");
        let agent = ScriptedAgent::new(ScriptedStep::failing(3), ScriptedStep::ok("never"));
        let ctx = arena.context(agent).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert_eq!(outcome.error.as_deref(), Some("plan step failed"));
        assert_eq!(ctx.agent.calls_for(Step::Apply), 0);

        let bundle = ArtifactBundle::new(&arena.paths().artifacts_dir, &arena.repo_key(), "job-1");
        assert!(bundle.plan_stderr_path.exists());
        assert!(!bundle.apply_stdout_path.exists());
        assert!(!bundle.apply_stderr_path.exists());
        assert_eq!(ctx.store.locate("job-1"), Some(JobState::Failed));
    }

    #[test]
    fn apply_failure_is_terminal_failure() {
        let arena = TestArena::new().expect("arena");
        arena.enqueue("job-1", "do it").expect("enqueue");
        let agent = ScriptedAgent::new(ScriptedStep::ok("plan"), ScriptedStep::failing(1));
        let ctx = arena.context(agent).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert_eq!(outcome.error.as_deref(), Some("apply step failed"));
        assert_eq!(ctx.store.locate("job-1"), Some(JobState::Failed));
    }

    #[test]
    fn unavailable_agent_fails_job_with_error_file() {
        let arena = TestArena::new().expect("arena");
        arena.enqueue("job-1", "do it").expect("enqueue");
        let ctx = arena.context(ScriptedAgent::unavailable()).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert!(!outcome.ok);
        let bundle = ArtifactBundle::new(&arena.paths().artifacts_dir, &arena.repo_key(), "job-1");
        let error = fs::read_to_string(&bundle.error_path).expect("error.txt");
        assert!(error.contains("not found"));
    }

    #[test]
    fn apply_error_keeps_plan_artifacts() {
        let arena = TestArena::new().expect("arena");
        arena.enqueue("job-1", "do it").expect("enqueue");
        let agent = ScriptedAgent::succeeding().with_apply_error("apply spawn failed");
        let ctx = arena.context(agent).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert!(!outcome.ok);
        assert_eq!(ctx.store.locate("job-1"), Some(JobState::Failed));

        let bundle = ArtifactBundle::new(&arena.paths().artifacts_dir, &arena.repo_key(), "job-1");
        assert_eq!(fs::read_to_string(&bundle.plan_stdout_path).expect("plan"), "1. edit files");
        assert!(!bundle.apply_stdout_path.exists());
        let error = fs::read_to_string(&bundle.error_path).expect("error.txt");
        assert!(error.contains("apply spawn failed"));
        assert_eq!(outcome.error.as_deref(), Some(error.as_str()));
    }

    #[test]
    fn corrupt_record_fails_with_file_stem_id() {
        let arena = TestArena::new().expect("arena");
        fs::write(arena.paths().inbox_dir.join("broken.json"), "{not json").expect("write");
        let ctx = arena.context(ScriptedAgent::succeeding()).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert_eq!(outcome.id, "broken");
        assert!(
            outcome
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with("invalid job record"))
        );
        assert_eq!(ctx.store.locate("broken"), Some(JobState::Failed));
        let entries = read_entries(&arena.paths().log_path).expect("log");
        assert_eq!(entries[0].id, "broken");
        assert!(!entries[0].ok);
    }

    #[test]
    fn legacy_dir_field_is_accepted() {
        let arena = TestArena::new().expect("arena");
        let legacy = serde_json::json!({
            "id": "old",
            "prompt": "do it",
            "dir": arena.repo().to_string_lossy(),
        });
        fs::write(arena.paths().inbox_dir.join("old.json"), legacy.to_string()).expect("write");
        let ctx = arena.context(ScriptedAgent::succeeding()).expect("ctx");

        let outcome = process_claimed(&ctx, &claim_one(&ctx)).expect("process");
        assert!(outcome.ok);
    }
}
