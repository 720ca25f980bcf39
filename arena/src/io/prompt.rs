//! Plan and apply prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const APPLY_TEMPLATE: &str = include_str!("prompts/apply.md");

/// Substituted when the plan step printed nothing.
pub const MISSING_PLAN: &str = "Plan output missing.";

/// Values shared by both templates.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub job_id: &'a str,
    pub repo: &'a str,
    pub prompt: &'a str,
    pub rules: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("compile plan template")?;
        env.add_template("apply", APPLY_TEMPLATE)
            .context("compile apply template")?;
        Ok(Self { env })
    }

    pub fn render_plan(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template
            .render(context! {
                job_id => input.job_id,
                repo => input.repo,
                prompt => input.prompt.trim(),
                rules => input.rules.trim(),
            })
            .context("render plan prompt")?;
        Ok(rendered)
    }

    /// Render the apply prompt with the plan step's stdout embedded verbatim.
    pub fn render_apply(&self, input: &PromptInputs<'_>, plan_output: &str) -> Result<String> {
        let plan = match plan_output.trim() {
            "" => MISSING_PLAN,
            trimmed => trimmed,
        };
        let template = self.env.get_template("apply")?;
        let rendered = template
            .render(context! {
                job_id => input.job_id,
                repo => input.repo,
                prompt => input.prompt.trim(),
                rules => input.rules.trim(),
                plan => plan,
            })
            .context("render apply prompt")?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PromptInputs<'static> {
        PromptInputs {
            job_id: "job-1",
            repo: "/tmp/repo",
            prompt: "  add a README \n",
            rules: "be careful",
        }
    }

    #[test]
    fn plan_prompt_includes_task_and_rules() {
        let engine = PromptEngine::new().expect("engine");
        let rendered = engine.render_plan(&inputs()).expect("render");
        assert!(rendered.contains("job-1"));
        assert!(rendered.contains("/tmp/repo"));
        assert!(rendered.contains("\nadd a README\n"));
        assert!(rendered.contains("be careful"));
    }

    #[test]
    fn apply_prompt_embeds_plan_verbatim() {
        let engine = PromptEngine::new().expect("engine");
        let plan = "1. create README.md\n2. <commit> & \"verify\"";
        let rendered = engine.render_apply(&inputs(), plan).expect("render");
        assert!(rendered.contains(plan));
    }

    #[test]
    fn blank_plan_is_replaced() {
        let engine = PromptEngine::new().expect("engine");
        let rendered = engine.render_apply(&inputs(), " \n").expect("render");
        assert!(rendered.contains(MISSING_PLAN));
    }
}
