//! Deterministic built-in steps.
//!
//! Each step writes its artifact and one shared note. None of them look at
//! their dependencies, so they work with any `D`.

use super::{Step, StepOutcome};
use crate::context::{PipelineContext, QaVerdict};
use crate::core::StepName;
use crate::pipeline::Outcome;
use async_trait::async_trait;
use serde_json::json;

/// Drafts the product requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for ProductStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        let title = format!("PRD for {}", ctx.run_id);
        ctx.add_note(StepName::Product, format!("Drafted PRD: {title}"));
        ctx.artifacts.prd = Some(json!({
            "title": title,
            "user_stories": ["As a user I can start a run", "As a user I can resume a run"],
            "acceptance_criteria": ["Every attempt is recorded"],
        }));
        Outcome::Ok(ctx)
    }
}

/// Reviews the design against usability heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesignStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for DesignStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        let score = 82;
        ctx.artifacts.design = Some(json!({
            "heuristics_score": score,
            "findings": ["Primary action is visible"],
        }));
        ctx.add_note(StepName::Design, format!("Design review score {score}"));
        Outcome::Ok(ctx)
    }
}

/// Summarizes research evidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResearchStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for ResearchStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        let evidence = ["interview-1", "survey-2"];
        ctx.add_note(
            StepName::Research,
            format!("Research summary ready with {} citations", evidence.len()),
        );
        ctx.artifacts.research = Some(json!({
            "summary": "Users want resumable runs",
            "evidence": evidence,
        }));
        Outcome::Ok(ctx)
    }
}

/// Derives the technical plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanningStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for PlanningStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        let tasks = ["Create endpoint", "Write unit tests"];
        ctx.add_note(StepName::Planning, format!("Tech plan with {} tasks", tasks.len()));
        ctx.artifacts.plan = Some(json!({
            "architecture": "HTTP service backed by a relational store",
            "tasks": tasks,
        }));
        Outcome::Ok(ctx)
    }
}

/// Produces the code patch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineerStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for EngineerStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        ctx.artifacts.code_patch =
            Some("diff --git a/README.md b/README.md\n+Generated patch\n".to_string());
        ctx.add_note(StepName::Engineer, "Patch prepared");
        Outcome::Ok(ctx)
    }
}

/// Judges the patch.
///
/// Fails while `force_qa_fail` is set and fewer than `max_qa_loops` qa
/// attempts have been made; passes otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct QaStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for QaStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        let attempts = ctx.qa_attempts + 1;
        ctx.qa_attempts = attempts;

        let passed = !(ctx.controls.force_qa_fail && attempts < ctx.controls.max_qa_loops);
        ctx.artifacts.tests_result = Some(QaVerdict { passed, attempts });
        ctx.add_note(
            StepName::Qa,
            format!(
                "QA attempt {attempts}: {}",
                if passed { "passed" } else { "failed" }
            ),
        );
        Outcome::Ok(ctx)
    }
}

/// Publishes the release.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseStep;

#[async_trait]
impl<D: Send + Sync> Step<D> for ReleaseStep {
    async fn run(&self, mut ctx: PipelineContext, _deps: &D) -> StepOutcome {
        ctx.artifacts.pr_info = Some(json!({
            "branch": format!("release/{}", ctx.run_id),
            "status": "opened",
        }));
        ctx.add_note(StepName::Release, "Release completed");
        Outcome::Ok(ctx)
    }
}
