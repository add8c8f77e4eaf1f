//! Rewriting many messages in parallel
//!
//! A [`RewritePlan`] is built once; its patterns and substitutions are
//! shared read-only between workers. Each message gets its own
//! [`SipMessage`] and edit list, nothing else crosses threads.

use crate::error::{TextopsError, TextopsResult};
use crate::limits::RewriteLimits;
use crate::msg::SipMessage;
use crate::pattern::Pattern;
use crate::subst::SubstExpr;
use crate::types::{HeaderMatcher, HfSelect, Outcome, ReplaceMode};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// One rewriter invocation
#[derive(Debug, Clone)]
pub enum RewriteStep {
    Subst(Arc<SubstExpr>),
    SubstBody(Arc<SubstExpr>),
    SubstUri(Arc<SubstExpr>),
    SubstUser(Arc<SubstExpr>),
    SubstHf { header: HeaderMatcher, expr: Arc<SubstExpr>, select: HfSelect },
    Replace { pattern: Arc<Pattern>, value: Arc<[u8]> },
    ReplaceAll { pattern: Arc<Pattern>, value: Arc<[u8]> },
    ReplaceBodyAll { pattern: Arc<Pattern>, value: Arc<[u8]> },
    ReplaceBodyAtonce { pattern: Arc<Pattern>, value: Arc<[u8]> },
    ReplaceStr { key: Arc<[u8]>, value: Arc<[u8]>, mode: ReplaceMode },
    RemoveHf(HeaderMatcher),
    RemoveHfIdx(HeaderMatcher, isize),
    RemoveHfRe(Arc<Pattern>),
    AppendHf { text: Arc<[u8]>, after: Option<HeaderMatcher> },
    InsertHf { text: Arc<[u8]>, before: Option<HeaderMatcher> },
    SetBody { body: Arc<[u8]>, content_type: String },
    /// Build and reparse so later steps see earlier edits
    Commit,
}

impl RewriteStep {
    fn run(&self, msg: &mut SipMessage) -> TextopsResult<Outcome> {
        match self {
            RewriteStep::Subst(se) => msg.subst(se),
            RewriteStep::SubstBody(se) => msg.subst_body(se),
            RewriteStep::SubstUri(se) => msg.subst_uri(se),
            RewriteStep::SubstUser(se) => msg.subst_user(se),
            RewriteStep::SubstHf { header, expr, select } => msg.subst_hf(header, expr, *select),
            RewriteStep::Replace { pattern, value } => msg.replace(pattern, &value[..]),
            RewriteStep::ReplaceAll { pattern, value } => msg.replace_all(pattern, &value[..]),
            RewriteStep::ReplaceBodyAll { pattern, value } => msg.replace_body_all(pattern, &value[..]),
            RewriteStep::ReplaceBodyAtonce { pattern, value } => msg.replace_body_atonce(pattern, &value[..]),
            RewriteStep::ReplaceStr { key, value, mode } => msg.replace_str(&key[..], &value[..], *mode),
            RewriteStep::RemoveHf(header) => msg.remove_hf(header),
            RewriteStep::RemoveHfIdx(header, index) => msg.remove_hf_idx(header, *index),
            RewriteStep::RemoveHfRe(re) => msg.remove_hf_re(re),
            RewriteStep::AppendHf { text, after } => msg.append_hf(&text[..], after.as_ref()),
            RewriteStep::InsertHf { text, before } => msg.insert_hf(&text[..], before.as_ref()),
            RewriteStep::SetBody { body, content_type } => msg.set_body(&body[..], content_type),
            RewriteStep::Commit => Ok(Outcome::Applied(1)),
        }
    }
}

/// Ordered rewrite steps plus the limits each message is parsed with
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    steps: Vec<RewriteStep>,
    limits: RewriteLimits,
}

/// Result of running a plan on one message
#[derive(Debug)]
pub struct PlanReport {
    pub output: Vec<u8>,
    pub outcomes: Vec<Outcome>,
}

impl RewritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: RewriteLimits) -> Self {
        RewritePlan { steps: Vec::new(), limits }
    }

    pub fn step(mut self, step: RewriteStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: RewriteStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[RewriteStep] {
        &self.steps
    }

    pub fn limits(&self) -> &RewriteLimits {
        &self.limits
    }

    /// Run every step on `msg`, returning the message (reparsed after each
    /// `Commit`) and one outcome per step. The first error stops the plan.
    pub fn apply(&self, mut msg: SipMessage) -> TextopsResult<(SipMessage, Vec<Outcome>)> {
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if let RewriteStep::Commit = step {
                msg = msg.apply_edits()?;
            }
            outcomes.push(step.run(&mut msg)?);
        }
        Ok((msg, outcomes))
    }

    /// Parse `raw`, apply the plan and build the output bytes
    pub fn run(&self, raw: &[u8]) -> TextopsResult<PlanReport> {
        let msg = SipMessage::with_limits(raw, self.limits.clone())?;
        let (msg, outcomes) = self.apply(msg)?;
        Ok(PlanReport { output: msg.build()?, outcomes })
    }
}

/// Run `plan` on every message using the global rayon pool. Results keep
/// the input order.
pub fn process_batch<M>(plan: &RewritePlan, messages: &[M]) -> Vec<TextopsResult<PlanReport>>
where
    M: AsRef<[u8]> + Sync,
{
    debug!(messages = messages.len(), steps = plan.steps().len(), "processing batch");
    let results: Vec<TextopsResult<PlanReport>> =
        messages.par_iter().map(|raw| plan.run(raw.as_ref())).collect();
    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!(failed, total = results.len(), "some messages could not be rewritten");
    }
    results
}

/// Like [`process_batch`] on a dedicated pool of `threads` workers;
/// 0 means one per CPU core
pub fn process_batch_on<M>(threads: usize, plan: &RewritePlan, messages: &[M]) -> TextopsResult<Vec<TextopsResult<PlanReport>>>
where
    M: AsRef<[u8]> + Sync,
{
    let threads = if threads == 0 { num_cpus::get() } else { threads };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("textops-{}", i))
        .build()
        .map_err(|err| TextopsError::state_error("process_batch_on", err.to_string(), Some(format!("{} threads", threads))))?;
    debug!(threads, "built rewrite pool");
    Ok(pool.install(|| process_batch(plan, messages)))
}
