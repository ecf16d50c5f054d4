//! Unified Processor (§4.5): the fallback orchestrator. Tries the primary
//! provider first, falls back to the secondary on exhausted retries or a
//! fatal error, and drives the continuation loop when a completion
//! sentinel is missing from a successful response.
//!
//! Grounded in §9's redesign note: "an explicit sum-type result on every
//! provider call... and an orchestrator that is a plain state machine over
//! (stage, provider, attempts)" — `run_stage` below is exactly that state
//! machine, generalized over extract and boost so both pipelines share it.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::rate_limit::RateBudget;

use super::backoff_with_jitter;

/// One provider's callable for a single stage (extract or boost).
/// `continuation_context` is `None` on the first call and
/// `Some(accumulated_text)` on each continuation retry — the implementor
/// builds whatever provider-specific prompt resumes from that point.
#[async_trait]
pub trait StageCall: Send + Sync {
    async fn call(&self, continuation_context: Option<&str>) -> Result<String, ProviderError>;
}

pub struct NamedStage {
    pub provider_name: String,
    pub call: Box<dyn StageCall>,
}

/// Budgets governing retries within a stage (§6 Pipeline configuration).
#[derive(Debug, Clone, Copy)]
pub struct StageBudgets {
    pub attempt_budget: u32,
    pub continuation_budget: u32,
}

/// Outcome of running one stage across the provider fallback chain.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub text: String,
    pub provider: String,
    /// Whether the completion sentinel was ever observed (§4.5 step 3).
    pub complete: bool,
}

/// Drive one stage (extract or boost) through provider-order fallback with
/// per-provider retry and a continuation loop (§4.5 steps 1-3).
///
/// Every real provider call — the initial attempt and every continuation —
/// is gated on `rate_budget.admit_blocking` keyed by the stage's own
/// provider name (§4.1): this is the one place every extract/boost/
/// continuation call in the system funnels through, so it is the one place
/// the Rate Budget actually needs to be consulted.
pub async fn run_stage(
    providers: &[NamedStage],
    sentinel: &str,
    budgets: StageBudgets,
    rate_budget: &RateBudget,
    estimated_tokens: u32,
) -> Result<StageOutcome, String> {
    let mut last_error = String::from("no providers configured");

    for stage in providers {
        let mut attempt = 0;
        loop {
            if let Err(e) = rate_budget.admit_blocking(&stage.provider_name, estimated_tokens).await {
                last_error = e.to_string();
                break;
            }

            match stage.call.call(None).await {
                Ok(text) => {
                    let (final_text, complete) =
                        run_continuations(stage, text, sentinel, budgets.continuation_budget, rate_budget, estimated_tokens).await;
                    return Ok(StageOutcome { text: final_text, provider: stage.provider_name.clone(), complete });
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    last_error = e.to_string();
                    if attempt >= budgets.attempt_budget {
                        break;
                    }
                    tokio::time::sleep(backoff_with_jitter(attempt, 500)).await;
                }
                Err(e) => {
                    // BadRequest (fatal for this provider): move to the next one.
                    last_error = e.to_string();
                    break;
                }
            }
        }
    }

    Err(format!("both providers failed: {last_error}"))
}

/// §4.5 step 3: issue up to `continuation_budget` continuation calls to the
/// *same* provider, concatenating accumulated text until the sentinel is
/// observed or the budget is spent. Each continuation is itself a real
/// provider call and is admitted the same as the first attempt.
async fn run_continuations(
    stage: &NamedStage,
    first: String,
    sentinel: &str,
    continuation_budget: u32,
    rate_budget: &RateBudget,
    estimated_tokens: u32,
) -> (String, bool) {
    let mut accumulated = first;
    if contains_sentinel(&accumulated, sentinel) {
        return (accumulated, true);
    }

    for _ in 0..continuation_budget {
        if rate_budget.admit_blocking(&stage.provider_name, estimated_tokens).await.is_err() {
            break;
        }

        match stage.call.call(Some(&accumulated)).await {
            Ok(more) => {
                accumulated.push_str(&more);
                if contains_sentinel(&accumulated, sentinel) {
                    return (accumulated, true);
                }
            }
            Err(_) => break,
        }
    }

    (accumulated, false)
}

/// §6: sentinels are matched as a literal substring, tolerant of a leading
/// decorative check-mark character on the sentinel's line.
fn contains_sentinel(text: &str, sentinel: &str) -> bool {
    text.lines().any(|line| {
        let trimmed = line.trim_start_matches(|c: char| !c.is_alphanumeric() && c != ':');
        trimmed.contains(sentinel) || line.contains(sentinel)
    })
}

/// §4.5 `run_extract_then_boost` result.
#[derive(Debug, Clone)]
pub struct ExtractBoostResult {
    pub raw_text: String,
    pub boosted_text: String,
    pub raw_provider: String,
    pub boost_provider: String,
    pub extraction_complete: bool,
    pub boost_complete: bool,
}

pub const EXTRACTION_SENTINEL: &str = "EXTRACTION_COMPLETE:";
pub const BOOST_SENTINEL: &str = "BOOST_COMPLETE:";

/// Run the extract stage then the boost stage, independently choosing a
/// provider for each (§4.5 "Tie-breaks": both stages are independent, both
/// provider choices are reported).
pub async fn run_extract_then_boost(
    extract_providers: &[NamedStage],
    boost_providers: &[NamedStage],
    budgets: StageBudgets,
    rate_budget: &RateBudget,
    estimated_tokens: u32,
) -> Result<ExtractBoostResult, String> {
    let extract_outcome = run_stage(extract_providers, EXTRACTION_SENTINEL, budgets, rate_budget, estimated_tokens).await?;
    let boost_outcome = run_stage(boost_providers, BOOST_SENTINEL, budgets, rate_budget, estimated_tokens).await?;

    Ok(ExtractBoostResult {
        raw_text: extract_outcome.text,
        boosted_text: boost_outcome.text,
        raw_provider: extract_outcome.provider,
        boost_provider: boost_outcome.provider,
        extraction_complete: extract_outcome.complete,
        boost_complete: boost_outcome.complete,
    })
}
