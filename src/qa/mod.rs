//! Grounded answers: prompt assembly, generation with retries, citations.

pub mod completion;
pub mod prompt;
pub mod throttle;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::email::truncate_chars;
use crate::retriever::{RetrievalResult, RetrievedEmail};

pub use completion::{ChatCompletionClient, CompletionClient, CompletionError, CompletionRequest};
pub use prompt::{AssembledContext, assemble_context, estimate_tokens};
pub use throttle::Throttle;

/// Characters of email text shown with each citation
pub const EXCERPT_CHARS: usize = 200;

pub const REFUSAL_TEXT: &str =
    "No emails relevant to this question were found, so it cannot be answered from your inbox.";

/// What to do when retrieval finds nothing relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoContextPolicy {
    /// Answer with a fixed refusal without calling the completion service
    #[default]
    Refuse,
    /// Ask the completion service anyway and mark the answer as unsupported
    GeneralKnowledge,
}

impl fmt::Display for NoContextPolicy {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refuse => write!(f, "refuse"),
            Self::GeneralKnowledge => write!(f, "general_knowledge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub prompt_token_budget: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub min_request_interval: Duration,
    pub no_context_policy: NoContextPolicy,
}

impl From<&GenerationConfig> for SynthesisOptions {
    #[inline]
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            prompt_token_budget: config.prompt_token_budget,
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(config.max_retry_backoff_ms),
            request_timeout: Duration::from_secs(config.request_timeout_seconds.max(1)),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            no_context_policy: config.no_context_policy,
        }
    }
}

impl Default for SynthesisOptions {
    #[inline]
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

/// `Pending → ContextAssembled → Generating → {Answered, Failed}`. A refusal
/// goes straight from `ContextAssembled` to `Answered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnswerState {
    Pending,
    ContextAssembled,
    Generating,
    Answered,
    Failed,
}

impl AnswerState {
    #[inline]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::ContextAssembled | Self::Failed)
                | (
                    Self::ContextAssembled,
                    Self::Generating | Self::Answered | Self::Failed
                )
                | (Self::Generating, Self::Answered | Self::Failed)
        )
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Answered | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnswerSupport {
    /// Backed by the cited emails
    Grounded,
    /// Nothing relevant was retrieved; the answer cites nothing
    NoSupportingEmails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub score: f32,
    pub excerpt: String,
}

impl Citation {
    #[inline]
    pub fn from_hit(hit: &RetrievedEmail) -> Self {
        let mut excerpt = truncate_chars(&hit.normalized_text, EXCERPT_CHARS);
        if excerpt.len() < hit.normalized_text.len() {
            excerpt.push_str("...");
        }

        Self {
            id: hit.id.clone(),
            sender: hit.metadata.sender.clone(),
            subject: hit.metadata.subject.clone(),
            timestamp: hit.metadata.timestamp,
            score: hit.score,
            excerpt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// Exactly the emails whose text was in the prompt, in rank order
    pub citations: Vec<Citation>,
    pub support: AnswerSupport,
    pub history: Vec<AnswerState>,
}

impl Answer {
    #[inline]
    pub fn is_grounded(&self) -> bool {
        self.support == AnswerSupport::Grounded
    }

    #[inline]
    pub fn cited_ids(&self) -> Vec<&str> {
        self.citations.iter().map(|c| c.id.as_str()).collect()
    }
}

#[derive(Debug, Error)]
pub enum GenerationFailure {
    #[error(transparent)]
    Service(#[from] CompletionError),
    #[error("completion service returned an empty answer")]
    EmptyCompletion,
    #[error("generation was cancelled")]
    Cancelled,
}

/// The answer could not be generated. Carries the prompt that was built so the
/// failure can be diagnosed.
#[derive(Debug, Error)]
#[error("could not generate an answer after {attempts} attempt(s): {reason}")]
pub struct GenerationError {
    #[source]
    pub reason: GenerationFailure,
    pub attempts: u32,
    pub context: AssembledContext,
    pub history: Vec<AnswerState>,
}

impl GenerationError {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.reason, GenerationFailure::Cancelled)
    }
}

/// Turns retrieved emails and a question into an [`Answer`]. Cheap to share;
/// concurrent calls go through one throttle.
pub struct AnswerSynthesizer {
    client: Arc<dyn CompletionClient>,
    options: SynthesisOptions,
    throttle: Throttle,
}

impl AnswerSynthesizer {
    #[inline]
    pub fn new(client: Arc<dyn CompletionClient>, options: SynthesisOptions) -> Self {
        let throttle = Throttle::new(options.max_concurrent_requests, options.min_request_interval);
        Self {
            client,
            options,
            throttle,
        }
    }

    #[inline]
    pub fn options(&self) -> &SynthesisOptions {
        &self.options
    }

    /// Stop accepting new generations; calls waiting for a slot fail as cancelled.
    #[inline]
    pub fn shutdown(&self) {
        self.throttle.close();
    }

    #[inline]
    pub async fn answer(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
    ) -> Result<Answer, GenerationError> {
        self.answer_with_cancel(question, retrieval, &CancellationToken::new())
            .await
    }

    /// Like [`answer`](Self::answer), abandoning the request as soon as
    /// `cancel` fires.
    #[inline]
    pub async fn answer_with_cancel(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
        cancel: &CancellationToken,
    ) -> Result<Answer, GenerationError> {
        let request_id = Uuid::new_v4();
        self.run(question, retrieval, cancel)
            .instrument(info_span!("answer", %request_id))
            .await
    }

    async fn run(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
        cancel: &CancellationToken,
    ) -> Result<Answer, GenerationError> {
        let mut history = vec![AnswerState::Pending];

        let context = assemble_context(question, retrieval, self.options.prompt_token_budget);
        advance(&mut history, AnswerState::ContextAssembled);
        debug!(
            "Assembled context with {} emails (~{} tokens), {} dropped",
            context.included.len(),
            context.estimated_tokens,
            context.dropped_ids.len()
        );

        let (system, support) = if context.is_empty() {
            match self.options.no_context_policy {
                NoContextPolicy::Refuse => {
                    info!("No relevant emails; refusing without calling the completion service");
                    advance(&mut history, AnswerState::Answered);
                    return Ok(Answer {
                        text: REFUSAL_TEXT.to_string(),
                        citations: Vec::new(),
                        support: AnswerSupport::NoSupportingEmails,
                        history,
                    });
                }
                NoContextPolicy::GeneralKnowledge => (
                    prompt::GENERAL_KNOWLEDGE_SYSTEM_PROMPT,
                    AnswerSupport::NoSupportingEmails,
                ),
            }
        } else {
            (prompt::SYSTEM_PROMPT, AnswerSupport::Grounded)
        };

        let request = CompletionRequest {
            system: system.to_string(),
            prompt: context.prompt.clone(),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
        };

        advance(&mut history, AnswerState::Generating);
        match self.generate(&request, cancel).await {
            Ok(text) => {
                advance(&mut history, AnswerState::Answered);
                let citations = match support {
                    AnswerSupport::Grounded => context.included.iter().map(Citation::from_hit).collect(),
                    AnswerSupport::NoSupportingEmails => Vec::new(),
                };
                info!("Answered with {} citations", citations.len());
                Ok(Answer {
                    text,
                    citations,
                    support,
                    history,
                })
            }
            Err((reason, attempts)) => {
                advance(&mut history, AnswerState::Failed);
                warn!("Generation failed after {} attempts: {}", attempts, reason);
                Err(GenerationError {
                    reason,
                    attempts,
                    context,
                    history,
                })
            }
        }
    }

    /// Retry transient failures with capped exponential backoff. Returns the
    /// trimmed completion, or the failure with the number of attempts made.
    async fn generate(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, (GenerationFailure, u32)> {
        let max_attempts = self.options.retry_attempts.max(1);
        let mut attempt = 0;

        loop {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err((GenerationFailure::Cancelled, attempt)),
                permit = self.throttle.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err((GenerationFailure::Cancelled, attempt)),
                },
            };

            attempt += 1;
            debug!("Completion attempt {}/{}", attempt, max_attempts);

            // Detached: an abandoned attempt keeps its slot until the request
            // itself returns.
            let call = {
                let client = Arc::clone(&self.client);
                let request = request.clone();
                tokio::spawn(async move {
                    let outcome = client.complete(&request).await;
                    drop(permit);
                    outcome
                })
            };

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err((GenerationFailure::Cancelled, attempt)),
                outcome = tokio::time::timeout(self.options.request_timeout, call) => outcome,
            };

            let error = match outcome {
                Ok(Ok(Ok(text))) if text.trim().is_empty() => {
                    return Err((GenerationFailure::EmptyCompletion, attempt));
                }
                Ok(Ok(Ok(text))) => return Ok(text.trim().to_string()),
                Ok(Ok(Err(error))) => error,
                Ok(Err(e)) => CompletionError::Transport(format!("completion task failed: {e}")),
                Err(_) => CompletionError::Timeout,
            };

            if !error.is_transient() || attempt >= max_attempts {
                return Err((GenerationFailure::Service(error), attempt));
            }

            let delay = self.backoff(attempt);
            warn!(
                "Completion attempt {}/{} failed: {}; retrying in {:?}",
                attempt, max_attempts, error, delay
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err((GenerationFailure::Cancelled, attempt)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.options
            .retry_backoff
            .saturating_mul(factor)
            .min(self.options.max_retry_backoff)
    }
}

fn advance(history: &mut Vec<AnswerState>, next: AnswerState) {
    if let Some(&current) = history.last() {
        if !current.can_transition_to(next) {
            warn!("Unexpected answer transition {:?} -> {:?}", current, next);
        }
        debug!("Answer state {:?} -> {:?}", current, next);
    }
    history.push(next);
}
