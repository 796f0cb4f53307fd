//! Generation session: the decode state machine
//!
//! A [`Session`] owns one generation request end to end: the KV-cache, the
//! workspace pool, the seeded RNG, the stop-condition state, and the
//! position counter. It advances one token at a time ([`Session::next_token`])
//! or to completion ([`Session::generate`]).
//!
//! Mid-generation conditions are terminal [`FinishReason`]s, never errors:
//! a streaming caller distinguishes a normal stop from a failure without
//! exception handling. Cancellation is cooperative and the wall-clock budget
//! is checked once per decode step, never mid-kernel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{sample_token, GenerateOptions};
use crate::cache::KvCache;
use crate::error::{InferirError, Result};
use crate::kernels::{simd_tier, SimdTier};
use crate::model::Model;
use crate::pool::BufferPool;
use crate::quantize::QuantFormat;

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Hit the configured token cap
    MaxTokens,
    /// Sampled a configured stop token id
    StopToken,
    /// Emitted text matched a configured stop sequence
    StopSequence,
    /// Wall-clock budget ran out
    Timeout,
    /// Caller flagged the cancellation handle
    Cancelled,
}

/// Decode state machine: `Running → {Running, Finished(reason)}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// More tokens may follow
    Running,
    /// Terminal; no further tokens
    Finished(FinishReason),
}

// ============================================================================
// Stop-sequence matching
// ============================================================================

/// Rolling-buffer matcher for text stop sequences
///
/// Keeps at most twice the longest configured pattern, so each pushed chunk
/// costs O(pattern length) regardless of how much text has been generated.
#[derive(Debug, Clone)]
pub struct StopMatcher {
    patterns: Vec<String>,
    buffer: String,
    max_buffer: usize,
}

impl StopMatcher {
    /// Build a matcher over the configured patterns (may be empty)
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        let longest = patterns.iter().map(String::len).max().unwrap_or(0);
        Self {
            patterns: patterns.to_vec(),
            buffer: String::new(),
            max_buffer: longest * 2,
        }
    }

    /// Feed a chunk of emitted text; returns the matched pattern if the
    /// buffer now ends with one
    pub fn push(&mut self, text: &str) -> Option<&str> {
        if self.patterns.is_empty() {
            return None;
        }
        self.buffer.push_str(text);
        while self.buffer.len() > self.max_buffer {
            let next = self
                .buffer
                .char_indices()
                .nth(1)
                .map_or(self.buffer.len(), |(i, _)| i);
            self.buffer.drain(..next);
        }
        self.patterns
            .iter()
            .find(|p| self.buffer.ends_with(p.as_str()))
            .map(String::as_str)
    }
}

// ============================================================================
// Token text
// ============================================================================

/// Maps token ids to text
///
/// Tokenization lives outside this crate; the session only needs the
/// id-to-text direction, for stop-sequence matching and emitted output.
pub trait TokenDecoder {
    /// Text for one token id
    fn decode(&self, token: u32) -> String;
}

// ============================================================================
// Session
// ============================================================================

/// One emitted token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Sampled token id
    pub token: u32,
    /// Decoded text, empty when no decoder is attached
    pub text: String,
    /// Set when this token completed the generation
    pub finish: Option<FinishReason>,
}

/// A completed generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResult {
    /// Every sampled token, in order
    pub tokens: Vec<u32>,
    /// Concatenated decoded text, stop sequence trimmed when configured
    pub text: String,
    /// Why generation stopped
    pub finish: FinishReason,
}

/// Introspection surface for callers negotiating what a session can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum context length of the underlying model
    pub max_context: usize,
    /// Quantization schemes this build can decode
    pub supported_formats: Vec<QuantFormat>,
    /// Whether incremental decoding uses a KV-cache (always true here)
    pub cache_enabled: bool,
    /// SIMD tier the kernels dispatched to
    pub simd_tier: SimdTier,
}

/// A generation request in flight
///
/// Owns its KV-cache and workspace pool; sessions never share state, so
/// several can run on independent threads against one model.
#[derive(Debug)]
pub struct Session<'a> {
    model: &'a Model,
    opts: GenerateOptions,
    cache: KvCache,
    pool: BufferPool,
    state: DecodeState,
    pos: usize,
    recent_tokens: Vec<u32>,
    generated: usize,
    stop_matcher: StopMatcher,
    rng: StdRng,
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
    pending_logits: Option<Vec<f32>>,
    next_input: Option<u32>,
}

impl<'a> Session<'a> {
    /// Validate options and allocate per-session state
    ///
    /// All construction-time failures surface here, before any token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for rejected options or a cache
    /// geometry the model cannot satisfy.
    pub fn new(model: &'a Model, opts: GenerateOptions) -> Result<Self> {
        opts.validate()?;

        let capacity = if opts.cache_capacity == 0 {
            model.config().max_context
        } else {
            opts.cache_capacity
        };
        let cache = KvCache::new(model.config().kv_cache_config(capacity))?;

        let deadline = opts.time_budget.map(|budget| Instant::now() + budget);
        let stop_matcher = StopMatcher::new(&opts.stop_sequences);
        let rng = StdRng::seed_from_u64(opts.seed);

        Ok(Self {
            model,
            opts,
            cache,
            pool: BufferPool::new(),
            state: DecodeState::Running,
            pos: 0,
            recent_tokens: Vec::new(),
            generated: 0,
            stop_matcher,
            rng,
            deadline,
            cancel: Arc::new(AtomicBool::new(false)),
            pending_logits: None,
            next_input: None,
        })
    }

    /// Handle for cooperative cancellation; checked once per decode step
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Current state of the decode state machine
    #[must_use]
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Terminal reason, once finished
    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.state {
            DecodeState::Running => None,
            DecodeState::Finished(reason) => Some(reason),
        }
    }

    /// What this session can do
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_context: self.model.config().max_context,
            supported_formats: vec![
                QuantFormat::Q4_0,
                QuantFormat::Q5_0,
                QuantFormat::Q5_1,
                QuantFormat::Q8_0,
                QuantFormat::Q4_K,
                QuantFormat::Q6_K,
            ],
            cache_enabled: true,
            simd_tier: simd_tier(),
        }
    }

    /// Feed the prompt, priming the cache and the first step's logits
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an empty prompt, plus any forward
    /// pass error (`ContextLimitExceeded`, `CapacityExceeded`).
    pub fn prefill(&mut self, prompt: &[u32]) -> Result<()> {
        if prompt.is_empty() {
            return Err(InferirError::InvalidConfiguration {
                reason: "prompt must be non-empty".to_string(),
            });
        }
        for &token in prompt {
            let logits = self
                .model
                .forward_step(token, self.pos, &mut self.cache, &self.pool)?;
            self.pos += 1;
            self.recent_tokens.push(token);
            self.pending_logits = Some(logits);
        }
        Ok(())
    }

    fn finish(&mut self, reason: FinishReason) {
        self.state = DecodeState::Finished(reason);
        // Pending logits are scratch; drop them eagerly
        self.pending_logits = None;
    }

    /// Advance one decode step
    ///
    /// Returns `Ok(None)` once the session is finished (query
    /// [`finish_reason`](Self::finish_reason) for why). Cancellation and the
    /// time budget are each checked exactly once, before the forward pass.
    ///
    /// # Errors
    ///
    /// Returns forward-pass errors (`CapacityExceeded`,
    /// `ContextLimitExceeded`); these leave the session finished with no
    /// token emitted. Calling before [`prefill`](Self::prefill) is
    /// `InvalidConfiguration`.
    pub fn next_token(
        &mut self,
        decoder: Option<&dyn TokenDecoder>,
    ) -> Result<Option<StepOutput>> {
        if matches!(self.state, DecodeState::Finished(_)) {
            return Ok(None);
        }
        if self.cancel.load(Ordering::Relaxed) {
            self.finish(FinishReason::Cancelled);
            return Ok(None);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.finish(FinishReason::Timeout);
                return Ok(None);
            }
        }

        let mut logits = match self.pending_logits.take() {
            Some(logits) => logits,
            None => {
                let Some(input) = self.next_input else {
                    return Err(InferirError::InvalidConfiguration {
                        reason: "next_token called before prefill".to_string(),
                    });
                };
                // Recoverable: the session stays usable after the caller
                // truncates or resizes, so the input token is kept
                let logits = self
                    .model
                    .forward_step(input, self.pos, &mut self.cache, &self.pool)?;
                self.next_input = None;
                self.pos += 1;
                logits
            }
        };

        let token = sample_token(&mut logits, &self.recent_tokens, &self.opts, &mut self.rng);
        self.generated += 1;
        self.recent_tokens.push(token);

        let text = decoder.map(|d| d.decode(token)).unwrap_or_default();

        let mut finish = None;
        if self.opts.stop_tokens.contains(&token) {
            finish = Some(FinishReason::StopToken);
        } else if self.stop_matcher.push(&text).is_some() {
            finish = Some(FinishReason::StopSequence);
        } else if self.generated >= self.opts.max_tokens {
            finish = Some(FinishReason::MaxTokens);
        }

        if let Some(reason) = finish {
            self.finish(reason);
        } else {
            self.next_input = Some(token);
        }

        Ok(Some(StepOutput {
            token,
            text,
            finish,
        }))
    }

    /// Run the request to completion
    ///
    /// When a stop sequence fired and trimming is enabled, the matched
    /// suffix is removed from the returned text (streamed chunks via
    /// [`next_token`](Self::next_token) cannot be retroactively trimmed).
    ///
    /// # Errors
    ///
    /// Propagates [`prefill`](Self::prefill) and
    /// [`next_token`](Self::next_token) errors.
    pub fn generate(
        &mut self,
        prompt: &[u32],
        decoder: Option<&dyn TokenDecoder>,
    ) -> Result<GenerateResult> {
        self.prefill(prompt)?;

        let mut tokens = Vec::new();
        let mut text = String::new();
        while let Some(step) = self.next_token(decoder)? {
            tokens.push(step.token);
            text.push_str(&step.text);
        }

        let finish = self
            .finish_reason()
            .unwrap_or(FinishReason::MaxTokens);

        if finish == FinishReason::StopSequence && self.opts.trim_stop_sequence {
            if let Some(pattern) = self
                .opts
                .stop_sequences
                .iter()
                .find(|p| text.ends_with(p.as_str()))
            {
                text.truncate(text.len() - pattern.len());
            }
        }

        Ok(GenerateResult {
            tokens,
            text,
            finish,
        })
    }
}
