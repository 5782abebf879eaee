//! `StreamCostTracker`: converts stream observations into a billable cost.
//! A pure computation over a handful of accumulated inputs, with no storage
//! of its own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use gateway_core::constants::{DEFAULT_BYTES_PER_TOKEN, OVERCOUNT_MARGIN_PERCENT};
use gateway_core::types::Micros;

use crate::consumer::StreamEvent;

/// Rounding mode for a pricing entry's cost computation. The distilled spec
/// only pins down ceiling rounding (for the overcount margin); the other two
/// make the pricing table a real, loadable artifact rather than a single
/// hard-coded constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    NearestEven,
    Ceiling,
    Floor,
}

impl Default for Rounding {
    fn default() -> Self {
        Rounding::NearestEven
    }
}

/// One model's pricing entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PricingEntry {
    pub in_rate_micros_per_token: Micros,
    pub out_rate_micros_per_token: Micros,
    #[serde(default = "default_bytes_per_token")]
    pub bytes_per_token: u64,
    #[serde(default)]
    pub rounding: Rounding,
}

fn default_bytes_per_token() -> u64 {
    DEFAULT_BYTES_PER_TOKEN
}

/// Keyed by model id. Loaded once at boot from the node binary's config.
pub type PricingTable = HashMap<String, PricingEntry>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingMethod {
    ProviderReported,
    ByteEstimated,
    PromptOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostResult {
    pub method: BillingMethod,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_micros: Micros,
    pub was_aborted: bool,
}

/// Observes one stream's `StreamEvent`s and tracks enough state to price it
/// under any of the three billing methods at any moment. Scoped to exactly
/// one in-flight request's adapter subprocess.
pub struct StreamCostTracker {
    pricing: PricingEntry,
    prompt_tokens: u64,
    chunk_bytes: u64,
    saw_done: bool,
    saw_error: bool,
    reported_usage: Option<(u64, u64)>, // (prompt_tokens, completion_tokens) from a `usage` event
}

impl StreamCostTracker {
    pub fn new(pricing: PricingEntry, prompt_tokens: u64) -> Self {
        Self {
            pricing,
            prompt_tokens,
            chunk_bytes: 0,
            saw_done: false,
            saw_error: false,
            reported_usage: None,
        }
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Chunk { delta } => self.chunk_bytes += delta.len() as u64,
            StreamEvent::ToolCall { fragment } => self.chunk_bytes += fragment.len() as u64,
            StreamEvent::Usage {
                prompt_tokens,
                completion_tokens,
                ..
            } => self.reported_usage = Some((*prompt_tokens, *completion_tokens)),
            StreamEvent::Done { .. } => self.saw_done = true,
            StreamEvent::Error { .. } => self.saw_error = true,
        }
    }

    /// True iff the stream ended without completing normally: by error, by
    /// external abort signal (the caller sets `aborted` explicitly — the
    /// tracker itself never sees an abort as a `StreamEvent`), or by running
    /// out of input without a `done` event.
    pub fn was_aborted(&self, externally_aborted: bool) -> bool {
        externally_aborted || self.saw_error || !self.saw_done
    }

    fn byte_estimated_completion_tokens(&self) -> u64 {
        let bytes_per_token = self.pricing.bytes_per_token.max(1);
        round_div(self.chunk_bytes, bytes_per_token, self.pricing.rounding)
    }

    // Token counts multiply exactly into rates with no division involved, so
    // `self.pricing.rounding` has nothing to apply to here — it only governs
    // the byte-to-token estimate above.
    fn cost_micros(&self, prompt_tokens: u64, completion_tokens: u64) -> Micros {
        Micros::from(prompt_tokens) * self.pricing.in_rate_micros_per_token
            + Micros::from(completion_tokens) * self.pricing.out_rate_micros_per_token
    }

    fn primary_fields(&self) -> (BillingMethod, u64, u64) {
        if let Some((prompt, completion)) = self.reported_usage {
            (BillingMethod::ProviderReported, prompt, completion)
        } else if self.chunk_bytes > 0 {
            (BillingMethod::ByteEstimated, self.prompt_tokens, self.byte_estimated_completion_tokens())
        } else {
            (BillingMethod::PromptOnly, self.prompt_tokens, 0)
        }
    }

    /// The primary billing result, per the method precedence.
    pub fn result(&self, externally_aborted: bool) -> CostResult {
        let (method, prompt_tokens, completion_tokens) = self.primary_fields();
        CostResult {
            method,
            prompt_tokens,
            completion_tokens,
            cost_micros: self.cost_micros(prompt_tokens, completion_tokens),
            was_aborted: self.was_aborted(externally_aborted),
        }
    }

    /// Same as `result`, but in the `byte_estimated` case inflates
    /// completion tokens by `OVERCOUNT_MARGIN_PERCENT`, ceiling-rounded —
    /// used for ensemble "loser" billing.
    pub fn overcount_result(&self, externally_aborted: bool) -> CostResult {
        let (method, prompt_tokens, completion_tokens) = self.primary_fields();
        let completion_tokens = if method == BillingMethod::ByteEstimated {
            overcount(completion_tokens)
        } else {
            completion_tokens
        };
        CostResult {
            method,
            prompt_tokens,
            completion_tokens,
            cost_micros: self.cost_micros(prompt_tokens, completion_tokens),
            was_aborted: self.was_aborted(externally_aborted),
        }
    }
}

fn overcount(completion_tokens: u64) -> u64 {
    let inflated = completion_tokens as u128 * (100 + OVERCOUNT_MARGIN_PERCENT as u128);
    (inflated.div_ceil(100)) as u64
}

/// `numerator / denominator`, rounded per `rounding`. `denominator` is
/// clamped to at least 1 by the caller.
fn round_div(numerator: u64, denominator: u64, rounding: Rounding) -> u64 {
    match rounding {
        Rounding::Ceiling => numerator.div_ceil(denominator),
        Rounding::Floor => numerator / denominator,
        Rounding::NearestEven => {
            let quotient = numerator / denominator;
            let remainder = numerator % denominator;
            match (remainder * 2).cmp(&denominator) {
                std::cmp::Ordering::Less => quotient,
                std::cmp::Ordering::Greater => quotient + 1,
                std::cmp::Ordering::Equal if quotient % 2 == 0 => quotient,
                std::cmp::Ordering::Equal => quotient + 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> PricingEntry {
        PricingEntry {
            in_rate_micros_per_token: 10,
            out_rate_micros_per_token: 20,
            bytes_per_token: 4,
            rounding: Rounding::Ceiling,
        }
    }

    #[test]
    fn pricing_entry_rounding_defaults_to_nearest_even_when_absent() {
        let json = r#"{"in_rate_micros_per_token":1,"out_rate_micros_per_token":2}"#;
        let entry: PricingEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.rounding, Rounding::NearestEven);
        assert_eq!(entry.bytes_per_token, DEFAULT_BYTES_PER_TOKEN);
    }

    #[test]
    fn provider_reported_usage_wins_over_byte_estimate() {
        let mut tracker = StreamCostTracker::new(pricing(), 100);
        tracker.observe(&StreamEvent::Chunk { delta: "abcd".into() });
        tracker.observe(&StreamEvent::Usage {
            prompt_tokens: 100,
            completion_tokens: 42,
            reasoning_tokens: 0,
        });
        tracker.observe(&StreamEvent::Done { finish_reason: "stop".into() });
        let result = tracker.result(false);
        assert_eq!(result.method, BillingMethod::ProviderReported);
        assert_eq!(result.completion_tokens, 42);
        assert!(!result.was_aborted);
    }

    #[test]
    fn byte_estimated_when_no_usage_event_arrives() {
        let mut tracker = StreamCostTracker::new(pricing(), 10);
        tracker.observe(&StreamEvent::Chunk { delta: "12345678".into() }); // 8 bytes / 4 = 2 tokens
        tracker.observe(&StreamEvent::Done { finish_reason: "stop".into() });
        let result = tracker.result(false);
        assert_eq!(result.method, BillingMethod::ByteEstimated);
        assert_eq!(result.completion_tokens, 2);
    }

    #[test]
    fn prompt_only_when_no_chunks_observed() {
        let tracker = StreamCostTracker::new(pricing(), 10);
        let result = tracker.result(false);
        assert_eq!(result.method, BillingMethod::PromptOnly);
        assert_eq!(result.completion_tokens, 0);
        assert_eq!(result.cost_micros, 100); // 10 prompt tokens * 10 micros/token
    }

    #[test]
    fn missing_done_event_marks_aborted() {
        let mut tracker = StreamCostTracker::new(pricing(), 10);
        tracker.observe(&StreamEvent::Chunk { delta: "ab".into() });
        let result = tracker.result(false);
        assert!(result.was_aborted);
    }

    #[test]
    fn overcount_inflates_byte_estimated_completion_by_ten_percent_ceiling() {
        let mut tracker = StreamCostTracker::new(pricing(), 10);
        tracker.observe(&StreamEvent::Chunk { delta: "x".repeat(40).into() }); // 40/4 = 10 tokens
        let overcounted = tracker.overcount_result(false);
        assert_eq!(overcounted.completion_tokens, 11); // ceil(10 * 1.1)
    }

    #[test]
    fn byte_estimate_floor_rounds_down_instead_of_up() {
        let mut pricing = pricing();
        pricing.rounding = Rounding::Floor;
        let mut tracker = StreamCostTracker::new(pricing, 10);
        tracker.observe(&StreamEvent::Chunk { delta: "123456789".into() }); // 9 bytes / 4 = 2.25
        let result = tracker.result(false);
        assert_eq!(result.completion_tokens, 2);
    }

    #[test]
    fn byte_estimate_nearest_even_rounds_half_to_the_even_quotient() {
        let mut pricing = pricing();
        pricing.bytes_per_token = 2;
        pricing.rounding = Rounding::NearestEven;
        let mut tracker = StreamCostTracker::new(pricing.clone(), 10);
        tracker.observe(&StreamEvent::Chunk { delta: "12345".into() }); // 5/2 = 2.5 -> 2 (even)
        assert_eq!(tracker.result(false).completion_tokens, 2);

        let mut tracker = StreamCostTracker::new(pricing, 10);
        tracker.observe(&StreamEvent::Chunk { delta: "123".into() }); // 3/2 = 1.5 -> 2 (even)
        assert_eq!(tracker.result(false).completion_tokens, 2);
    }

    #[test]
    fn overcount_does_not_affect_provider_reported_method() {
        let mut tracker = StreamCostTracker::new(pricing(), 10);
        tracker.observe(&StreamEvent::Usage {
            prompt_tokens: 10,
            completion_tokens: 50,
            reasoning_tokens: 0,
        });
        let overcounted = tracker.overcount_result(false);
        assert_eq!(overcounted.completion_tokens, 50);
    }
}
