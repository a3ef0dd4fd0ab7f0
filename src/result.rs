//! The per-request [`RequestResult`] record and its derived latency fields.
//!
//! Every [`crate::adapters::Adapter`] produces exactly one of these per
//! attempted request. Timing fields are populated in-place by the adapter as
//! the request progresses, then [`RequestResult::finish`] freezes the record
//! and fills in the derived fields (§3 of the design doc).

use serde::{Deserialize, Serialize};

/// Wall-clock time, measured in fractional seconds since the Unix epoch.
///
/// We store plain `f64` seconds (rather than `std::time::Instant`) because
/// results are serialized to JSON and because `scheduled_start_time` needs to
/// be comparable across the single monotonic clock shared by the scheduler
/// and every virtual client.
pub type Timestamp = f64;

/// One attempted request against the backend, and everything we measured
/// about it.
///
/// Fields mirror the data model: `start_time ≤ ack_time ≤ first_token_time ≤
/// end_time` when all are set, and the five derived fields
/// (`response_time`, `tt_ack`, `ttft`, `itl`, `tpot`) are populated only when
/// `error_code` and `error_text` are both `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub user_id: usize,
    pub input_id: String,
    pub input_tokens: u32,

    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens_before_timeout: Option<u32>,

    #[serde(default)]
    pub start_time: Option<Timestamp>,
    #[serde(default)]
    pub ack_time: Option<Timestamp>,
    #[serde(default)]
    pub first_token_time: Option<Timestamp>,
    #[serde(default)]
    pub end_time: Option<Timestamp>,

    /// Only set in rate-limited (open-loop) mode: the timestamp the
    /// scheduler intended this request to start at.
    #[serde(default)]
    pub scheduled_start_time: Option<Timestamp>,

    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub error_code: Option<i32>,
    #[serde(default)]
    pub error_text: Option<String>,

    // Derived fields, in milliseconds. Populated by `finish`.
    #[serde(default)]
    pub response_time: Option<f64>,
    #[serde(default)]
    pub tt_ack: Option<f64>,
    #[serde(default)]
    pub ttft: Option<f64>,
    #[serde(default)]
    pub itl: Option<f64>,
    #[serde(default)]
    pub tpot: Option<f64>,
}

impl RequestResult {
    /// Start a new, empty result for `input_id`/`input_tokens`, as declared
    /// by the dataset.
    pub fn new(user_id: usize, input_id: String, input_tokens: u32) -> Self {
        Self {
            user_id,
            input_id,
            input_tokens,
            output_text: None,
            output_tokens: None,
            output_tokens_before_timeout: None,
            start_time: None,
            ack_time: None,
            first_token_time: None,
            end_time: None,
            scheduled_start_time: None,
            stop_reason: None,
            error_code: None,
            error_text: None,
            response_time: None,
            tt_ack: None,
            ttft: None,
            itl: None,
            tpot: None,
        }
    }

    /// Mark this result as failed. Derived latency fields are left unset.
    pub fn fail(&mut self, error_code: Option<i32>, error_text: impl Into<String>) {
        self.error_code = error_code;
        self.error_text = Some(error_text.into());
    }

    /// Is this result an error?
    pub fn is_error(&self) -> bool {
        self.error_code.is_some() || self.error_text.is_some()
    }

    /// Compute the derived fields (`response_time`, `tt_ack`, `ttft`, `itl`,
    /// `tpot`) from the raw timestamps and token counts.
    ///
    /// Only has an effect for error-free results with `start_time` and
    /// `end_time` set; no-op otherwise. Per the open question in the design
    /// doc, `itl` is omitted (left `None`) when `output_tokens <= 1`, rather
    /// than dividing by zero.
    pub fn finish(&mut self) {
        if self.is_error() {
            return;
        }
        let (Some(start), Some(end)) = (self.start_time, self.end_time) else {
            return;
        };

        self.response_time = Some(1000.0 * (end - start));

        if let Some(ack) = self.ack_time {
            self.tt_ack = Some(1000.0 * (ack - start));
        }

        if let Some(first_token) = self.first_token_time {
            self.ttft = Some(1000.0 * (first_token - start));
            if let Some(output_tokens) = self.output_tokens {
                if output_tokens > 1 {
                    self.itl = Some(1000.0 * (end - first_token) / (output_tokens - 1) as f64);
                }
            }
        }

        if let Some(output_tokens) = self.output_tokens {
            if output_tokens > 0 {
                if let Some(response_time) = self.response_time {
                    self.tpot = Some(response_time / output_tokens as f64);
                }
            }
        }
    }

    /// Did this request finish fully inside the test window? Used by the
    /// aggregator to restrict streaming-latency statistics to requests that
    /// were not truncated by the deadline.
    pub fn completed_within_window(&self) -> bool {
        matches!(
            (self.output_tokens, self.output_tokens_before_timeout),
            (Some(total), Some(before)) if total == before
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_computes_derived_fields() {
        let mut result = RequestResult::new(0, "q1".to_owned(), 10);
        result.start_time = Some(100.0);
        result.ack_time = Some(100.1);
        result.first_token_time = Some(100.2);
        result.end_time = Some(101.2);
        result.output_tokens = Some(5);
        result.output_tokens_before_timeout = Some(5);
        result.finish();

        assert_eq!(result.response_time, Some(1100.0));
        assert_eq!(result.tt_ack, Some(100.0));
        assert_eq!(result.ttft, Some(200.0));
        // itl = 1000 * (101.2 - 100.2) / (5 - 1) = 250.0
        assert_eq!(result.itl, Some(250.0));
        // tpot = response_time / output_tokens = 1100 / 5
        assert_eq!(result.tpot, Some(220.0));
        assert!(result.completed_within_window());
    }

    #[test]
    fn finish_omits_itl_for_single_token() {
        let mut result = RequestResult::new(0, "q1".to_owned(), 10);
        result.start_time = Some(0.0);
        result.first_token_time = Some(0.5);
        result.end_time = Some(0.5);
        result.output_tokens = Some(1);
        result.finish();

        assert!(result.itl.is_none());
        assert_eq!(result.tpot, Some(500.0));
    }

    #[test]
    fn finish_is_noop_on_error() {
        let mut result = RequestResult::new(0, "q1".to_owned(), 10);
        result.start_time = Some(0.0);
        result.end_time = Some(1.0);
        result.fail(Some(503), "connection refused");
        result.finish();

        assert!(result.response_time.is_none());
        assert!(result.is_error());
    }

    #[test]
    fn unary_result_has_no_streaming_fields() {
        let mut result = RequestResult::new(0, "q1".to_owned(), 10);
        result.start_time = Some(0.0);
        result.end_time = Some(1.0);
        result.output_tokens = Some(8);
        result.output_tokens_before_timeout = Some(8);
        result.finish();

        assert!(result.ttft.is_none());
        assert!(result.tt_ack.is_none());
        assert_eq!(result.tpot, Some(125.0));
    }
}
