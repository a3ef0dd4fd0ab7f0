//! Aggregator: collects per-client result batches and computes the
//! [`Summary`] report (§4.5).

use std::collections::BTreeMap;

use crate::{prelude::*, result::RequestResult};

/// The eight-statistic summary for one metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub mean: f64,
    pub p80: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl MetricStats {
    /// Compute stats over `values`. Returns `None` if `values` is empty.
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("NaN in latency sample"));

        let percentile = |p: f64| -> f64 {
            let rank = (p * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };

        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;

        Some(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            median: percentile(0.5),
            mean,
            p80: percentile(0.80),
            p90: percentile(0.90),
            p95: percentile(0.95),
            p99: percentile(0.99),
        })
    }
}

/// Final report for one run (or one sweep point): per-metric statistics plus
/// run-level scalars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    #[serde(flatten)]
    pub metrics: BTreeMap<String, MetricStats>,

    pub throughput: f64,
    pub throughput_full_duration: f64,
    pub full_duration: f64,
    pub total_requests: usize,
    pub req_completed_within_test_duration: usize,
    pub total_failures: usize,
    pub failure_rate: f64,
}

/// Names of the metrics named in §3, each computed once over the
/// appropriate subset of results.
const METRIC_NAMES: &[&str] = &[
    "tpot",
    "ttft",
    "itl",
    "tt_ack",
    "response_time",
    "output_tokens",
    "output_tokens_before_timeout",
    "input_tokens",
];

/// Streaming-dependent metrics: computed only over results that finished
/// fully within the test window, so truncated streams don't skew per-token
/// timing (§4.5).
const STREAMING_RESTRICTED_METRICS: &[&str] = &["ttft", "itl", "tt_ack", "tpot"];

fn metric_values(results: &[&RequestResult], name: &str) -> Vec<f64> {
    let restricted = STREAMING_RESTRICTED_METRICS.contains(&name);
    results
        .iter()
        .filter(|r| !restricted || r.completed_within_window())
        .filter_map(|r| match name {
            "tpot" => r.tpot,
            "ttft" => r.ttft,
            "itl" => r.itl,
            "tt_ack" => r.tt_ack,
            "response_time" => r.response_time,
            "output_tokens" => r.output_tokens.map(f64::from),
            "output_tokens_before_timeout" => r.output_tokens_before_timeout.map(f64::from),
            "input_tokens" => Some(f64::from(r.input_tokens)),
            _ => unreachable!("unknown metric name {name}"),
        })
        .collect()
}

/// Compute the [`Summary`] for one run: `results` is the concatenation of
/// every virtual client's batch, in no particular order.
///
/// `configured_duration` is the target test-duration window (the "target"
/// clock of the design notes), used to normalize `throughput`.
pub fn summarize(results: &[RequestResult], configured_duration: f64) -> Summary {
    let total_requests = results.len();
    let total_failures = results.iter().filter(|r| r.is_error()).count();
    let failure_rate = if total_requests > 0 {
        100.0 * total_failures as f64 / total_requests as f64
    } else {
        0.0
    };

    let ok_results: Vec<&RequestResult> =
        results.iter().filter(|r| !r.is_error()).collect();

    let full_duration = {
        let start = ok_results.iter().filter_map(|r| r.start_time).fold(
            f64::INFINITY,
            f64::min,
        );
        let end = ok_results
            .iter()
            .filter_map(|r| r.end_time)
            .fold(f64::NEG_INFINITY, f64::max);
        if end.is_finite() && start.is_finite() {
            end - start
        } else {
            0.0
        }
    };

    let total_output_tokens: u64 = ok_results
        .iter()
        .filter_map(|r| r.output_tokens)
        .map(u64::from)
        .sum();
    let total_output_tokens_before_timeout: u64 = ok_results
        .iter()
        .filter_map(|r| r.output_tokens_before_timeout)
        .map(u64::from)
        .sum();

    let throughput_full_duration = if full_duration > 0.0 {
        total_output_tokens as f64 / full_duration
    } else {
        0.0
    };
    let throughput = if configured_duration > 0.0 {
        total_output_tokens_before_timeout as f64 / configured_duration
    } else {
        0.0
    };

    let req_completed_within_test_duration = ok_results
        .iter()
        .filter(|r| r.completed_within_window())
        .count();

    let mut metrics = BTreeMap::new();
    for name in METRIC_NAMES {
        let values = metric_values(&ok_results, name);
        if let Some(stats) = MetricStats::from_values(&values) {
            metrics.insert((*name).to_owned(), stats);
        }
    }

    Summary {
        metrics,
        throughput,
        throughput_full_duration,
        full_duration,
        total_requests,
        req_completed_within_test_duration,
        total_failures,
        failure_rate,
    }
}

/// The full output document written to the result file (§4.5, §6): the
/// configuration the run was executed with, the raw per-request results, and
/// the computed summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDocument {
    pub config: Value,
    pub results: Vec<RequestResult>,
    pub summary: Summary,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(start: f64, end: f64, output_tokens: u32, before_timeout: u32) -> RequestResult {
        let mut r = RequestResult::new(0, "q".to_owned(), 10);
        r.start_time = Some(start);
        r.end_time = Some(end);
        r.output_tokens = Some(output_tokens);
        r.output_tokens_before_timeout = Some(before_timeout);
        r.finish();
        r
    }

    #[test]
    fn summary_round_trip_counts() {
        let mut results = vec![
            ok_result(0.0, 1.0, 10, 10),
            ok_result(0.5, 2.0, 10, 8),
        ];
        let mut failed = RequestResult::new(1, "q2".to_owned(), 10);
        failed.fail(Some(500), "boom");
        results.push(failed);

        let summary = summarize(&results, 2.0);
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_failures, 1);
        assert!((summary.failure_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn streaming_metrics_restricted_to_completed_within_window() {
        let mut truncated = ok_result(0.0, 1.0, 10, 5);
        truncated.first_token_time = Some(0.1);
        truncated.ack_time = Some(0.05);
        truncated.finish();

        let mut complete = ok_result(0.0, 1.0, 10, 10);
        complete.first_token_time = Some(0.1);
        complete.ack_time = Some(0.05);
        complete.finish();

        let summary = summarize(&[truncated, complete], 1.0);
        // Only the `complete` result should contribute to ttft/tt_ack stats.
        assert_eq!(summary.metrics["ttft"].min, summary.metrics["ttft"].max);
    }

    #[test]
    fn throughput_and_full_duration() {
        let results = vec![ok_result(0.0, 2.0, 10, 5), ok_result(1.0, 3.0, 10, 10)];
        let summary = summarize(&results, 2.0);
        // full_duration = max(end) - min(start) = 3.0 - 0.0 = 3.0
        assert_eq!(summary.full_duration, 3.0);
        // throughput_full_duration = total output_tokens / full_duration = 20 / 3.0
        assert!((summary.throughput_full_duration - 20.0 / 3.0).abs() < 1e-9);
        // throughput = total output_tokens_before_timeout / configured_duration = 15 / 2.0
        assert_eq!(summary.throughput, 7.5);
    }
}
