//! Dummy adapter, for self-tests and seed scenarios S1–S3.
//!
//! Grounded in `dummy_plugin.py`: a unary variant that sleeps a fixed
//! duration and echoes the query text, and a streaming variant that acks,
//! waits for the first token, then emits one token per configured
//! inter-token interval.

use std::time::Duration;

use tokio::time::sleep;

use crate::{
    adapters::{Adapter, StreamChunk, finish_streaming_result, now_secs},
    config::PluginOptions,
    dataset::Query,
    prelude::*,
    result::RequestResult,
};

const DEFAULT_RESPONSE_TIME_MS: u64 = 1000;
const DEFAULT_INTER_TOKEN_DELAY_MS: u64 = 50;

/// Deterministic self-test adapter.
#[derive(Debug)]
pub struct DummyAdapter {
    streaming: bool,
    response_time: Duration,
    inter_token_delay: Duration,
}

impl DummyAdapter {
    pub fn new(options: &PluginOptions) -> Self {
        Self {
            streaming: options.streaming,
            response_time: Duration::from_millis(
                options.dummy_response_time_ms.unwrap_or(DEFAULT_RESPONSE_TIME_MS),
            ),
            inter_token_delay: Duration::from_millis(
                options
                    .dummy_inter_token_delay_ms
                    .unwrap_or(DEFAULT_INTER_TOKEN_DELAY_MS),
            ),
        }
    }

    async fn execute_unary(&self, query: &Query, user_id: usize) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);
        result.start_time = Some(now_secs());
        sleep(self.response_time).await;
        result.end_time = Some(now_secs());

        result.output_text = Some(query.text.clone());
        result.output_tokens = Some(query.output_tokens);
        result.output_tokens_before_timeout = Some(query.output_tokens);
        result.stop_reason = Some("stop".to_owned());
        result.finish();
        result
    }

    async fn execute_streaming(
        &self,
        query: &Query,
        user_id: usize,
        deadline: f64,
    ) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);
        result.start_time = Some(now_secs());

        // Acknowledge the connection immediately.
        result.ack_time = Some(now_secs());

        let mut chunks = Vec::with_capacity(query.output_tokens as usize);
        for i in 0..query.output_tokens {
            sleep(self.inter_token_delay).await;
            let receive_time = now_secs();
            if i == 0 {
                result.first_token_time = Some(receive_time);
            }
            chunks.push(StreamChunk {
                receive_time,
                token_count: 1,
                text: format!("token{i} "),
            });
        }
        result.end_time = Some(now_secs());

        finish_streaming_result(&mut result, &chunks, Some("length".to_owned()), deadline);
        result
    }
}

#[async_trait]
impl Adapter for DummyAdapter {
    async fn execute(&self, query: &Query, user_id: usize, deadline: f64) -> RequestResult {
        if self.streaming {
            self.execute_streaming(query, user_id, deadline).await
        } else {
            self.execute_unary(query, user_id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> Query {
        Query {
            input_id: "q1".to_owned(),
            text: "hello world".to_owned(),
            input_tokens: 5,
            output_tokens: 3,
        }
    }

    #[tokio::test]
    async fn unary_has_no_streaming_timestamps() {
        let options = PluginOptions {
            streaming: false,
            dummy_response_time_ms: Some(1),
            ..Default::default()
        };
        let adapter = DummyAdapter::new(&options);
        let result = adapter.execute(&query(), 0, now_secs() + 10.0).await;

        assert!(!result.is_error());
        assert!(result.ack_time.is_none());
        assert!(result.first_token_time.is_none());
        assert_eq!(result.output_tokens, Some(3));
        assert_eq!(result.output_tokens_before_timeout, Some(3));
    }

    #[tokio::test]
    async fn streaming_respects_deadline() {
        let options = PluginOptions {
            streaming: true,
            dummy_inter_token_delay_ms: Some(20),
            ..Default::default()
        };
        let adapter = DummyAdapter::new(&options);
        // Deadline passes before the third token would arrive.
        let deadline = now_secs() + 0.035;
        let result = adapter.execute(&query(), 0, deadline).await;

        assert!(!result.is_error());
        assert_eq!(result.output_tokens, Some(3));
        let before_timeout = result.output_tokens_before_timeout.unwrap();
        assert!(before_timeout < 3, "expected truncation, got {before_timeout}");
    }
}
