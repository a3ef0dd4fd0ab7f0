//! Protocol Adapter layer: normalizes heterogeneous inference APIs into a
//! uniform [`RequestResult`] (§4.2).
//!
//! Each variant is an independent, self-contained plugin holding its own
//! transport (HTTP client or gRPC channel), selected from configuration at
//! startup via [`PluginKind::build`]. We deliberately avoid an inheritance
//! tree here — see the design notes' "polymorphic adapter" guidance — in
//! favor of one [`Adapter`] trait object per run.

pub mod caikit;
pub mod caikit_embedding;
pub mod dummy;
pub mod hf_tgi;
pub mod openai;
pub mod tgis_grpc;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{config::PluginOptions, dataset::Query, prelude::*, result::RequestResult};

/// Which plugin variant to use, as named in `config.plugin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Openai,
    Caikit,
    CaikitEmbedding,
    TgisGrpc,
    HfTgi,
    Dummy,
}

impl PluginKind {
    /// Construct the adapter named by this plugin kind from `options`.
    pub async fn build(self, options: &PluginOptions) -> Result<Box<dyn Adapter>> {
        match self {
            PluginKind::Openai => Ok(Box::new(openai::OpenAiAdapter::new(options)?)),
            PluginKind::Caikit => Ok(Box::new(caikit::CaikitAdapter::new(options).await?)),
            PluginKind::CaikitEmbedding => Ok(Box::new(
                caikit_embedding::CaikitEmbeddingAdapter::new(options)?,
            )),
            PluginKind::TgisGrpc => {
                Ok(Box::new(tgis_grpc::TgisGrpcAdapter::new(options).await?))
            }
            PluginKind::HfTgi => Ok(Box::new(hf_tgi::HfTgiAdapter::new(options)?)),
            PluginKind::Dummy => Ok(Box::new(dummy::DummyAdapter::new(options))),
        }
    }
}

/// The uniform contract every backend plugin implements: execute one request
/// and return a completed [`RequestResult`], never propagating an error
/// across the boundary (§7 — adapters never raise; every failure becomes a
/// `Result` with `error_code`/`error_text` set).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Execute one request for `query` on behalf of `user_id`, with
    /// `deadline` as the absolute end of the test window (used to compute
    /// `output_tokens_before_timeout` for streaming responses).
    async fn execute(&self, query: &Query, user_id: usize, deadline: f64) -> RequestResult;
}

/// Current wall-clock time, in fractional seconds since the Unix epoch.
///
/// All adapters must call this (not `Instant::now`) so that timestamps are
/// comparable against the scheduler's `deadline`, which is computed the same
/// way.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs_f64()
}

/// One decoded chunk of a streaming response, with the receive timestamp
/// captured before any decoding work (§4.2, step 4 and the design notes'
/// "time capture discipline").
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub receive_time: f64,
    pub token_count: u32,
    pub text: String,
}

/// Assemble the streaming portion of a [`RequestResult`] from an ordered list
/// of decoded chunks, an optional trailing stop reason, and the test
/// deadline.
///
/// Shared by every streaming adapter so the token-accounting rules in §4.2
/// (steps 3, 4, 7) are implemented exactly once.
pub fn finish_streaming_result(
    result: &mut RequestResult,
    chunks: &[StreamChunk],
    stop_reason: Option<String>,
    deadline: f64,
) {
    result.output_text = Some(chunks.iter().map(|c| c.text.as_str()).collect());

    let counted_tokens: u32 = chunks.iter().map(|c| c.token_count).sum();
    if result.output_tokens.is_none() {
        result.output_tokens = Some(counted_tokens);
    }

    let before_timeout: u32 = chunks
        .iter()
        .filter(|c| c.receive_time <= deadline)
        .map(|c| c.token_count)
        .sum();
    result.output_tokens_before_timeout = Some(before_timeout.min(
        result
            .output_tokens
            .expect("output_tokens set above if still unset"),
    ));

    result.stop_reason = stop_reason;
    result.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_streaming_result_caps_before_timeout_at_output_tokens() {
        let mut result = RequestResult::new(0, "q".to_owned(), 10);
        result.start_time = Some(0.0);
        result.first_token_time = Some(0.1);
        result.end_time = Some(1.0);

        let chunks = vec![
            StreamChunk {
                receive_time: 0.1,
                token_count: 1,
                text: "a".to_owned(),
            },
            StreamChunk {
                receive_time: 0.5,
                token_count: 1,
                text: "b".to_owned(),
            },
            StreamChunk {
                receive_time: 2.0,
                token_count: 1,
                text: "c".to_owned(),
            },
        ];
        finish_streaming_result(&mut result, &chunks, Some("stop".to_owned()), 1.0);

        assert_eq!(result.output_tokens, Some(3));
        assert_eq!(result.output_tokens_before_timeout, Some(2));
        assert_eq!(result.output_text.as_deref(), Some("abc"));
    }
}
