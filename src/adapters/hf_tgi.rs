//! Hugging Face TGI streaming adapter (`/generate_stream`).
//!
//! Grounded in `hf_tgi_plugin.py`: POST JSON, read back newline-delimited
//! `data: {...}` SSE lines, each carrying `{"token": {"text": ...}}`. Only
//! streaming is supported upstream (the original logs an error and leaves
//! unary unimplemented), which we preserve.

use futures::StreamExt as _;
use reqwest::Client;

use crate::{
    adapters::{Adapter, StreamChunk, finish_streaming_result, now_secs},
    config::PluginOptions,
    dataset::Query,
    prelude::*,
    result::RequestResult,
};

#[derive(Deserialize)]
struct TokenInfo {
    text: String,
}

#[derive(Deserialize)]
struct GenerateStreamMessage {
    #[serde(default)]
    token: Option<TokenInfo>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<GenerateStreamDetails>,
}

#[derive(Deserialize)]
struct GenerateStreamDetails {
    #[serde(default)]
    finish_reason: Option<String>,
}

pub struct HfTgiAdapter {
    client: Client,
    url: String,
}

impl HfTgiAdapter {
    pub fn new(options: &PluginOptions) -> Result<Self> {
        let host = options
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("hf_tgi plugin requires plugin_options.host"))?;
        if !options.streaming {
            return Err(anyhow!(
                "hf_tgi plugin only supports streaming=true (matches upstream)"
            ));
        }
        let url = format!("{host}/generate_stream");
        let mut builder = Client::builder();
        if !options.use_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().context("failed to build reqwest client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Adapter for HfTgiAdapter {
    async fn execute(&self, query: &Query, user_id: usize, deadline: f64) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);

        let body = json!({
            "inputs": query.text,
            "parameters": {
                "max_new_tokens": query.output_tokens,
                "details": true,
            },
        });

        let mut request = self.client.post(&self.url).json(&body);
        request = request.header("Content-Type", "application/json");

        result.start_time = Some(now_secs());
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                result.end_time = Some(now_secs());
                result.fail(err.status().map(|s| s.as_u16() as i32), format!("{err:#}"));
                return result;
            }
        };
        if let Err(err) = response.error_for_status_ref() {
            let status = response.status().as_u16() as i32;
            result.end_time = Some(now_secs());
            result.fail(Some(status), format!("{err:#}"));
            return result;
        }

        let mut chunks = Vec::new();
        let mut stop_reason = None;
        let mut acked = false;
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(next) = byte_stream.next().await {
            let receive_time = now_secs();
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("error reading hf_tgi chunk: {err:#}");
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_owned();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                let message: GenerateStreamMessage = match serde_json::from_str(data) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("malformed hf_tgi response line: {err:#}: {data}");
                        continue;
                    }
                };
                if let Some(error) = message.error {
                    result.fail(None, error);
                    break;
                }
                if !acked {
                    result.ack_time = Some(receive_time);
                    acked = true;
                }
                if let Some(details) = message.details {
                    stop_reason = details.finish_reason;
                }
                let Some(token) = message.token else { continue };
                if token.text.is_empty() {
                    continue;
                }
                if result.first_token_time.is_none() {
                    result.first_token_time = Some(receive_time);
                }
                chunks.push(StreamChunk {
                    receive_time,
                    token_count: 1,
                    text: token.text,
                });
            }
        }
        result.end_time = Some(now_secs());

        if result.is_error() {
            return result;
        }
        finish_streaming_result(&mut result, &chunks, stop_reason, deadline);
        result
    }
}
