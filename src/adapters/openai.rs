//! OpenAI-compatible adapter: legacy ("/v1/completions") and chat
//! ("/v1/chat/completions") completion APIs, streaming or unary.
//!
//! Grounded in `openai_plugin.py`, generalized from the teacher's
//! `drivers/openai.rs` (same `async-openai` client, same
//! `OpenAIConfig`-from-host construction), but driven through
//! `async-openai`'s typed streaming API rather than the teacher's
//! JSON-schema-constrained single-shot call — this system counts and times
//! tokens as they stream, it doesn't validate structured output.
//!
//! The legacy completions endpoint additionally needs `min_tokens` set
//! alongside `max_tokens` (`openai_plugin.py:97,180`), a vLLM-style extension
//! the typed `CreateCompletionRequest` has no field for. We use the same
//! `byot` ("bring your own types") escape hatch the teacher's
//! `drivers/openai.rs` uses for its own typed-API gaps: build the request
//! with the typed builder, then splice `min_tokens` into its JSON form before
//! sending it through `create_byot`/`create_stream_byot`.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        ChatCompletionStreamOptions, CreateChatCompletionRequestArgs, CreateCompletionRequestArgs,
        CreateCompletionResponse,
    },
};
use futures::StreamExt as _;

use crate::{
    adapters::{Adapter, StreamChunk, finish_streaming_result, now_secs},
    config::{OpenAiApi, PluginOptions},
    dataset::Query,
    prelude::*,
    result::RequestResult,
};

/// OpenAI-compatible adapter (also used for LiteLLM, vLLM, and other
/// compatible gateways).
pub struct OpenAiAdapter {
    client: Client<OpenAIConfig>,
    model_name: Option<String>,
    api: OpenAiApi,
    streaming: bool,
}

impl OpenAiAdapter {
    pub fn new(options: &PluginOptions) -> Result<Self> {
        let host = options
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("openai plugin requires plugin_options.host"))?;
        let endpoint = options.endpoint.as_deref().unwrap_or("");
        let api_base = format!("{host}{endpoint}");

        let mut config = OpenAIConfig::new().with_api_base(api_base);
        if let Some(token) = &options.authorization {
            config = config.with_api_key(token.clone());
        }

        let api = options.api.unwrap_or_else(|| {
            if endpoint.contains("chat") {
                OpenAiApi::Chat
            } else {
                OpenAiApi::Legacy
            }
        });

        Ok(Self {
            client: Client::with_config(config),
            model_name: options.model_name.clone(),
            api,
            streaming: options.streaming,
        })
    }

    async fn execute_chat(
        &self,
        query: &Query,
        user_id: usize,
        deadline: f64,
    ) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);

        let message = match ChatCompletionRequestUserMessageArgs::default()
            .content(query.text.clone())
            .build()
            .map(ChatCompletionRequestMessage::User)
        {
            Ok(message) => message,
            Err(err) => {
                result.fail(None, format!("failed to build chat request: {err:#}"));
                return result;
            }
        };

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(self.model_name.clone().unwrap_or_default())
            .messages(vec![message])
            .max_completion_tokens(query.output_tokens);

        if self.streaming {
            builder
                .stream(true)
                .stream_options(ChatCompletionStreamOptions {
                    include_usage: true,
                });
        }

        let request = match builder.build() {
            Ok(request) => request,
            Err(err) => {
                result.fail(None, format!("failed to build chat request: {err:#}"));
                return result;
            }
        };

        result.start_time = Some(now_secs());
        if self.streaming {
            let mut stream = match self.client.chat().create_stream(request).await {
                Ok(stream) => stream,
                Err(err) => {
                    result.end_time = Some(now_secs());
                    result.fail(None, format!("{err:#}"));
                    return result;
                }
            };

            let mut chunks = Vec::new();
            let mut stop_reason = None;
            let mut acked = false;
            while let Some(item) = stream.next().await {
                let receive_time = now_secs();
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!("malformed chat completion chunk: {err:#}");
                        continue;
                    }
                };
                if !acked {
                    result.ack_time = Some(receive_time);
                    acked = true;
                }
                if let Some(usage) = chunk.usage {
                    result.input_tokens = usage.prompt_tokens;
                    result.output_tokens = Some(usage.completion_tokens);
                    continue;
                }
                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };
                if let Some(reason) = choice.finish_reason {
                    stop_reason = Some(format!("{reason:?}"));
                }
                let Some(text) = choice.delta.content else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }
                if result.first_token_time.is_none() {
                    result.first_token_time = Some(receive_time);
                }
                chunks.push(StreamChunk {
                    receive_time,
                    token_count: 1,
                    text,
                });
            }
            result.end_time = Some(now_secs());
            finish_streaming_result(&mut result, &chunks, stop_reason, deadline);
        } else {
            match self.client.chat().create(request).await {
                Ok(response) => {
                    result.end_time = Some(now_secs());
                    if let Some(usage) = response.usage {
                        result.input_tokens = usage.prompt_tokens;
                        result.output_tokens = Some(usage.completion_tokens);
                    }
                    if let Some(choice) = response.choices.into_iter().next() {
                        result.output_text = choice.message.content;
                        result.stop_reason = Some(format!("{:?}", choice.finish_reason));
                    }
                    result.output_tokens_before_timeout = result.output_tokens;
                    result.finish();
                }
                Err(err) => {
                    result.end_time = Some(now_secs());
                    result.fail(None, format!("{err:#}"));
                }
            }
        }
        result
    }

    async fn execute_legacy(
        &self,
        query: &Query,
        user_id: usize,
        deadline: f64,
    ) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);

        let mut builder = CreateCompletionRequestArgs::default();
        builder
            .model(self.model_name.clone().unwrap_or_default())
            .prompt(query.text.clone())
            .max_tokens(query.output_tokens as u16);

        if self.streaming {
            builder.stream(true);
        }

        let request = match builder.build() {
            Ok(request) => request,
            Err(err) => {
                result.fail(None, format!("failed to build completion request: {err:#}"));
                return result;
            }
        };

        // Honor `max_tokens == min_tokens` (§4.2) for deterministic-length
        // outputs. `min_tokens` isn't in the official OpenAI schema
        // `CreateCompletionRequestArgs` builds, so we splice it into the
        // built request's JSON form and send it through `byot` instead of
        // `create`/`create_stream`.
        let mut request_json = match serde_json::to_value(&request) {
            Ok(value) => value,
            Err(err) => {
                result.fail(
                    None,
                    format!("failed to serialize completion request: {err:#}"),
                );
                return result;
            }
        };
        if let Some(object) = request_json.as_object_mut() {
            object.insert("min_tokens".to_owned(), json!(query.output_tokens));
        }

        result.start_time = Some(now_secs());
        if self.streaming {
            let mut stream = match self
                .client
                .completions()
                .create_stream_byot::<_, CreateCompletionResponse>(request_json)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    result.end_time = Some(now_secs());
                    result.fail(None, format!("{err:#}"));
                    return result;
                }
            };

            let mut chunks = Vec::new();
            let mut stop_reason = None;
            let mut acked = false;
            while let Some(item) = stream.next().await {
                let receive_time = now_secs();
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!("malformed completion chunk: {err:#}");
                        continue;
                    }
                };
                if !acked {
                    result.ack_time = Some(receive_time);
                    acked = true;
                }
                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };
                if let Some(reason) = choice.finish_reason {
                    stop_reason = Some(reason);
                }
                if choice.text.is_empty() {
                    continue;
                }
                if result.first_token_time.is_none() {
                    result.first_token_time = Some(receive_time);
                }
                chunks.push(StreamChunk {
                    receive_time,
                    token_count: 1,
                    text: choice.text,
                });
            }
            result.end_time = Some(now_secs());
            finish_streaming_result(&mut result, &chunks, stop_reason, deadline);
        } else {
            match self
                .client
                .completions()
                .create_byot::<_, CreateCompletionResponse>(request_json)
                .await
            {
                Ok(response) => {
                    result.end_time = Some(now_secs());
                    if let Some(usage) = response.usage {
                        result.input_tokens = usage.prompt_tokens;
                        result.output_tokens = Some(usage.completion_tokens);
                    }
                    if let Some(choice) = response.choices.into_iter().next() {
                        result.output_text = Some(choice.text);
                        result.stop_reason = choice.finish_reason;
                    }
                    result.output_tokens_before_timeout = result.output_tokens;
                    result.finish();
                }
                Err(err) => {
                    result.end_time = Some(now_secs());
                    result.fail(None, format!("{err:#}"));
                }
            }
        }
        result
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    async fn execute(&self, query: &Query, user_id: usize, deadline: f64) -> RequestResult {
        match self.api {
            OpenAiApi::Chat => self.execute_chat(query, user_id, deadline).await,
            OpenAiApi::Legacy => self.execute_legacy(query, user_id, deadline).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_chat_api_from_endpoint() {
        let options = PluginOptions {
            host: Some("http://localhost:8000".to_owned()),
            endpoint: Some("/v1/chat/completions".to_owned()),
            ..Default::default()
        };
        let adapter = OpenAiAdapter::new(&options).unwrap();
        assert_eq!(adapter.api, OpenAiApi::Chat);
    }

    #[test]
    fn infers_legacy_api_from_endpoint() {
        let options = PluginOptions {
            host: Some("http://localhost:8000".to_owned()),
            endpoint: Some("/v1/completions".to_owned()),
            ..Default::default()
        };
        let adapter = OpenAiAdapter::new(&options).unwrap();
        assert_eq!(adapter.api, OpenAiApi::Legacy);
    }

    #[test]
    fn requires_host() {
        let options = PluginOptions::default();
        assert!(OpenAiAdapter::new(&options).is_err());
    }
}
