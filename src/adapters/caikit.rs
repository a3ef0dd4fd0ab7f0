//! Caikit NLP text-generation adapter: both transports (`http`, `grpc`) and
//! both call shapes (`streaming`, unary) from `caikit_client_plugin.py`.

use reqwest::Client as HttpClient;
use tonic::transport::Channel;

use crate::{
    adapters::{Adapter, StreamChunk, finish_streaming_result, now_secs},
    config::PluginOptions,
    dataset::Query,
    prelude::*,
    proto::caikit_nlp::{
        GeneratedTextResult, GeneratedTextStreamResult, TextGenerationTaskRequest,
        nlp_service_client::NlpServiceClient,
    },
    result::RequestResult,
};

enum Transport {
    Http { client: HttpClient, url: String },
    Grpc { client: NlpServiceClient<Channel> },
}

pub struct CaikitAdapter {
    transport: Transport,
    model_name: String,
    streaming: bool,
}

impl CaikitAdapter {
    pub async fn new(options: &PluginOptions) -> Result<Self> {
        let host = options
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("caikit plugin requires plugin_options.host"))?;
        let port = options
            .port
            .ok_or_else(|| anyhow!("caikit plugin requires plugin_options.port"))?;
        let model_name = options
            .model_name
            .clone()
            .ok_or_else(|| anyhow!("caikit plugin requires plugin_options.model_name"))?;
        let interface = options.interface.as_deref().unwrap_or("http");

        let transport = match interface {
            "http" => {
                let url = format!("{host}:{port}");
                let mut builder = HttpClient::builder();
                if !options.use_tls {
                    builder = builder.danger_accept_invalid_certs(true);
                }
                Transport::Http {
                    client: builder.build().context("failed to build reqwest client")?,
                    url,
                }
            }
            "grpc" => {
                let scheme = if options.use_tls { "https" } else { "http" };
                let endpoint =
                    tonic::transport::Endpoint::from_shared(format!("{scheme}://{host}:{port}"))
                        .context("invalid caikit grpc endpoint")?;
                let channel = endpoint
                    .connect()
                    .await
                    .context("failed to connect to caikit grpc backend")?;
                Transport::Grpc {
                    client: NlpServiceClient::new(channel),
                }
            }
            other => return Err(anyhow!("unsupported caikit interface {other:?}")),
        };

        Ok(Self {
            transport,
            model_name,
            streaming: options.streaming,
        })
    }

    async fn execute_http_unary(&self, client: &HttpClient, url: &str, query: &Query) -> RequestResult {
        let mut result = RequestResult::new(0, query.input_id.clone(), query.input_tokens);
        let body = json!({
            "model_id": self.model_name,
            "inputs": query.text,
            "parameters": {
                "max_new_tokens": query.output_tokens,
                "min_new_tokens": query.output_tokens,
            },
        });

        result.start_time = Some(now_secs());
        let response = client
            .post(format!("{url}/api/v1/task/text-generation"))
            .json(&body)
            .send()
            .await;
        result.end_time = Some(now_secs());

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<GeneratedTextResult>().await {
                    Ok(parsed) => {
                        result.output_text = Some(parsed.generated_text);
                        result.output_tokens = Some(parsed.generated_tokens);
                        result.output_tokens_before_timeout = Some(parsed.generated_tokens);
                        result.stop_reason = Some(parsed.stop_reason);
                        result.finish();
                    }
                    Err(err) => result.fail(None, format!("{err:#}")),
                }
            }
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                result.fail(Some(status), format!("http status {status}"));
            }
            Err(err) => result.fail(err.status().map(|s| s.as_u16() as i32), format!("{err:#}")),
        }
        result
    }

    async fn execute_http_streaming(
        &self,
        client: &HttpClient,
        url: &str,
        query: &Query,
        deadline: f64,
    ) -> RequestResult {
        use futures::StreamExt as _;

        let mut result = RequestResult::new(0, query.input_id.clone(), query.input_tokens);
        let body = json!({
            "model_id": self.model_name,
            "inputs": query.text,
            "parameters": {
                "max_new_tokens": query.output_tokens,
                "min_new_tokens": query.output_tokens,
            },
        });

        result.start_time = Some(now_secs());
        let response = match client
            .post(format!("{url}/api/v1/task/server-streaming-text-generation"))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                result.end_time = Some(now_secs());
                result.fail(err.status().map(|s| s.as_u16() as i32), format!("{err:#}"));
                return result;
            }
        };
        if !response.status().is_success() {
            let status = response.status().as_u16() as i32;
            result.end_time = Some(now_secs());
            result.fail(Some(status), format!("http status {status}"));
            return result;
        }

        let mut chunks = Vec::new();
        let mut stop_reason = None;
        let mut acked = false;
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(next) = byte_stream.next().await {
            let receive_time = now_secs();
            let Ok(bytes) = next else { break };
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
                let message: GeneratedTextStreamResult = match serde_json::from_str(data) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("malformed caikit stream line: {err:#}");
                        continue;
                    }
                };
                if !acked {
                    result.ack_time = Some(receive_time);
                    acked = true;
                }
                if !message.stop_reason.is_empty() {
                    stop_reason = Some(message.stop_reason);
                }
                if message.generated_text.is_empty() {
                    continue;
                }
                if result.first_token_time.is_none() {
                    result.first_token_time = Some(receive_time);
                }
                chunks.push(StreamChunk {
                    receive_time,
                    token_count: 1,
                    text: message.generated_text,
                });
            }
        }
        result.end_time = Some(now_secs());
        finish_streaming_result(&mut result, &chunks, stop_reason, deadline);
        result
    }

    async fn execute_grpc_unary(
        &self,
        client: &NlpServiceClient<Channel>,
        query: &Query,
    ) -> RequestResult {
        let mut result = RequestResult::new(0, query.input_id.clone(), query.input_tokens);
        let request = TextGenerationTaskRequest {
            text: query.text.clone(),
            max_new_tokens: query.output_tokens,
            min_new_tokens: query.output_tokens,
        };

        result.start_time = Some(now_secs());
        let mut client = client.clone();
        let response = client.text_generation_task_predict(request).await;
        result.end_time = Some(now_secs());

        match response {
            Ok(response) => {
                let response = response.into_inner();
                result.output_text = Some(response.generated_text);
                result.output_tokens = Some(response.generated_tokens);
                result.output_tokens_before_timeout = Some(response.generated_tokens);
                result.stop_reason = Some(response.stop_reason);
                result.finish();
            }
            Err(status) => result.fail(Some(status.code() as i32), status.message().to_owned()),
        }
        result
    }

    async fn execute_grpc_streaming(
        &self,
        client: &NlpServiceClient<Channel>,
        query: &Query,
        deadline: f64,
    ) -> RequestResult {
        let mut result = RequestResult::new(0, query.input_id.clone(), query.input_tokens);
        let request = TextGenerationTaskRequest {
            text: query.text.clone(),
            max_new_tokens: query.output_tokens,
            min_new_tokens: query.output_tokens,
        };

        result.start_time = Some(now_secs());
        let mut client = client.clone();
        let response = match client
            .server_streaming_text_generation_task_predict(request)
            .await
        {
            Ok(response) => response,
            Err(status) => {
                result.end_time = Some(now_secs());
                result.fail(Some(status.code() as i32), status.message().to_owned());
                return result;
            }
        };

        let mut stream = response.into_inner();
        let mut chunks = Vec::new();
        let mut stop_reason = None;
        let mut acked = false;
        loop {
            let item = stream.message().await;
            let receive_time = now_secs();
            match item {
                Ok(Some(message)) => {
                    if !acked {
                        result.ack_time = Some(receive_time);
                        acked = true;
                    }
                    if !message.stop_reason.is_empty() {
                        stop_reason = Some(message.stop_reason);
                    }
                    if message.generated_text.is_empty() {
                        continue;
                    }
                    if result.first_token_time.is_none() {
                        result.first_token_time = Some(receive_time);
                    }
                    chunks.push(StreamChunk {
                        receive_time,
                        token_count: 1,
                        text: message.generated_text,
                    });
                }
                Ok(None) => break,
                Err(status) => {
                    warn!("caikit grpc stream error: {status}");
                    break;
                }
            }
        }
        result.end_time = Some(now_secs());
        finish_streaming_result(&mut result, &chunks, stop_reason, deadline);
        result
    }
}

#[async_trait]
impl Adapter for CaikitAdapter {
    async fn execute(&self, query: &Query, user_id: usize, deadline: f64) -> RequestResult {
        let mut result = match (&self.transport, self.streaming) {
            (Transport::Http { client, url }, false) => {
                self.execute_http_unary(client, url, query).await
            }
            (Transport::Http { client, url }, true) => {
                self.execute_http_streaming(client, url, query, deadline).await
            }
            (Transport::Grpc { client }, false) => self.execute_grpc_unary(client, query).await,
            (Transport::Grpc { client }, true) => {
                self.execute_grpc_streaming(client, query, deadline).await
            }
        };
        result.user_id = user_id;
        result
    }
}
