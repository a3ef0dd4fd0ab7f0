//! TGIS (text-generation-inference-server) gRPC adapter.
//!
//! Grounded in `tgis_grpc_plugin.py`, against the wire shapes reconstructed
//! in `proto/generation.proto`: a batched unary `Generate` call and a
//! single-request streaming `GenerateStream` call.

use tonic::transport::Channel;

use crate::{
    adapters::{Adapter, StreamChunk, finish_streaming_result, now_secs},
    config::PluginOptions,
    dataset::Query,
    prelude::*,
    proto::generation::{
        BatchedGenerationRequest, DecodingMethod, GenerationRequest, Parameters,
        ResponseOptions, SingleGenerationRequest, StoppingCriteria,
        generation_service_client::GenerationServiceClient,
    },
    result::RequestResult,
};

pub struct TgisGrpcAdapter {
    client: GenerationServiceClient<Channel>,
    model_name: String,
    streaming: bool,
}

impl TgisGrpcAdapter {
    pub async fn new(options: &PluginOptions) -> Result<Self> {
        let host = options
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("tgis_grpc plugin requires plugin_options.host"))?;
        let port = options
            .port
            .ok_or_else(|| anyhow!("tgis_grpc plugin requires plugin_options.port"))?;
        let model_name = options
            .model_name
            .clone()
            .ok_or_else(|| anyhow!("tgis_grpc plugin requires plugin_options.model_name"))?;

        let scheme = if options.use_tls { "https" } else { "http" };
        let endpoint = tonic::transport::Endpoint::from_shared(format!(
            "{scheme}://{host}:{port}"
        ))
        .context("invalid tgis_grpc endpoint")?;
        let channel = endpoint
            .connect()
            .await
            .context("failed to connect to tgis_grpc backend")?;
        let client = GenerationServiceClient::new(channel);

        Ok(Self {
            client,
            model_name,
            streaming: options.streaming,
        })
    }

    fn params(&self, output_tokens: u32, want_generated_tokens: bool) -> Parameters {
        Parameters {
            method: DecodingMethod::Greedy as i32,
            stopping: Some(StoppingCriteria {
                max_new_tokens: output_tokens,
                min_new_tokens: output_tokens,
            }),
            response: Some(ResponseOptions {
                generated_tokens: want_generated_tokens,
                input_tokens: false,
            }),
        }
    }

    async fn execute_unary(&self, query: &Query, user_id: usize) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);

        let request = BatchedGenerationRequest {
            model_id: self.model_name.clone(),
            requests: vec![GenerationRequest {
                text: query.text.clone(),
            }],
            params: Some(self.params(query.output_tokens, false)),
        };

        result.start_time = Some(now_secs());
        let mut client = self.client.clone();
        let response = client.generate(request).await;
        result.end_time = Some(now_secs());

        match response {
            Ok(response) => {
                let response = response.into_inner();
                if let Some(first) = response.responses.into_iter().next() {
                    result.output_text = Some(first.text);
                    result.output_tokens = Some(first.generated_token_count);
                    result.stop_reason = Some(first.stop_reason);
                    if first.input_token_count > 0 {
                        result.input_tokens = first.input_token_count;
                    }
                } else {
                    result.output_tokens = Some(query.output_tokens);
                }
                result.output_tokens_before_timeout = result.output_tokens;
                result.finish();
            }
            Err(status) => {
                result.fail(Some(status.code() as i32), status.message().to_owned());
            }
        }
        result
    }

    async fn execute_streaming(
        &self,
        query: &Query,
        user_id: usize,
        deadline: f64,
    ) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);

        let request = SingleGenerationRequest {
            model_id: self.model_name.clone(),
            request: Some(GenerationRequest {
                text: query.text.clone(),
            }),
            params: Some(self.params(query.output_tokens, true)),
        };

        result.start_time = Some(now_secs());
        let mut client = self.client.clone();
        let response = match client.generate_stream(request).await {
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
                        stop_reason = Some(message.stop_reason.clone());
                    }
                    for token in message.tokens {
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
                Ok(None) => break,
                Err(status) => {
                    warn!("tgis_grpc stream error: {status}");
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
impl Adapter for TgisGrpcAdapter {
    async fn execute(&self, query: &Query, user_id: usize, deadline: f64) -> RequestResult {
        if self.streaming {
            self.execute_streaming(query, user_id, deadline).await
        } else {
            self.execute_unary(query, user_id).await
        }
    }
}
