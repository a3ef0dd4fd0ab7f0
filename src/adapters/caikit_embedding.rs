//! Caikit embedding / sentence-similarity / rerank adapter.
//!
//! Grounded in `caikit_embedding_plugin.py`. Only the HTTP transport is
//! implemented, matching upstream (the gRPC variants there are explicit
//! stubs: `caikit-nlp-client` never implemented embeddings over gRPC). The
//! `task` plugin option selects among the three HTTP call shapes; all three
//! are unary and produce no output tokens, so they populate the same
//! uniform `RequestResult` with `output_tokens = 0`.

use reqwest::Client;

use crate::{
    adapters::{Adapter, now_secs},
    config::PluginOptions,
    dataset::Query,
    prelude::*,
    result::RequestResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbeddingTask {
    Embedding,
    SentenceSimilarity,
    Rerank,
}

impl EmbeddingTask {
    fn endpoint(self) -> &'static str {
        match self {
            EmbeddingTask::Embedding => "/api/v1/task/embedding",
            EmbeddingTask::SentenceSimilarity => "/api/v1/task/sentence-similarity",
            EmbeddingTask::Rerank => "/api/v1/task/rerank",
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    input_token_count: Option<u32>,
}

pub struct CaikitEmbeddingAdapter {
    client: Client,
    url: String,
    model_name: String,
    model_max_input_tokens: Option<u32>,
    task: EmbeddingTask,
}

impl CaikitEmbeddingAdapter {
    pub fn new(options: &PluginOptions) -> Result<Self> {
        let host = options
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("caikit_embedding plugin requires plugin_options.host"))?;
        let port = options
            .port
            .ok_or_else(|| anyhow!("caikit_embedding plugin requires plugin_options.port"))?;
        let model_name = options
            .model_name
            .clone()
            .ok_or_else(|| anyhow!("caikit_embedding plugin requires plugin_options.model_name"))?;
        let task = match options.task.as_deref() {
            Some("embedding") | None => EmbeddingTask::Embedding,
            Some("sentence_similarity") => EmbeddingTask::SentenceSimilarity,
            Some("rerank") => EmbeddingTask::Rerank,
            Some(other) => {
                return Err(anyhow!("unsupported caikit_embedding task {other:?}"));
            }
        };

        let mut builder = Client::builder();
        if !options.use_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().context("failed to build reqwest client")?;

        Ok(Self {
            client,
            url: format!("{host}:{port}"),
            model_name,
            model_max_input_tokens: options.model_max_input_tokens,
            task,
        })
    }

    fn request_body(&self, query: &Query) -> Value {
        let parameters = json!({ "truncate_input_tokens": self.model_max_input_tokens });
        match self.task {
            EmbeddingTask::Embedding => json!({
                "model_id": self.model_name,
                "inputs": [query.text],
                "parameters": parameters,
            }),
            EmbeddingTask::SentenceSimilarity => json!({
                "model_id": self.model_name,
                "source_sentence": query.text,
                "sentences": [query.text],
                "parameters": parameters,
            }),
            EmbeddingTask::Rerank => json!({
                "model_id": self.model_name,
                "queries": [query.text],
                "documents": [{"text": query.text}],
                "parameters": parameters,
            }),
        }
    }
}

#[async_trait]
impl Adapter for CaikitEmbeddingAdapter {
    async fn execute(&self, query: &Query, user_id: usize, _deadline: f64) -> RequestResult {
        let mut result = RequestResult::new(user_id, query.input_id.clone(), query.input_tokens);

        let body = self.request_body(query);
        result.start_time = Some(now_secs());
        let response = self
            .client
            .post(format!("{}{}", self.url, self.task.endpoint()))
            .json(&body)
            .send()
            .await;
        result.end_time = Some(now_secs());

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<EmbeddingResponse>().await {
                    Ok(parsed) => {
                        if let Some(input_tokens) = parsed.input_token_count {
                            result.input_tokens = input_tokens;
                        }
                        // Embedding/similarity/rerank tasks produce no streamed
                        // output tokens; the uniform Result model still wants
                        // output_tokens populated so throughput math stays
                        // well-defined.
                        result.output_tokens = Some(0);
                        result.output_tokens_before_timeout = Some(0);
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
}
