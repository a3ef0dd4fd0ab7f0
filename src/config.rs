//! Configuration document parsing (§6).
//!
//! The whole document is a declarative YAML file, matching the Python
//! original's `yaml.safe_load` + `config.yaml` default. We parse it once at
//! startup with `serde_yaml` into a typed [`Config`], and any missing or
//! nonsensical setting becomes a `ConfigurationError`-flavored [`anyhow::Error`]
//! raised before any worker starts.

use crate::{adapters::PluginKind, prelude::*};

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub load_options: LoadOptions,
    pub dataset: DatasetConfig,
    pub plugin: PluginKind,
    #[serde(default)]
    pub plugin_options: PluginOptions,
    pub output: OutputConfig,
    #[serde(default)]
    pub warmup: Option<WarmupConfig>,
}

/// One concurrency value, or a sweep over several.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConcurrencyValue {
    Single(usize),
    Sweep(Vec<usize>),
}

impl ConcurrencyValue {
    /// Expand to the list of concurrency values to sweep over (a
    /// single-element list for a scalar configuration).
    pub fn values(&self) -> Vec<usize> {
        match self {
            ConcurrencyValue::Single(n) => vec![*n],
            ConcurrencyValue::Sweep(values) => values.clone(),
        }
    }
}

/// Load generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
    Concurrency,
    Rate,
}

/// `load_options` section: how load is generated and for how long.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadOptions {
    pub r#type: LoadType,
    pub concurrency: ConcurrencyValue,
    #[serde(default)]
    pub rps: Option<f64>,
    pub duration: f64,
}

/// `dataset` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    pub file: PathBuf,
    #[serde(default)]
    pub max_queries: Option<usize>,
    #[serde(default)]
    pub min_input_tokens: Option<u32>,
    #[serde(default)]
    pub max_input_tokens: Option<u32>,
    #[serde(default)]
    pub min_output_tokens: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub max_sequence_tokens: Option<u32>,
    #[serde(default)]
    pub custom_prompt_format: Option<String>,
}

/// Which completion API shape an OpenAI-compatible backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenAiApi {
    Legacy,
    Chat,
}

/// `plugin_options` section. Only a subset of fields is meaningful for any
/// given `plugin`; see each adapter's `from_config` for which ones it reads.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginOptions {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub api: Option<OpenAiApi>,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// Caikit transport selector: `"http"` or `"grpc"`.
    #[serde(default)]
    pub interface: Option<String>,
    /// Caikit embedding task selector: `"embedding"`, `"sentence_similarity"`,
    /// or `"rerank"`.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub model_max_input_tokens: Option<u32>,
    /// Synthetic response delay, in milliseconds, for the `dummy` plugin.
    #[serde(default)]
    pub dummy_response_time_ms: Option<u64>,
    /// Synthetic inter-token delay, in milliseconds, for the streaming
    /// `dummy` plugin.
    #[serde(default)]
    pub dummy_inter_token_delay_ms: Option<u64>,
}

/// `output` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// May contain the `{concurrency}` and `{duration}` placeholders.
    pub file: String,
}

impl OutputConfig {
    /// Resolve the `{concurrency}`/`{duration}` placeholders in `file` for
    /// one sweep point, returning the full output path.
    pub fn resolve_path(&self, concurrency: usize, duration: f64) -> PathBuf {
        let file = self
            .file
            .replace("{concurrency}", &concurrency.to_string())
            .replace("{duration}", &duration.to_string());
        self.dir.join(file)
    }
}

/// Optional `warmup` section: a short pre-test that must see zero errors
/// before the timed window opens.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarmupConfig {
    pub requests: usize,
    pub timeout_sec: f64,
}

impl Config {
    /// Parse a configuration document from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(text).context("failed to parse configuration YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a configuration document from a file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read configuration file {path:?}"))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("invalid configuration in {path:?}"))
    }

    /// Reject configurations that are syntactically valid YAML but
    /// nonsensical, so the error surfaces before any worker is spawned.
    fn validate(&self) -> Result<()> {
        if self.load_options.duration <= 0.0 {
            return Err(anyhow!("load_options.duration must be positive"));
        }
        for concurrency in self.load_options.concurrency.values() {
            if concurrency == 0 {
                return Err(anyhow!("load_options.concurrency must be positive"));
            }
        }
        match self.load_options.r#type {
            LoadType::Rate => {
                let rps = self
                    .load_options
                    .rps
                    .ok_or_else(|| anyhow!("load_options.rps is required for rate mode"))?;
                if rps <= 0.0 {
                    return Err(anyhow!("load_options.rps must be positive"));
                }
            }
            LoadType::Concurrency => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
load_options:
  type: concurrency
  concurrency: 4
  duration: 10
dataset:
  file: dataset.jsonl
plugin: dummy
plugin_options:
  streaming: true
output:
  dir: out
  file: "result_{concurrency}_{duration}.json"
"#;

    #[test]
    fn parses_minimal_config() {
        let config = Config::from_yaml_str(MINIMAL_YAML).unwrap();
        assert_eq!(config.load_options.duration, 10.0);
        assert_eq!(config.load_options.concurrency.values(), vec![4]);
        assert!(matches!(config.plugin, PluginKind::Dummy));
    }

    #[test]
    fn parses_concurrency_sweep() {
        let yaml = MINIMAL_YAML.replace("concurrency: 4", "concurrency: [1, 4]");
        let config = Config::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.load_options.concurrency.values(), vec![1, 4]);
    }

    #[test]
    fn rejects_zero_duration() {
        let yaml = MINIMAL_YAML.replace("duration: 10", "duration: 0");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn rate_mode_requires_rps() {
        let yaml = MINIMAL_YAML.replace("type: concurrency", "type: rate");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn resolves_output_placeholders() {
        let config = Config::from_yaml_str(MINIMAL_YAML).unwrap();
        let path = config.output.resolve_path(4, 10.0);
        assert_eq!(path, PathBuf::from("out/result_4_10.json"));
    }
}
