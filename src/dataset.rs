//! Dataset Selector: loads, filters, shuffles, and round-robin dispenses
//! prompt records.

use std::sync::Mutex;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom as _};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt as _;

use crate::{config::DatasetConfig, prelude::*};

/// Fixed shuffle seed, so that two runs against the same dataset file and
/// filter parameters admit the same records in the same order (§8, property
/// 4).
const DATASET_SHUFFLE_SEED: u64 = 1337;

/// The minimum number of admitted records below which we warn (but do not
/// fail) the run.
const MIN_USABLE_QUERIES: usize = 4;

/// One line of the dataset file, after the metadata line.
#[derive(Debug, Deserialize)]
struct DatasetRecord {
    index: Value,
    question: String,
    #[serde(default)]
    system_prompt: String,
    tok_input_length: u32,
    tok_output_length: u32,
}

/// An immutable, fully-formatted prompt, ready to send to an adapter.
#[derive(Debug, Clone)]
pub struct Query {
    /// Identifier taken from the dataset record's `index` field.
    pub input_id: String,
    /// The fully-formatted prompt, after template substitution.
    pub text: String,
    /// Declared input token count.
    pub input_tokens: u32,
    /// Declared target output token count.
    pub output_tokens: u32,
}

/// Default prompt template, used when `dataset.custom_prompt_format` is
/// absent.
const DEFAULT_PROMPT_TEMPLATE: &str = "{prompt}";

/// Substitute `{prompt}` and `{system_prompt}` into a template string.
fn render_template(template: &str, prompt: &str, system_prompt: &str) -> String {
    template
        .replace("{prompt}", prompt)
        .replace("{system_prompt}", system_prompt)
}

/// Load and filter the dataset file named in `config`, returning the admitted
/// [`Query`] records in file order (the caller is responsible for shuffling,
/// via [`Dataset::new`]).
async fn load_filtered_queries(config: &DatasetConfig) -> Result<Vec<Query>> {
    let file = tokio::fs::File::open(&config.file)
        .await
        .with_context(|| format!("failed to open dataset file {:?}", config.file))?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    // The first line is a metadata object, ignored for query purposes.
    lines
        .next_line()
        .await
        .context("failed to read dataset metadata line")?
        .ok_or_else(|| anyhow!("dataset file {:?} is empty", config.file))?;

    let template = config
        .custom_prompt_format
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT_TEMPLATE);

    let mut admitted = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read dataset line")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let record: DatasetRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!("skipping malformed dataset line: {err}");
                continue;
            }
        };

        let input_tokens = record.tok_input_length;
        let output_tokens = record.tok_output_length;

        if let Some(min_input) = config.min_input_tokens {
            if !(min_input < input_tokens) {
                continue;
            }
        }
        if let Some(max_input) = config.max_input_tokens {
            if !(input_tokens < max_input) {
                continue;
            }
        }
        if let Some(min_output) = config.min_output_tokens {
            if !(min_output < output_tokens) {
                continue;
            }
        }
        if let Some(max_output) = config.max_output_tokens {
            if !(output_tokens < max_output) {
                continue;
            }
        }
        if let Some(max_sequence) = config.max_sequence_tokens {
            if !(input_tokens + output_tokens < max_sequence) {
                continue;
            }
        }

        let input_id = match &record.index {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let text = render_template(template, &record.question, &record.system_prompt);
        admitted.push(Query {
            input_id,
            text,
            input_tokens,
            output_tokens,
        });

        if let Some(max_queries) = config.max_queries {
            if admitted.len() >= max_queries {
                break;
            }
        }
    }

    Ok(admitted)
}

/// Ordered, shuffled, round-robin sequence of admitted queries.
///
/// Loaded once at startup and immutable thereafter, except for the internal
/// cursor advanced by [`Dataset::next_n`].
pub struct Dataset {
    queries: Vec<Query>,
    cursor: Mutex<usize>,
}

impl Dataset {
    /// Load, filter, and shuffle the dataset named in `config`.
    ///
    /// Fails with a hard [`anyhow::Error`] if the file can't be read at all;
    /// logs a warning (but still succeeds) if fewer than
    /// [`MIN_USABLE_QUERIES`] records remain after filtering.
    pub async fn load(config: &DatasetConfig) -> Result<Self> {
        let mut queries = load_filtered_queries(config).await?;

        let mut rng = StdRng::seed_from_u64(DATASET_SHUFFLE_SEED);
        queries.shuffle(&mut rng);

        if queries.len() < MIN_USABLE_QUERIES {
            warn!(
                "only {} usable queries admitted after filtering (fewer than the recommended minimum of {}); continuing anyway",
                queries.len(),
                MIN_USABLE_QUERIES
            );
        }
        if queries.is_empty() {
            return Err(anyhow!(
                "no usable queries in dataset {:?} after filtering",
                config.file
            ));
        }

        Ok(Self {
            queries,
            cursor: Mutex::new(0),
        })
    }

    /// Number of admitted records.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Return the next `n` queries in round-robin order, advancing the
    /// cursor modulo the admitted set's size.
    pub fn next_n(&self, n: usize) -> Vec<Query> {
        let len = self.queries.len();
        let mut cursor = self.cursor.lock().expect("dataset cursor lock poisoned");
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.queries[(*cursor + i) % len].clone());
        }
        *cursor = (*cursor + n) % len;
        out
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    async fn write_dataset(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn base_config(path: PathBuf) -> DatasetConfig {
        DatasetConfig {
            file: path,
            max_queries: None,
            min_input_tokens: None,
            max_input_tokens: None,
            min_output_tokens: None,
            max_output_tokens: None,
            max_sequence_tokens: None,
            custom_prompt_format: None,
        }
    }

    #[tokio::test]
    async fn filters_by_input_token_bounds() {
        // S5: 5 records with input_tokens 10,20,30,40,50; filter
        // min_input=15, max_input=45 admits exactly 20, 30, 40.
        let file = write_dataset(&[
            r#"{"name": "meta"}"#,
            r#"{"index": 0, "question": "a", "system_prompt": "", "tok_input_length": 10, "tok_output_length": 5}"#,
            r#"{"index": 1, "question": "b", "system_prompt": "", "tok_input_length": 20, "tok_output_length": 5}"#,
            r#"{"index": 2, "question": "c", "system_prompt": "", "tok_input_length": 30, "tok_output_length": 5}"#,
            r#"{"index": 3, "question": "d", "system_prompt": "", "tok_input_length": 40, "tok_output_length": 5}"#,
            r#"{"index": 4, "question": "e", "system_prompt": "", "tok_input_length": 50, "tok_output_length": 5}"#,
        ])
        .await;

        let mut config = base_config(file.path().to_owned());
        config.min_input_tokens = Some(15);
        config.max_input_tokens = Some(45);

        let admitted = load_filtered_queries(&config).await.unwrap();
        let mut input_tokens: Vec<u32> = admitted.iter().map(|q| q.input_tokens).collect();
        input_tokens.sort_unstable();
        assert_eq!(input_tokens, vec![20, 30, 40]);
    }

    #[tokio::test]
    async fn skips_malformed_lines() {
        let file = write_dataset(&[
            r#"{"name": "meta"}"#,
            "not json at all",
            r#"{"index": 0, "question": "a", "system_prompt": "", "tok_input_length": 10, "tok_output_length": 5}"#,
        ])
        .await;
        let config = base_config(file.path().to_owned());
        let admitted = load_filtered_queries(&config).await.unwrap();
        assert_eq!(admitted.len(), 1);
    }

    #[tokio::test]
    async fn shuffle_is_deterministic() {
        let lines: Vec<String> = (0..20)
            .map(|i| {
                format!(
                    r#"{{"index": {i}, "question": "q{i}", "system_prompt": "", "tok_input_length": 10, "tok_output_length": 5}}"#
                )
            })
            .collect();
        let mut all = vec![r#"{"name": "meta"}"#.to_owned()];
        all.extend(lines);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let file = write_dataset(&refs).await;
        let config = base_config(file.path().to_owned());

        let a = Dataset::load(&config).await.unwrap();
        let b = Dataset::load(&config).await.unwrap();
        let ids_a: Vec<String> = a.next_n(20).into_iter().map(|q| q.input_id).collect();
        let ids_b: Vec<String> = b.next_n(20).into_iter().map(|q| q.input_id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn next_n_wraps_round_robin() {
        let file = write_dataset(&[
            r#"{"name": "meta"}"#,
            r#"{"index": 0, "question": "a", "system_prompt": "", "tok_input_length": 10, "tok_output_length": 5}"#,
            r#"{"index": 1, "question": "b", "system_prompt": "", "tok_input_length": 10, "tok_output_length": 5}"#,
        ])
        .await;
        let config = base_config(file.path().to_owned());
        let dataset = Dataset::load(&config).await.unwrap();
        assert_eq!(dataset.len(), 2);

        let first = dataset.next_n(3);
        assert_eq!(first.len(), 3);
        // Third element should wrap back to the first query in the shuffled order.
        assert_eq!(first[0].input_id, first[2].input_id);
    }

    #[tokio::test]
    async fn too_few_queries_errors() {
        let file = write_dataset(&[r#"{"name": "meta"}"#]).await;
        let config = base_config(file.path().to_owned());
        assert!(Dataset::load(&config).await.is_err());
    }
}
