//! Scheduler: drives the Virtual Clients under one of the two load modes
//! until the test deadline, then hands the concatenated results to the
//! Aggregator (§4.4).

use std::time::Duration;

use tokio::sync::watch;

use crate::{
    adapters::now_secs,
    client::{ScheduledQuery, VirtualClient},
    config::{Config, LoadType, PluginOptions},
    dataset::Dataset,
    prelude::*,
    result::RequestResult,
    summary::{self, OutputDocument},
    ui::{ProgressConfig, Ui},
};

/// How close to a scheduled open-loop dispatch timestamp we sleep before
/// switching to a tight spin-wait (§4.4).
const OPEN_LOOP_SPIN_MARGIN: Duration = Duration::from_millis(30);

/// How often the closed-loop main loop polls the clock and tops up the
/// query queue.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one sweep point or the whole run: did it complete, or was it
/// cut short by an external interrupt?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Orchestrates an entire configured run, including concurrency sweeps.
pub struct Scheduler {
    config: Config,
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run every sweep point named by `load_options.concurrency`. `cancel`
    /// observes an external interrupt (e.g. Ctrl-C); once it fires, the
    /// current sweep point's in-flight requests are allowed to finish, its
    /// partial results are discarded, and no further sweep points run.
    #[instrument(level = "debug", skip_all)]
    pub async fn run(&self, ui: &Ui, cancel: watch::Receiver<bool>) -> Result<RunStatus> {
        for concurrency in self.config.load_options.concurrency.values() {
            info!(concurrency, "starting sweep point");
            let status = self.run_sweep_point(ui, concurrency, cancel.clone()).await?;
            if status == RunStatus::Cancelled {
                return Ok(RunStatus::Cancelled);
            }
        }
        Ok(RunStatus::Completed)
    }

    /// Run one sweep point (one concurrency value) to completion, writing
    /// its result file.
    async fn run_sweep_point(
        &self,
        ui: &Ui,
        concurrency: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunStatus> {
        let dataset = Dataset::load(&self.config.dataset).await?;

        let mut adapters = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            adapters.push(
                self.config
                    .plugin
                    .build(&self.config.plugin_options)
                    .await
                    .context("failed to construct protocol adapter")?,
            );
        }

        if let Some(warmup) = &self.config.warmup {
            self.run_warmup(&dataset, &self.config.plugin_options, warmup.requests, warmup.timeout_sec)
                .await;
        }

        let duration = self.config.load_options.duration;
        let spinner = ui.new_spinner(&ProgressConfig {
            emoji: "\u{1f4ca}",
            msg: "Running timed load test",
            done_msg: "Finished timed load test",
        });

        let (query_tx, query_rx) = async_channel::unbounded::<ScheduledQuery>();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(concurrency);
        let start = now_secs();
        let deadline = start + duration;
        for (user_id, adapter) in adapters.into_iter().enumerate() {
            let client = VirtualClient::new(user_id, adapter.into(), query_rx.clone(), stop_rx.clone());
            handles.push(tokio::spawn(client.run(deadline)));
        }
        drop(query_rx);

        let cancelled = match self.config.load_options.r#type {
            LoadType::Concurrency => {
                self.dispatch_closed_loop(&dataset, &query_tx, concurrency, start, duration, cancel)
                    .await
            }
            LoadType::Rate => {
                let rps = self
                    .config
                    .load_options
                    .rps
                    .expect("validated: rps required for rate mode");
                self.dispatch_open_loop(&dataset, &query_tx, rps, start, duration, cancel)
                    .await
            }
        };

        // Signal every client to stop after its current in-flight request,
        // then close the query queue so no more work is pulled.
        let _ = stop_tx.send(true);
        query_tx.close();

        let mut batches = Vec::with_capacity(handles.len());
        for handle in handles {
            batches.push(handle.await.context("virtual client task panicked")?);
        }
        spinner.finish_with_message("Finished timed load test");

        if cancelled {
            warn!("run interrupted; discarding partial results");
            return Ok(RunStatus::Cancelled);
        }

        let results: Vec<RequestResult> = batches.into_iter().flatten().collect();
        let summary = summary::summarize(&results, duration);
        info!(
            total_requests = summary.total_requests,
            total_failures = summary.total_failures,
            "sweep point complete"
        );

        self.write_output(concurrency, duration, results, summary)
            .await?;

        Ok(RunStatus::Completed)
    }

    /// Issue `requests` closed-loop warmup requests, sequentially, against a
    /// throwaway adapter instance. Logs a warning (but never fails the run)
    /// if any of them error, or if they don't finish within `timeout_sec`.
    async fn run_warmup(
        &self,
        dataset: &Dataset,
        plugin_options: &PluginOptions,
        requests: usize,
        timeout_sec: f64,
    ) {
        let adapter = match self.config.plugin.build(plugin_options).await {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!("warmup skipped: failed to build adapter: {err:#}");
                return;
            }
        };

        let warmup_future = async {
            let deadline = now_secs() + timeout_sec;
            let mut failures = 0usize;
            for query in dataset.next_n(requests) {
                let result = adapter.execute(&query, 0, deadline).await;
                if result.is_error() {
                    failures += 1;
                }
            }
            failures
        };

        match tokio::time::timeout(Duration::from_secs_f64(timeout_sec.max(0.0)), warmup_future).await
        {
            Ok(0) => info!("warmup completed with zero errors"),
            Ok(failures) => warn!("warmup saw {failures} failing requests out of {requests}"),
            Err(_) => warn!("warmup did not complete within {timeout_sec}s"),
        }
    }

    /// Closed-loop (concurrency-mode) dispatch: keeps the shared query queue
    /// topped up until the deadline, then returns whether the run was
    /// cancelled early.
    async fn dispatch_closed_loop(
        &self,
        dataset: &Dataset,
        query_tx: &async_channel::Sender<ScheduledQuery>,
        concurrency: usize,
        start: f64,
        duration: f64,
        mut cancel: watch::Receiver<bool>,
    ) -> bool {
        let low_water = concurrency.div_ceil(2) + 1;

        for query in dataset.next_n(2 * concurrency) {
            if query_tx
                .send(ScheduledQuery {
                    query,
                    scheduled_start_time: None,
                })
                .await
                .is_err()
            {
                return false;
            }
        }

        loop {
            if *cancel.borrow() {
                return true;
            }
            if now_secs() >= start + duration {
                return false;
            }
            if query_tx.len() < low_water {
                for query in dataset.next_n(concurrency) {
                    if query_tx
                        .send(ScheduledQuery {
                            query,
                            scheduled_start_time: None,
                        })
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    /// Open-loop (rate-limited mode) dispatch: computes a schedule of target
    /// timestamps spaced `1/rps` apart across `[start, start+duration)`, and
    /// dispatches one query per timestamp as closely as possible.
    async fn dispatch_open_loop(
        &self,
        dataset: &Dataset,
        query_tx: &async_channel::Sender<ScheduledQuery>,
        rps: f64,
        start: f64,
        duration: f64,
        mut cancel: watch::Receiver<bool>,
    ) -> bool {
        let interval = 1.0 / rps;
        let mut target = start;
        while target < start + duration {
            if *cancel.borrow() {
                return true;
            }

            let wait = target - now_secs() - OPEN_LOOP_SPIN_MARGIN.as_secs_f64();
            if wait > 0.0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
                    _ = cancel.changed() => {}
                }
                if *cancel.borrow() {
                    return true;
                }
            }
            // Spin until the target instant, for sub-millisecond accuracy.
            while now_secs() < target {
                tokio::task::yield_now().await;
            }

            let query = dataset.next_n(1).into_iter().next().expect("dataset non-empty");
            if query_tx
                .send(ScheduledQuery {
                    query,
                    scheduled_start_time: Some(target),
                })
                .await
                .is_err()
            {
                return false;
            }

            target += interval;
        }
        false
    }

    async fn write_output(
        &self,
        concurrency: usize,
        duration: f64,
        results: Vec<RequestResult>,
        summary: summary::Summary,
    ) -> Result<()> {
        let path = self.config.output.resolve_path(concurrency, duration);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create output directory {parent:?}"))?;
        }

        let config_json =
            serde_json::to_value(&self.config).context("failed to serialize configuration")?;
        let document = OutputDocument {
            config: config_json,
            results,
            summary,
        };
        let json = serde_json::to_string_pretty(&document)
            .context("failed to serialize output document")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write output file {path:?}"))?;
        info!(path = %path.display(), "wrote result file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{
        ConcurrencyValue, Config, DatasetConfig, LoadOptions, LoadType, OutputConfig,
        PluginOptions,
    };
    use crate::adapters::PluginKind;

    fn write_dataset(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("dataset.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"name": "meta"}}"#).unwrap();
        for i in 0..20 {
            writeln!(
                file,
                r#"{{"index": {i}, "question": "q{i}", "system_prompt": "", "tok_input_length": 10, "tok_output_length": 2}}"#
            )
            .unwrap();
        }
        path
    }

    fn base_config(dataset_file: PathBuf, out_dir: PathBuf) -> Config {
        Config {
            load_options: LoadOptions {
                r#type: LoadType::Concurrency,
                concurrency: ConcurrencyValue::Single(2),
                rps: None,
                duration: 0.5,
            },
            dataset: DatasetConfig {
                file: dataset_file,
                max_queries: None,
                min_input_tokens: None,
                max_input_tokens: None,
                min_output_tokens: None,
                max_output_tokens: None,
                max_sequence_tokens: None,
                custom_prompt_format: None,
            },
            plugin: PluginKind::Dummy,
            plugin_options: PluginOptions {
                streaming: false,
                dummy_response_time_ms: Some(5),
                ..Default::default()
            },
            output: OutputConfig {
                dir: out_dir,
                file: "result_{concurrency}_{duration}.json".to_owned(),
            },
            warmup: None,
        }
    }

    // S1: closed-loop dummy, writes a summary with zero failures.
    #[tokio::test]
    async fn closed_loop_sweep_writes_output_file() {
        let tmp = TempDir::new().unwrap();
        let dataset_file = write_dataset(tmp.path());
        let config = base_config(dataset_file, tmp.path().join("out"));
        let scheduler = Scheduler::new(config);

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let ui = Ui::init_for_tests();
        let status = scheduler.run(&ui, cancel_rx).await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        let path = tmp.path().join("out").join("result_2_0.5.json");
        let contents = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(doc["config"]["load_options"]["concurrency"], 2);
        assert_eq!(doc["summary"]["total_failures"], 0);
        assert!(doc["results"].as_array().unwrap().len() >= 1);
    }

    // S6: a concurrency sweep runs one sub-run per value, each with its own
    // output file carrying that value's concurrency in `config`.
    #[tokio::test]
    async fn concurrency_sweep_writes_one_file_per_value() {
        let tmp = TempDir::new().unwrap();
        let dataset_file = write_dataset(tmp.path());
        let mut config = base_config(dataset_file, tmp.path().join("out"));
        config.load_options.concurrency = ConcurrencyValue::Sweep(vec![1, 2]);
        let scheduler = Scheduler::new(config);

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let ui = Ui::init_for_tests();
        let status = scheduler.run(&ui, cancel_rx).await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        for concurrency in [1, 2] {
            let path = tmp
                .path()
                .join("out")
                .join(format!("result_{concurrency}_0.5.json"));
            let contents = std::fs::read_to_string(&path).unwrap();
            let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
            assert_eq!(doc["config"]["load_options"]["concurrency"], concurrency);
        }
    }

    // S3: open-loop dispatch spaces scheduled timestamps ~1/rps apart.
    #[tokio::test]
    async fn open_loop_dispatch_spaces_schedule_by_rps() {
        let tmp = TempDir::new().unwrap();
        let dataset_file = write_dataset(tmp.path());
        let mut config = base_config(dataset_file, tmp.path().join("out"));
        config.load_options.r#type = LoadType::Rate;
        config.load_options.rps = Some(20.0);
        config.load_options.duration = 0.3;
        let scheduler = Scheduler::new(config);

        let dataset = Dataset::load(&scheduler.config.dataset).await.unwrap();
        let (query_tx, query_rx) = async_channel::unbounded();
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let start = now_secs();
        scheduler
            .dispatch_open_loop(&dataset, &query_tx, 20.0, start, 0.3, cancel_rx)
            .await;
        query_tx.close();

        let mut scheduled: Vec<f64> = Vec::new();
        while let Ok(item) = query_rx.try_recv() {
            scheduled.push(item.scheduled_start_time.expect("open-loop sets schedule"));
        }
        assert!(scheduled.len() >= 4, "expected several scheduled dispatches, got {}", scheduled.len());
        for pair in scheduled.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((gap - 0.05).abs() < 1e-6, "expected ~0.05s spacing, got {gap}");
        }
    }
}
