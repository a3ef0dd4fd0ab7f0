//! Virtual Client: a long-lived worker that repeatedly pulls work, invokes
//! its adapter, and accumulates results into a local batch (§4.3).

use std::sync::Arc;

use tokio::sync::watch;

use crate::{adapters::Adapter, dataset::Query, prelude::*, result::RequestResult};

/// One item of work handed to a client: the query to run, and (in
/// rate-limited mode) the timestamp it was scheduled to start at.
#[derive(Debug, Clone)]
pub struct ScheduledQuery {
    pub query: Query,
    pub scheduled_start_time: Option<f64>,
}

/// A long-lived worker holding its own adapter instance. Pulls work from a
/// shared `async-channel` queue until the stop signal fires, then sends its
/// entire local batch to the aggregator and exits.
pub struct VirtualClient {
    pub user_id: usize,
    adapter: Arc<dyn Adapter>,
    inbound: async_channel::Receiver<ScheduledQuery>,
    stop_signal: watch::Receiver<bool>,
}

impl VirtualClient {
    pub fn new(
        user_id: usize,
        adapter: Arc<dyn Adapter>,
        inbound: async_channel::Receiver<ScheduledQuery>,
        stop_signal: watch::Receiver<bool>,
    ) -> Self {
        Self {
            user_id,
            adapter,
            inbound,
            stop_signal,
        }
    }

    /// Run until the stop signal fires or the inbound queue is closed and
    /// drained, returning this client's batch of results.
    ///
    /// Within a single client, results appear in the order requests
    /// completed — strictly monotone in `start_time` — because each request
    /// is awaited to completion before the next is pulled (§5, ordering
    /// guarantees).
    pub async fn run(mut self, deadline: f64) -> Vec<RequestResult> {
        let mut batch = Vec::new();
        loop {
            if *self.stop_signal.borrow() {
                break;
            }

            let item = tokio::select! {
                biased;
                _ = self.stop_signal.changed() => None,
                item = self.inbound.recv() => item.ok(),
            };
            let Some(item) = item else { break };

            let mut result = self.adapter.execute(&item.query, self.user_id, deadline).await;
            result.scheduled_start_time = item.scheduled_start_time;
            batch.push(result);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use crate::adapters::dummy::DummyAdapter;
    use crate::config::PluginOptions;

    use super::*;

    fn query(id: &str) -> Query {
        Query {
            input_id: id.to_owned(),
            text: "hi".to_owned(),
            input_tokens: 3,
            output_tokens: 2,
        }
    }

    #[tokio::test]
    async fn client_stops_on_signal_and_preserves_order() {
        let (tx, rx) = async_channel::unbounded();
        let (stop_tx, stop_rx) = watch::channel(false);
        let adapter: Arc<dyn Adapter> = Arc::new(DummyAdapter::new(&PluginOptions {
            dummy_response_time_ms: Some(1),
            ..Default::default()
        }));
        let client = VirtualClient::new(7, adapter, rx, stop_rx);

        for i in 0..5 {
            tx.send(ScheduledQuery {
                query: query(&i.to_string()),
                scheduled_start_time: None,
            })
            .await
            .unwrap();
        }

        let handle = tokio::spawn(client.run(crate::adapters::now_secs() + 60.0));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();
        let batch = handle.await.unwrap();

        assert!(!batch.is_empty());
        for pair in batch.windows(2) {
            assert!(pair[0].start_time <= pair[1].start_time);
        }
        assert!(batch.iter().all(|r| r.user_id == 7));
    }
}
