//! Start/stop lifecycle for the polling worker.

use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use herald_common::config::AppConfig;
use herald_notifier::TransportFactory;

use crate::poller::NotificationPoller;
use crate::queue::NotificationSource;

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Hosts one polling worker. `start` and `stop` are serialized by a single lock.
pub struct RelayService {
    config: AppConfig,
    worker: Mutex<Option<Worker>>,
}

impl RelayService {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the polling worker. Does nothing if it is already running.
    pub async fn start<Q, F>(&self, queue: Q, factory: F)
    where
        Q: NotificationSource + 'static,
        F: TransportFactory,
    {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::warn!("Relay already running");
            return;
        }

        tracing::debug!("Starting...");

        let (stop, stop_rx) = watch::channel(false);
        let poller = NotificationPoller::from_config(queue, factory, &self.config, stop_rx);
        let handle = tokio::spawn(poller.run());

        *worker = Some(Worker { stop, handle });
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            procedure = %self.config.dequeue_procedure,
            "Relay started"
        );
    }

    /// Raise the stop signal and wait for the worker, aborting it after the stop timeout.
    ///
    /// The worker only sees the signal between store calls, and a store call may
    /// long-poll for up to `poll_interval_secs + 30` seconds. With a stop timeout shorter
    /// than that (the defaults are 60 and 10), stopping an idle relay usually ends in an
    /// abort: the store connection is dropped without a graceful close and the server
    /// rolls back the open transaction. Set `STOP_TIMEOUT_SECS` above the long-poll to
    /// always stop gracefully.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Some(Worker { stop, mut handle }) = worker.take() else {
            tracing::debug!("Relay not running");
            return;
        };

        tracing::debug!("Stopping...");
        // The worker may already be gone; nothing to signal then
        let _ = stop.send(true);

        let timeout = Duration::from_secs(self.config.stop_timeout_secs);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => tracing::info!("Relay stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Relay worker ended abnormally"),
            Err(_) => {
                handle.abort();
                tracing::info!(timeout_secs = timeout.as_secs(), "Forced relay stop");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }
}
