use std::time::Duration;

use tokio::sync::{mpsc, watch};

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_notifier::{ERROR_CHANNEL_CAPACITY, ErrorResponse, ErrorSink, TransportFactory};

use crate::cache::TransportCache;
use crate::dispatch::Dispatcher;
use crate::icons::IconResolver;
use crate::queue::NotificationSource;

/// Escalating wait after consecutive failed iterations.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max_steps: u32,
    consecutive_errors: u32,
}

impl Backoff {
    pub fn new(step: Duration, max_steps: u32) -> Self {
        Self {
            step,
            max_steps,
            consecutive_errors: 0,
        }
    }

    /// Count one more failure and return how long to wait before the next poll.
    pub fn record_failure(&mut self) -> Duration {
        if self.consecutive_errors < self.max_steps {
            self.consecutive_errors += 1;
        }
        self.delay()
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn delay(&self) -> Duration {
        self.step * self.consecutive_errors
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

/// Result of one successful loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Dispatched,
    Idle,
}

/// Notification poller that continuously dequeues records and relays them.
pub struct NotificationPoller<Q, F: TransportFactory> {
    queue: Q,
    dispatcher: Dispatcher<F>,
    responses: mpsc::Receiver<ErrorResponse>,
    backoff: Backoff,
    stop: watch::Receiver<bool>,
}

impl<Q: NotificationSource, F: TransportFactory> NotificationPoller<Q, F> {
    pub fn new(
        queue: Q,
        dispatcher: Dispatcher<F>,
        responses: mpsc::Receiver<ErrorResponse>,
        backoff: Backoff,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            responses,
            backoff,
            stop,
        }
    }

    /// Wire a poller from configuration: error channel, transport cache and backoff.
    pub fn from_config(
        queue: Q,
        factory: F,
        config: &AppConfig,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (errors, responses) = ErrorSink::channel(ERROR_CHANNEL_CAPACITY);
        let icons = IconResolver::new(config.icons_dir.clone(), config.default_icon.clone());
        let dispatcher = Dispatcher::new(TransportCache::new(factory, errors, icons));
        let backoff = Backoff::new(
            Duration::from_secs(config.backoff_step_secs),
            config.max_backoff_steps,
        );

        Self::new(queue, dispatcher, responses, backoff, stop)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.backoff.consecutive_errors()
    }

    pub fn dispatcher(&self) -> &Dispatcher<F> {
        &self.dispatcher
    }

    /// Run the polling loop until the stop signal is raised.
    ///
    /// No single failed iteration ends the loop; failures only lengthen the wait
    /// before the next poll. The store connection is closed on the way out.
    pub async fn run(mut self) {
        tracing::info!("Notification poller started");

        while !*self.stop.borrow() {
            if let Err(e) = self.poll_once().await {
                let delay = self.record_failure(&e);
                if wait_or_stop(delay, &mut self.stop).await {
                    break;
                }
            }
        }

        tracing::debug!("Requested to stop");
        self.queue.close().await;
        tracing::info!("Notification poller stopped");
    }

    /// One iteration: dequeue, then dispatch whatever came back.
    ///
    /// Transport error responses that arrive while the store call is in flight
    /// are handled here too; the store call itself is never interrupted.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, AppError> {
        let mut recovery_error = None;

        let fetched = {
            let fetch = self.queue.fetch_next();
            tokio::pin!(fetch);

            loop {
                tokio::select! {
                    result = &mut fetch => break result,
                    Some(response) = self.responses.recv() => {
                        if let Err(e) = self.dispatcher.handle_error_response(response).await {
                            recovery_error = Some(e);
                        }
                    }
                }
            }
        };

        let record = match fetched {
            Ok(record) => record,
            Err(e) => {
                log_recovery_failure(recovery_error);
                return Err(e);
            }
        };

        self.backoff.reset();

        let outcome = match record {
            Some(record) => {
                tracing::debug!(notification_id = %record.id, "Received notification");
                if let Err(e) = self.dispatcher.dispatch(record).await {
                    log_recovery_failure(recovery_error);
                    return Err(e);
                }
                PollOutcome::Dispatched
            }
            // The store-side long-poll already absorbed the wait
            None => PollOutcome::Idle,
        };

        match recovery_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Count a failed iteration and return the wait before the next one.
    pub fn record_failure(&mut self, error: &AppError) -> Duration {
        let delay = self.backoff.record_failure();
        tracing::warn!(
            error = %error,
            consecutive_errors = self.backoff.consecutive_errors(),
            delay_secs = delay.as_secs(),
            "Poll error"
        );
        delay
    }
}

/// Log a recovery failure that is superseded by the iteration's own error.
fn log_recovery_failure(error: Option<AppError>) {
    if let Some(e) = error {
        tracing::warn!(error = %e, "Re-notify after stale registration failed");
    }
}

/// Sleep for `delay` unless the stop signal arrives first. Returns `true` on stop.
pub async fn wait_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop_signalled(stop) => true,
    }
}

async fn stop_signalled(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            // Controller dropped
            return;
        }
    }
}
