//! In-memory queue and transport doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::NotificationRecord;
use herald_notifier::{
    Application, Endpoint, ErrorResponse, ErrorSink, Notification, NotificationType, Transport,
    TransportError, TransportFactory,
};

use crate::queue::NotificationSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect {
        connection: usize,
        endpoint: Endpoint,
    },
    Register {
        connection: usize,
        application: String,
        types: Vec<String>,
    },
    Notify {
        connection: usize,
        application: String,
        type_key: String,
        title: String,
    },
}

impl Call {
    pub fn is_connect(&self) -> bool {
        matches!(self, Call::Connect { .. })
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Call::Register { .. })
    }

    pub fn is_notify(&self) -> bool {
        matches!(self, Call::Notify { .. })
    }
}

/// Shared log of every transport call plus the error sinks handed out.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    sinks: Arc<Mutex<Vec<ErrorSink>>>,
    fail_register: Arc<AtomicBool>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    /// Report an error response through the most recently created connection.
    pub fn report(&self, code: u16) {
        let sinks = self.sinks.lock().unwrap();
        let sink = sinks.last().expect("no connection created yet");
        sink.report(ErrorResponse {
            code,
            description: "not registered".into(),
            in_response_to: None,
        });
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct MockFactory {
    recorder: Recorder,
    next_id: AtomicUsize,
}

impl MockFactory {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            next_id: AtomicUsize::new(0),
        }
    }
}

impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    fn connect(
        &self,
        endpoint: &Endpoint,
        errors: ErrorSink,
    ) -> Result<MockTransport, TransportError> {
        let connection = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.recorder.sinks.lock().unwrap().push(errors);
        self.recorder.push(Call::Connect {
            connection,
            endpoint: endpoint.clone(),
        });

        Ok(MockTransport {
            connection,
            recorder: self.recorder.clone(),
        })
    }
}

pub struct MockTransport {
    connection: usize,
    recorder: Recorder,
}

impl Transport for MockTransport {
    async fn register(
        &self,
        application: &Application,
        types: &[NotificationType],
    ) -> Result<(), TransportError> {
        if self.recorder.fail_register.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                code: 500,
                description: "register refused".into(),
            });
        }

        self.recorder.push(Call::Register {
            connection: self.connection,
            application: application.name.clone(),
            types: types.iter().map(|t| t.key.clone()).collect(),
        });
        Ok(())
    }

    fn notify(&self, notification: Notification) -> Result<(), TransportError> {
        self.recorder.push(Call::Notify {
            connection: self.connection,
            application: notification.application,
            type_key: notification.type_key,
            title: notification.title,
        });
        Ok(())
    }
}

/// Queue that replays a fixed script, then reports no work.
#[derive(Default)]
pub struct ScriptedQueue {
    script: VecDeque<Result<Option<NotificationRecord>, AppError>>,
    pub fetches: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl ScriptedQueue {
    pub fn new(script: Vec<Result<Option<NotificationRecord>, AppError>>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }
}

impl NotificationSource for ScriptedQueue {
    async fn fetch_next(&mut self) -> Result<Option<NotificationRecord>, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        // Never ready on first poll, so queued error responses are seen first
        tokio::task::yield_now().await;
        match self.script.pop_front() {
            Some(result) => result,
            None => {
                // Stand-in for the store-side long-poll
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Queue whose every fetch fails.
#[derive(Default)]
pub struct FailingQueue {
    pub fetches: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl NotificationSource for FailingQueue {
    async fn fetch_next(&mut self) -> Result<Option<NotificationRecord>, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Internal("store unavailable".into()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn record(application: &str, type_name: &str, title: &str) -> NotificationRecord {
    NotificationRecord {
        id: Uuid::new_v4(),
        application: application.into(),
        type_name: type_name.into(),
        title: title.into(),
        message: "Y".into(),
        icon: String::new(),
        password: String::new(),
        host: String::new(),
        port: 0,
        clear_cache: false,
    }
}
