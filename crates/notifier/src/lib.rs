//! Downstream push-notification transport boundary.
//!
//! The relay talks to the transport only through [`TransportFactory`] and
//! [`Transport`]. Registration and notification are requests; failures reported
//! later by the transport arrive as [`ErrorResponse`]s through the [`ErrorSink`]
//! handed to each connection when it is created.

pub mod http;

use std::future::Future;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use herald_common::error::AppError;
use herald_common::types::NotificationRecord;

pub use http::{HttpTransport, HttpTransportFactory};

/// Error code reported when the application is not registered.
pub const APPLICATION_NOT_REGISTERED: u16 = 401;

/// Error code reported when the notification type is not registered.
pub const NOTIFICATION_TYPE_NOT_REGISTERED: u16 = 402;

/// Capacity of the error response channel between transports and the worker.
pub const ERROR_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport rejected request ({code}): {description}")]
    Rejected { code: u16, description: String },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Where a connection points to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Default endpoint, no credential
    Default,
    /// Default endpoint with a credential
    Local { password: String },
    /// Explicit host and port with a credential
    Remote {
        password: String,
        host: String,
        port: u16,
    },
}

impl Endpoint {
    /// Pick the endpoint a record asks for.
    ///
    /// Host and port are only honoured together with a password.
    pub fn for_record(record: &NotificationRecord) -> Self {
        if record.password.is_empty() {
            return Endpoint::Default;
        }

        match u16::try_from(record.port) {
            Ok(port) if port > 0 && !record.host.is_empty() => Endpoint::Remote {
                password: record.password.clone(),
                host: record.host.clone(),
                port,
            },
            _ => Endpoint::Local {
                password: record.password.clone(),
            },
        }
    }

    pub fn password(&self) -> Option<&str> {
        match self {
            Endpoint::Default => None,
            Endpoint::Local { password } | Endpoint::Remote { password, .. } => {
                Some(password.as_str())
            }
        }
    }
}

/// Application descriptor as registered with the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Application {
    pub name: String,
    /// `file://` URI of the icon, if one was found on disk
    pub icon: Option<String>,
}

/// Notification type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationType {
    pub key: String,
    pub display_name: String,
}

/// A single outbound notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub application: String,
    pub type_key: String,
    pub title: String,
    pub message: String,
}

/// Asynchronous error reported by the transport after a request was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u16,
    pub description: String,
    pub in_response_to: Option<String>,
}

impl ErrorResponse {
    /// Whether the transport forgot our application or one of its types.
    pub fn is_registration_stale(&self) -> bool {
        matches!(
            self.code,
            APPLICATION_NOT_REGISTERED | NOTIFICATION_TYPE_NOT_REGISTERED
        )
    }
}

/// Sending half of the error response channel.
///
/// Transports call [`ErrorSink::report`] from their own tasks; the worker owns the
/// receiving half and handles responses on its own context.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<ErrorResponse>,
}

impl ErrorSink {
    /// Create a bounded error channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ErrorResponse>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Forward an error response to the worker. Never blocks; drops on overflow.
    pub fn report(&self, response: ErrorResponse) {
        match self.tx.try_send(response) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(response)) => {
                tracing::warn!(
                    code = response.code,
                    description = %response.description,
                    "Error response channel full, dropping response"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Error response channel closed");
            }
        }
    }
}

/// A live connection to the push transport.
pub trait Transport: Send + Sync {
    /// Register an application with its complete list of notification types.
    fn register(
        &self,
        application: &Application,
        types: &[NotificationType],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send a notification without waiting for the outcome.
    ///
    /// Failures the transport reports later go to the connection's [`ErrorSink`].
    fn notify(&self, notification: Notification) -> Result<(), TransportError>;
}

/// Creates transport connections.
pub trait TransportFactory: Send + 'static {
    type Transport: Transport + 'static;

    /// Open a connection. `errors` receives every asynchronous error response
    /// of the new connection.
    fn connect(
        &self,
        endpoint: &Endpoint,
        errors: ErrorSink,
    ) -> Result<Self::Transport, TransportError>;
}
