//! Sends records through the transport cache and heals stale registrations.

use herald_common::error::AppError;
use herald_common::types::NotificationRecord;
use herald_notifier::{ErrorResponse, Notification, Transport, TransportFactory};

use crate::cache::{TransportCache, TypeRegistration};

/// What happened to a transport error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Not a registration problem, or nothing was sent yet
    Ignored,
    /// The last record was sent again after a cache clear
    Replayed,
    /// The last record already was a replay; not retried again
    Exhausted,
}

struct SentRecord {
    record: NotificationRecord,
    replay: bool,
}

pub struct Dispatcher<F: TransportFactory> {
    cache: TransportCache<F>,
    last_sent: Option<SentRecord>,
}

impl<F: TransportFactory> Dispatcher<F> {
    pub fn new(cache: TransportCache<F>) -> Self {
        Self {
            cache,
            last_sent: None,
        }
    }

    pub fn cache(&self) -> &TransportCache<F> {
        &self.cache
    }

    /// Send a freshly dequeued record.
    pub async fn dispatch(&mut self, record: NotificationRecord) -> Result<(), AppError> {
        self.send(record, false).await
    }

    /// React to an asynchronous error response from a transport.
    ///
    /// A stale application or type registration replays the last sent record once,
    /// with the whole cache cleared first. Errors from that replay are returned.
    pub async fn handle_error_response(
        &mut self,
        response: ErrorResponse,
    ) -> Result<Recovery, AppError> {
        tracing::info!(
            code = response.code,
            description = %response.description,
            in_response_to = response.in_response_to.as_deref().unwrap_or(""),
            "Notification response error"
        );

        if !response.is_registration_stale() {
            return Ok(Recovery::Ignored);
        }

        let Some(last) = &self.last_sent else {
            return Ok(Recovery::Ignored);
        };

        if last.replay {
            tracing::warn!(
                notification_id = %last.record.id,
                code = response.code,
                "Registration still stale after replay, giving up on this notification"
            );
            return Ok(Recovery::Exhausted);
        }

        let mut record = last.record.clone();
        record.clear_cache = true;

        tracing::info!(
            notification_id = %record.id,
            application = %record.application,
            "Re-registering after stale registration"
        );

        self.send(record, true).await?;
        Ok(Recovery::Replayed)
    }

    async fn send(&mut self, record: NotificationRecord, replay: bool) -> Result<(), AppError> {
        if record.clear_cache {
            self.cache.clear();
        }

        let resolved = self.cache.resolve(&record)?;

        // The transport needs the complete type list on every registration
        if resolved.registration == TypeRegistration::Changed {
            let types = resolved.application.types();
            resolved
                .transport
                .register(resolved.application.application(), &types)
                .await?;
        }

        resolved.transport.notify(Notification {
            id: record.id.to_string(),
            application: record.application.clone(),
            type_key: record.type_key(),
            title: record.title.clone(),
            message: record.message.clone(),
        })?;

        tracing::debug!(
            notification_id = %record.id,
            replay,
            "Sent notification: {}",
            record
        );

        self.last_sent = Some(SentRecord { record, replay });
        Ok(())
    }
}
