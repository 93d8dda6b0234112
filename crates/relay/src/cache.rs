//! Transport object cache.
//!
//! Connections are keyed by the record's connector key, applications by name
//! within a connection, and notification types by normalized key within an
//! application. Everything is created lazily and only ever dropped as a whole.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use herald_common::types::NotificationRecord;
use herald_notifier::{
    Application, Endpoint, ErrorSink, NotificationType, TransportError, TransportFactory,
};

use crate::icons::IconResolver;

/// Outcome of adding a record's type to an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRegistration {
    /// The type was new; the application must be registered again.
    Changed,
    Unchanged,
}

/// One cached application and its accumulated notification types.
#[derive(Debug, Clone)]
pub struct ApplicationEntry {
    application: Application,
    types: BTreeMap<String, NotificationType>,
}

impl ApplicationEntry {
    pub fn new(name: impl Into<String>, icon: Option<String>) -> Self {
        Self {
            application: Application {
                name: name.into(),
                icon,
            },
            types: BTreeMap::new(),
        }
    }

    pub fn application(&self) -> &Application {
        &self.application
    }

    /// Full type list, as the transport expects it on every registration.
    pub fn types(&self) -> Vec<NotificationType> {
        self.types.values().cloned().collect()
    }

    /// Add the record's type unless it is already known.
    pub fn register_type(&mut self, record: &NotificationRecord) -> TypeRegistration {
        let key = record.type_key();
        if self.types.contains_key(&key) {
            return TypeRegistration::Unchanged;
        }

        self.types.insert(
            key.clone(),
            NotificationType {
                key,
                display_name: record.type_name.clone(),
            },
        );
        TypeRegistration::Changed
    }
}

/// One transport connection and the applications registered through it.
pub struct ConnectorEntry<T> {
    pub transport: T,
    applications: HashMap<String, ApplicationEntry>,
}

impl<T> ConnectorEntry<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            applications: HashMap::new(),
        }
    }

    pub fn application_count(&self) -> usize {
        self.applications.len()
    }

    /// Look up the record's application, creating it with its icon on first use.
    pub fn resolve_application(
        &mut self,
        record: &NotificationRecord,
        icons: &IconResolver,
    ) -> &mut ApplicationEntry {
        resolve_application(&mut self.applications, record, icons)
    }
}

fn resolve_application<'a>(
    applications: &'a mut HashMap<String, ApplicationEntry>,
    record: &NotificationRecord,
    icons: &IconResolver,
) -> &'a mut ApplicationEntry {
    applications
        .entry(record.application.clone())
        .or_insert_with(|| {
            let icon = icons.resolve(record.icon_file().as_deref());
            tracing::debug!(
                application = %record.application,
                has_icon = icon.is_some(),
                "Caching application"
            );
            ApplicationEntry::new(record.application.clone(), icon)
        })
}

/// Everything needed to send one record.
pub struct Resolved<'a, T> {
    pub transport: &'a T,
    pub application: &'a ApplicationEntry,
    pub registration: TypeRegistration,
}

/// Keyed registry of transport connections.
pub struct TransportCache<F: TransportFactory> {
    factory: F,
    errors: ErrorSink,
    icons: IconResolver,
    connectors: HashMap<String, ConnectorEntry<F::Transport>>,
}

impl<F: TransportFactory> TransportCache<F> {
    /// `errors` is handed to every connection the cache opens.
    pub fn new(factory: F, errors: ErrorSink, icons: IconResolver) -> Self {
        Self {
            factory,
            errors,
            icons,
            connectors: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Drop every connection, application and type. Later resolves rebuild lazily.
    pub fn clear(&mut self) {
        let dropped = self.connectors.len();
        self.connectors.clear();
        tracing::info!(connectors = dropped, "Cleared cached transport objects");
    }

    /// Look up the record's connection, opening it on first use.
    pub fn resolve_connector(
        &mut self,
        record: &NotificationRecord,
    ) -> Result<&mut ConnectorEntry<F::Transport>, TransportError> {
        match self.connectors.entry(record.connector_key()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let endpoint = Endpoint::for_record(record);
                let transport = self.factory.connect(&endpoint, self.errors.clone())?;
                tracing::debug!(
                    application = %record.application,
                    remote = matches!(endpoint, Endpoint::Remote { .. }),
                    "Caching transport connection"
                );
                Ok(entry.insert(ConnectorEntry::new(transport)))
            }
        }
    }

    /// Resolve connection and application for a record and add its type.
    pub fn resolve(
        &mut self,
        record: &NotificationRecord,
    ) -> Result<Resolved<'_, F::Transport>, TransportError> {
        let icons = self.icons.clone();
        let ConnectorEntry {
            transport,
            applications,
        } = self.resolve_connector(record)?;

        let application = resolve_application(applications, record, &icons);
        let registration = application.register_type(record);

        Ok(Resolved {
            transport,
            application,
            registration,
        })
    }
}
