use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// One notification request claimed from the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Identifier assigned by the queue store, used for tracing only
    pub id: Uuid,
    pub application: String,
    pub type_name: String,
    pub title: String,
    pub message: String,
    /// Icon name without extension; empty when not set
    pub icon: String,
    /// Transport credential; empty selects the default endpoint
    pub password: String,
    pub host: String,
    /// Transport port; 0 when absent or unparsable
    pub port: i32,
    /// Discard every cached transport object before this record is sent
    pub clear_cache: bool,
}

/// Child elements of the payload root the relay reads. Anything else is skipped.
#[derive(Debug, Default)]
struct NotificationPayload {
    application: Option<String>,
    r#type: Option<String>,
    title: Option<String>,
    message: Option<String>,
    icon: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<String>,
    clear_cached_objects: Option<String>,
}

impl NotificationPayload {
    fn slot(&mut self, element: &[u8]) -> Option<&mut Option<String>> {
        match element {
            b"Application" => Some(&mut self.application),
            b"Type" => Some(&mut self.r#type),
            b"Title" => Some(&mut self.title),
            b"Message" => Some(&mut self.message),
            b"Icon" => Some(&mut self.icon),
            b"Password" => Some(&mut self.password),
            b"Host" => Some(&mut self.host),
            b"Port" => Some(&mut self.port),
            b"ClearCachedObjects" => Some(&mut self.clear_cached_objects),
            _ => None,
        }
    }

    /// Keep the first value seen for an element.
    fn set(&mut self, element: &[u8], value: String) {
        if let Some(slot) = self.slot(element) {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }

    /// Read the direct children of the root element.
    ///
    /// A field's value is the text of everything inside it, markup flattened.
    /// Repeated fields keep their first occurrence.
    fn parse(xml: &str) -> Result<Self, AppError> {
        let mut reader = Reader::from_str(xml);
        let mut payload = Self::default();
        let mut depth = 0usize;
        let mut seen_root = false;
        // Element being read, with the text gathered so far
        let mut field: Option<(Vec<u8>, String)> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    if depth == 0 {
                        if seen_root {
                            return Err(AppError::Decode("multiple root elements".into()));
                        }
                        seen_root = true;
                    } else if depth == 1 {
                        field = Some((start.name().as_ref().to_vec(), String::new()));
                    }
                    depth += 1;
                }
                Event::Empty(empty) => {
                    if depth == 0 {
                        if seen_root {
                            return Err(AppError::Decode("multiple root elements".into()));
                        }
                        seen_root = true;
                    } else if depth == 1 {
                        payload.set(empty.name().as_ref(), String::new());
                    }
                }
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                    if depth == 1 {
                        if let Some((name, value)) = field.take() {
                            payload.set(&name, value);
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some((_, value)) = field.as_mut() {
                        value.push_str(&text.unescape()?);
                    }
                }
                Event::CData(data) => {
                    if let Some((_, value)) = field.as_mut() {
                        value.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(AppError::Decode("payload has no root element".into()));
        }
        if depth != 0 {
            return Err(AppError::Decode("payload ends inside an element".into()));
        }

        Ok(payload)
    }
}

impl NotificationRecord {
    /// Decode the XML payload of a dequeued row.
    ///
    /// The root element name is not checked. Missing elements become empty strings
    /// and repeated elements keep their first value; markup inside an element is
    /// flattened to its text. `Port` falls back to 0 when it does not parse, and
    /// `ClearCachedObjects` is set only by a case-insensitive `true`.
    pub fn from_xml(id: Uuid, xml: &str) -> Result<Self, AppError> {
        if xml.trim().is_empty() {
            return Err(AppError::Decode(format!(
                "notification {} has an empty payload",
                id
            )));
        }

        let payload = NotificationPayload::parse(xml)?;

        Ok(Self {
            id,
            application: payload.application.unwrap_or_default(),
            type_name: payload.r#type.unwrap_or_default(),
            title: payload.title.unwrap_or_default(),
            message: payload.message.unwrap_or_default(),
            icon: payload.icon.unwrap_or_default(),
            password: payload.password.unwrap_or_default(),
            host: payload.host.unwrap_or_default(),
            port: payload
                .port
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(0),
            clear_cache: payload
                .clear_cached_objects
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
        })
    }

    /// Cache partition key for the transport connection.
    ///
    /// Plain concatenation of password, host and port. Distinct endpoints can
    /// collide (host "1" port 23 and host "12" port 3 both give "123"); callers
    /// rely on this exact partitioning, so it stays as is.
    pub fn connector_key(&self) -> String {
        format!("{}{}{}", self.password, self.host, self.port)
    }

    /// Stable notification type identifier: upper-cased, spaces replaced by underscores.
    pub fn type_key(&self) -> String {
        self.type_name.to_uppercase().replace(' ', "_")
    }

    /// Icon file name to look up, if the record names an icon.
    pub fn icon_file(&self) -> Option<String> {
        if self.icon.is_empty() {
            None
        } else {
            Some(format!("{}.png", self.icon))
        }
    }
}

impl std::fmt::Display for NotificationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]: {} - {}",
            self.application, self.type_name, self.title, self.message
        )
    }
}
