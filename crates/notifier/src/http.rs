//! HTTP push gateway adapter.
//!
//! Registration is a synchronous `POST {base}/register`; notifications are
//! `POST {base}/notify` requests fired on a background task. A gateway that
//! answers with a non-success status is expected to send `{code, description}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    Application, Endpoint, ErrorResponse, ErrorSink, Notification, NotificationType, Transport,
    TransportError, TransportFactory,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body returned by the gateway.
#[derive(Debug, Deserialize)]
struct GatewayError {
    code: u16,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    application: &'a str,
    icon: Option<&'a str>,
    types: &'a [NotificationType],
}

/// Opens [`HttpTransport`] connections that share one HTTP client.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
    default_url: String,
}

impl HttpTransportFactory {
    pub fn new(default_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            default_url: default_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL a connection to `endpoint` talks to.
    pub fn base_url(&self, endpoint: &Endpoint) -> String {
        match endpoint {
            Endpoint::Remote { host, port, .. } => format!("http://{}:{}", host, port),
            Endpoint::Default | Endpoint::Local { .. } => self.default_url.clone(),
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    type Transport = HttpTransport;

    fn connect(
        &self,
        endpoint: &Endpoint,
        errors: ErrorSink,
    ) -> Result<HttpTransport, TransportError> {
        let base_url = self.base_url(endpoint);
        reqwest::Url::parse(&base_url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;

        tracing::info!(base_url = %base_url, "Created push gateway connection");

        Ok(HttpTransport {
            client: self.client.clone(),
            base_url,
            credential: endpoint.password().map(str::to_string),
            errors,
        })
    }
}

/// One logical connection to the push gateway.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credential: Option<String>,
    errors: ErrorSink,
}

impl HttpTransport {
    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}/{}", self.base_url, path));
        match &self.credential {
            Some(credential) => request.bearer_auth(credential),
            None => request,
        }
    }
}

/// Turn a failed gateway response into its error code and description.
async fn read_error(response: reqwest::Response) -> (u16, String) {
    let status = response.status();
    match response.json::<GatewayError>().await {
        Ok(body) => (body.code, body.description),
        Err(_) => (
            status.as_u16(),
            status.canonical_reason().unwrap_or("unknown").to_string(),
        ),
    }
}

impl Transport for HttpTransport {
    async fn register(
        &self,
        application: &Application,
        types: &[NotificationType],
    ) -> Result<(), TransportError> {
        let body = RegisterRequest {
            application: &application.name,
            icon: application.icon.as_deref(),
            types,
        };

        let response = self.post("register").json(&body).send().await?;
        if !response.status().is_success() {
            let (code, description) = read_error(response).await;
            return Err(TransportError::Rejected { code, description });
        }

        tracing::info!(
            application = %application.name,
            types = types.len(),
            "Registered application"
        );
        Ok(())
    }

    fn notify(&self, notification: Notification) -> Result<(), TransportError> {
        let request = self.post("notify").json(&notification);
        let errors = self.errors.clone();

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    let (code, description) = read_error(response).await;
                    errors.report(ErrorResponse {
                        code,
                        description,
                        in_response_to: Some(notification.id),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Notification request failed"
                    );
                }
            }
        });

        Ok(())
    }
}
