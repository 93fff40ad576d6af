use crate::core::config::ClientSettings;
use crate::core::errors::RelayError;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, trace, warn};

/// Pre-flight availability check run before every socket attempt
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    /// `Ok(())` when the service accepts connections.
    ///
    /// A non-2xx answer must be reported as a permanent
    /// [`RelayError::Probe`]; failing to reach the server at all is transient.
    async fn check(&self) -> Result<(), RelayError>;
}

/// `GET {base}/{path}?check_availability=true` with token authorization
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    settings: ClientSettings,
}

impl std::fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProbe")
            .field("base_url", &self.settings.base_url)
            .field("service_path", &self.settings.service_path)
            .finish_non_exhaustive()
    }
}

impl HttpProbe {
    pub fn new(settings: ClientSettings) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(settings.probe_timeout)
            .user_agent("relaylink/0.1")
            .build()
            .map_err(|e| RelayError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, settings })
    }

    /// Map a probe response status onto the failure taxonomy
    pub fn classify(status: StatusCode, extension_name: &str) -> Result<(), RelayError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(RelayError::probe_status(status.as_u16(), extension_name))
        }
    }
}

#[async_trait]
impl AvailabilityProbe for HttpProbe {
    #[instrument(skip(self), fields(service = %self.settings.service_path))]
    async fn check(&self) -> Result<(), RelayError> {
        let url = self.settings.probe_url()?;
        debug!(url = %url, "probing service availability");

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.settings.authorization_header())
            .send()
            .await
            .map_err(|e| RelayError::Http(format!("Availability probe failed: {}", e)))?;

        let status = response.status();
        trace!(%status, "probe response");

        let result = Self::classify(status, &self.settings.extension_name);
        if let Err(e) = &result {
            warn!(%status, error = %e, "service reported unavailable");
        }
        result
    }
}
