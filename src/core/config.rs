use reqwest::Url;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

/// Settings collaborator consumed by the client core.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// HTTP base of the notebook server, e.g. `http://localhost:8888`
    pub base_url: String,
    /// Websocket base, e.g. `ws://localhost:8888`
    pub ws_base_url: String,
    /// Path of the extension endpoint below both bases
    pub service_path: String,
    pub token: Secret<String>,
    /// Forward the token as a `token` query parameter on the socket URL
    pub append_token: bool,
    /// Name used in the "enable the extension" remediation hint
    pub extension_name: String,
    /// JSON field carrying the caller-assigned correlation id
    pub correlation_field: String,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// `None` keeps a pending request alive until a reply or disposal
    pub request_timeout: Option<Duration>,
    /// Buffer size of each broadcast channel
    pub channel_capacity: usize,
}

// Never expose the token in serialized form
impl Serialize for ClientSettings {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ClientSettings", 7)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("ws_base_url", &self.ws_base_url)?;
        state.serialize_field("service_path", &self.service_path)?;
        state.serialize_field("token", "[REDACTED]")?;
        state.serialize_field("append_token", &self.append_token)?;
        state.serialize_field("extension_name", &self.extension_name)?;
        state.serialize_field("correlation_field", &self.correlation_field)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ClientSettings {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ClientSettingsHelper {
            base_url: String,
            ws_base_url: String,
            service_path: String,
            #[serde(default)]
            token: String,
            #[serde(default)]
            append_token: bool,
            extension_name: Option<String>,
            correlation_field: Option<String>,
        }

        let helper = ClientSettingsHelper::deserialize(deserializer)?;
        let mut settings = Self::new(helper.base_url, helper.ws_base_url, helper.service_path)
            .with_token(helper.token)
            .with_append_token(helper.append_token);
        if let Some(name) = helper.extension_name {
            settings.extension_name = name;
        }
        if let Some(field) = helper.correlation_field {
            settings.correlation_field = field;
        }
        Ok(settings)
    }
}

impl ClientSettings {
    /// Create settings with defaults for everything but the endpoint
    #[must_use]
    pub fn new(base_url: String, ws_base_url: String, service_path: String) -> Self {
        let extension_name = service_path
            .trim_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            base_url,
            ws_base_url,
            service_path,
            token: Secret::new(String::new()),
            append_token: false,
            extension_name,
            correlation_field: "id".to_string(),
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            request_timeout: None,
            channel_capacity: 1024,
        }
    }

    /// Create settings from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_BASE_URL` (e.g., `RELAY_BASE_URL`)
    /// - `{PREFIX}_WS_URL` (optional, derived from the base URL)
    /// - `{PREFIX}_SERVICE_PATH`
    /// - `{PREFIX}_TOKEN` (optional)
    /// - `{PREFIX}_APPEND_TOKEN` (optional, defaults to false)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let base_url_var = format!("{}_BASE_URL", prefix);
        let path_var = format!("{}_SERVICE_PATH", prefix);

        let base_url =
            env::var(&base_url_var).map_err(|_| ConfigError::MissingEnvironmentVariable(base_url_var))?;
        let service_path =
            env::var(&path_var).map_err(|_| ConfigError::MissingEnvironmentVariable(path_var))?;
        let ws_base_url = env::var(format!("{}_WS_URL", prefix))
            .unwrap_or_else(|_| derive_ws_base(&base_url));
        let token = env::var(format!("{}_TOKEN", prefix)).unwrap_or_default();
        let append_token = env::var(format!("{}_APPEND_TOKEN", prefix))
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let settings = Self::new(base_url, ws_base_url, service_path)
            .with_token(token)
            .with_append_token(append_token);
        settings.validate()?;
        Ok(settings)
    }

    /// Create settings from a `.env` file and environment variables
    ///
    /// A missing `.env` file is not an error; system variables are used instead.
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    #[must_use]
    pub fn with_token(mut self, token: String) -> Self {
        self.token = Secret::new(token);
        self
    }

    #[must_use]
    pub const fn with_append_token(mut self, append_token: bool) -> Self {
        self.append_token = append_token;
        self
    }

    #[must_use]
    pub fn with_extension_name(mut self, name: String) -> Self {
        self.extension_name = name;
        self
    }

    #[must_use]
    pub fn with_correlation_field(mut self, field: String) -> Self {
        self.correlation_field = field;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Get the token (use carefully - exposes secret)
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration("base_url is empty".to_string()));
        }
        if self.ws_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration("ws_base_url is empty".to_string()));
        }
        if self.service_path.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidConfiguration("service_path is empty".to_string()));
        }
        if self.correlation_field.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "correlation_field is empty".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `{base}/{path}?check_availability=true`
    pub fn probe_url(&self) -> Result<Url, ConfigError> {
        let mut url = parse_url(&join_path(&self.base_url, &self.service_path))?;
        url.query_pairs_mut().append_pair("check_availability", "true");
        Ok(url)
    }

    /// `{wsBase}/{path}[?token=...]`, the token URL-encoded
    pub fn socket_url(&self) -> Result<Url, ConfigError> {
        let mut url = parse_url(&join_path(&self.ws_base_url, &self.service_path))?;
        if self.append_token && self.has_token() {
            url.query_pairs_mut().append_pair("token", self.token());
        }
        Ok(url)
    }

    /// Value of the `Authorization` header sent with the probe
    pub fn authorization_header(&self) -> String {
        format!("token {}", self.token())
    }
}

fn join_path(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidConfiguration(format!("Invalid URL '{}': {}", raw, e)))
}

fn derive_ws_base(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ClientSettings {
        ClientSettings::new(
            "http://localhost:8888/".to_string(),
            "ws://localhost:8888".to_string(),
            "/notebook_relay/ws".to_string(),
        )
    }

    #[test]
    fn test_defaults() {
        let s = settings();
        assert_eq!(s.extension_name, "notebook_relay");
        assert_eq!(s.correlation_field, "id");
        assert_eq!(s.connect_timeout, Duration::from_secs(10));
        assert_eq!(s.max_reconnect_attempts, 5);
        assert!(s.request_timeout.is_none());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_probe_url() {
        let url = settings().probe_url().unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8888/notebook_relay/ws?check_availability=true"
        );
    }

    #[test]
    fn test_socket_url_without_token_forwarding() {
        let url = settings().with_token("abc".to_string()).socket_url().unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8888/notebook_relay/ws");
    }

    #[test]
    fn test_socket_url_encodes_token() {
        let url = settings()
            .with_token("a b&c".to_string())
            .with_append_token(true)
            .socket_url()
            .unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8888/notebook_relay/ws?token=a+b%26c");
    }

    #[test]
    fn test_serialize_redacts_token() {
        let s = settings().with_token("super-secret".to_string());
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("[REDACTED]"));
        assert!(!json.contains("super-secret"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let s = settings().with_max_reconnect_attempts(0);
        assert!(matches!(s.validate(), Err(ConfigError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_derive_ws_base() {
        assert_eq!(derive_ws_base("https://hub.example.org"), "wss://hub.example.org");
        assert_eq!(derive_ws_base("http://localhost:8888"), "ws://localhost:8888");
    }
}
