use thiserror::Error;

/// How a failure should be treated by the reconnect path and by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying will not help (service disabled, bad settings).
    Permanent,
    /// May succeed on a later attempt.
    Transient,
    /// The client has been disposed.
    Terminal,
    /// Malformed traffic or an id collision.
    Protocol,
    /// The peer answered the request with an error frame.
    Remote,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Service probe failed ({status}): {message}")]
    Probe {
        status: u16,
        message: String,
        hint: Option<String>,
    },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Client disposed")]
    Disposed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to reconnect after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Remote error ({kind}): {message}")]
    Remote {
        kind: String,
        message: String,
        hint: Option<String>,
    },

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl RelayError {
    /// Build the probe failure for a non-2xx availability check.
    ///
    /// 404 means the server extension is not loaded at all, which gets a
    /// remediation hint naming the command that enables it.
    pub fn probe_status(status: u16, extension_name: &str) -> Self {
        if status == 404 {
            Self::Probe {
                status,
                message: format!("the '{}' server extension is not enabled", extension_name),
                hint: Some(format!(
                    "Enable the server extension with `jupyter server extension enable {}` and restart the server",
                    extension_name
                )),
            }
        } else {
            Self::Probe {
                status,
                message: format!("service unavailable (HTTP {})", status),
                hint: None,
            }
        }
    }

    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Probe { .. } | Self::Config(_) => ErrorClass::Permanent,
            Self::Http(_) | Self::Socket(_) | Self::Timeout(_) | Self::Exhausted { .. } => {
                ErrorClass::Transient
            }
            Self::Disposed => ErrorClass::Terminal,
            Self::Protocol(_) | Self::Json(_) => ErrorClass::Protocol,
            Self::Remote { .. } => ErrorClass::Remote,
        }
    }

    pub const fn is_permanent(&self) -> bool {
        matches!(self.class(), ErrorClass::Permanent)
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Remediation hint, when the failure carries one.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Probe { hint, .. } | Self::Remote { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_404_has_enable_hint() {
        let err = RelayError::probe_status(404, "notebook_relay");
        assert!(err.is_permanent());
        let hint = err.hint().expect("404 carries a hint");
        assert!(hint.contains("jupyter server extension enable notebook_relay"));
        assert!(err.to_string().contains("not enabled"));
    }

    #[test]
    fn test_probe_other_status_is_generic() {
        let err = RelayError::probe_status(503, "notebook_relay");
        assert!(err.is_permanent());
        assert!(err.hint().is_none());
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(RelayError::Socket("x".into()).class(), ErrorClass::Transient);
        assert_eq!(RelayError::Timeout("x".into()).class(), ErrorClass::Transient);
        assert_eq!(RelayError::Disposed.class(), ErrorClass::Terminal);
        assert_eq!(RelayError::Protocol("x".into()).class(), ErrorClass::Protocol);
        assert!(!RelayError::Http("refused".into()).is_permanent());
        assert!(RelayError::Exhausted {
            attempts: 5,
            last: "boom".into()
        }
        .is_transient());
    }
}
