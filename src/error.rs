use thiserror::Error;

/// Main error type for the linkmux proxy.
#[derive(Error, Debug, Clone)]
pub enum LinkmuxError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No source is registered in the balancer ring
    #[error("Empty source registry: use put to provide at least one source")]
    EmptyRegistry,

    /// A single dial attempt through a source failed
    #[error("Dial error: source {source_name} could not reach {address}: {message}")]
    Dial {
        source_name: String,
        address: String,
        message: String,
    },

    /// A reachability probe failed
    #[error("Probe error: interface {interface}: {message}")]
    Probe { interface: String, message: String },

    /// A policy with the same identifier is already registered
    #[error("Policy with identifier {id} is already present")]
    PolicyConflict { id: String },

    /// No policy with the given identifier is registered
    #[error("Policy with identifier {id} not found")]
    PolicyNotFound { id: String },

    /// Network related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Proxy protocol errors
    #[error("Proxy error: {message}")]
    Proxy { message: String },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LinkmuxError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a dial error
    pub fn dial<A: Into<String>, B: Into<String>, C: Into<String>>(
        source: A,
        address: B,
        message: C,
    ) -> Self {
        Self::Dial {
            source_name: source.into(),
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a probe error
    pub fn probe<A: Into<String>, B: Into<String>>(interface: A, message: B) -> Self {
        Self::Probe {
            interface: interface.into(),
            message: message.into(),
        }
    }

    /// Create a policy conflict error
    pub fn policy_conflict<S: Into<String>>(id: S) -> Self {
        Self::PolicyConflict { id: id.into() }
    }

    /// Create a policy not found error
    pub fn policy_not_found<S: Into<String>>(id: S) -> Self {
        Self::PolicyNotFound { id: id.into() }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a proxy protocol error
    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable by retrying through another source
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkmuxError::Dial { .. } | LinkmuxError::Network { .. }
        )
    }
}

/// Result type alias for linkmux operations
pub type LinkmuxResult<T> = Result<T, LinkmuxError>;

impl From<std::io::Error> for LinkmuxError {
    fn from(err: std::io::Error) -> Self {
        LinkmuxError::Io {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for LinkmuxError {
    fn from(err: toml::de::Error) -> Self {
        LinkmuxError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<serde_json::Error> for LinkmuxError {
    fn from(err: serde_json::Error) -> Self {
        LinkmuxError::internal(format!("JSON serialization error: {}", err))
    }
}

impl From<hyper::Error> for LinkmuxError {
    fn from(err: hyper::Error) -> Self {
        LinkmuxError::network(format!("HTTP error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let dial_err = LinkmuxError::dial("en0", "example.com:443", "connection refused");
        assert!(matches!(dial_err, LinkmuxError::Dial { .. }));
        assert_eq!(
            dial_err.to_string(),
            "Dial error: source en0 could not reach example.com:443: connection refused"
        );

        let conflict = LinkmuxError::policy_conflict("block_en0");
        assert_eq!(
            conflict.to_string(),
            "Policy with identifier block_en0 is already present"
        );
    }

    #[test]
    fn test_error_properties() {
        assert!(LinkmuxError::dial("en0", "x:1", "refused").is_retryable());
        assert!(LinkmuxError::network("unreachable").is_retryable());
        assert!(!LinkmuxError::EmptyRegistry.is_retryable());
        assert!(!LinkmuxError::policy_conflict("stick").is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LinkmuxError = io_error.into();
        assert!(matches!(err, LinkmuxError::Io { .. }));
    }
}
