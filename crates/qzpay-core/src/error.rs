use std::fmt;

/// Main error type for qzpay
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Input fails a contract (unknown type, negative amount, missing field)
    Validation(String),

    /// Entity does not exist
    NotFound(String),

    /// State conflict (promo at max redemptions, email in use, version mismatch)
    Conflict(String),

    /// Operation not permitted (inactive promo, expired entitlement, over limit)
    Forbidden(String),

    /// Provider returned a decline; carries the provider code and message
    PaymentDeclined { code: String, message: String },

    /// Transient provider failure, retryable
    ProviderUnavailable(String),

    /// Webhook signature verification failed
    InvalidSignature(String),

    /// Webhook timestamp outside the replay tolerance window
    WebhookReplayRejected(String),

    /// Webhook payload could not be parsed
    MalformedWebhook(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Unexpected internal error, opaque to the caller
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Error::PaymentDeclined { code, message } => {
                write!(f, "Payment declined ({}): {}", code, message)
            }
            Error::ProviderUnavailable(msg) => write!(f, "Provider unavailable: {}", msg),
            Error::InvalidSignature(msg) => write!(f, "Invalid webhook signature: {}", msg),
            Error::WebhookReplayRejected(msg) => write!(f, "Webhook replay rejected: {}", msg),
            Error::MalformedWebhook(msg) => write!(f, "Malformed webhook: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Error::NotFound("Row not found".to_string()),
            other => Error::Database(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::ProviderUnavailable(error.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Validation(format!("Invalid UUID: {}", error))
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a new forbidden error
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        Error::Forbidden(msg.into())
    }

    /// Create a new payment declined error
    pub fn payment_declined<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Error::PaymentDeclined {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a new provider unavailable error
    pub fn provider_unavailable<T: Into<String>>(msg: T) -> Self {
        Error::ProviderUnavailable(msg.into())
    }

    /// Create a new internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the operation may be retried with the same inputs
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderUnavailable(_) | Error::Database(_))
    }

    /// Whether this error means "the entity is not there" rather than
    /// "the call could not be made". Health probes use this to treat a
    /// reachable-but-empty provider as healthy.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl Error {
    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::InvalidSignature(_) => 400,
            Error::WebhookReplayRejected(_) => 400,
            Error::MalformedWebhook(_) => 400,
            Error::PaymentDeclined { .. } => 402,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Internal(_) => 500,
            Error::ProviderUnavailable(_) => 503,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Forbidden(_) => "forbidden",
            Error::PaymentDeclined { .. } => "payment_declined",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::InvalidSignature(_) => "invalid_signature",
            Error::WebhookReplayRejected(_) => "webhook_replay_rejected",
            Error::MalformedWebhook(_) => "malformed_webhook",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}
