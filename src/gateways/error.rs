/// Gateway error with retry classification.
///
/// Gateways return this type to indicate whether an operation should be
/// retried. The phase engines use `is_retryable()` together with the
/// configured retry policy to decide.
///
/// **Retryable (is_retryable = true)**:
/// - Control-plane throttling
/// - Connection timeouts and transient network failures
/// - Temporary capacity shortages
///
/// **Non-retryable (is_retryable = false)**:
/// - Access denied / role assumption rejected
/// - Unknown instance or image ids
/// - Invalid request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    /// Operation that failed (e.g. "create_image", "acquire").
    pub operation: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether the operation should be retried.
    pub retryable: bool,
}

impl GatewayError {
    /// Create a retryable (transient) error.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Conversion from bare strings; treated as retryable (conservative).
impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        Self {
            operation: "unknown".to_string(),
            message: s,
            retryable: true,
        }
    }
}

impl From<&str> for GatewayError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
