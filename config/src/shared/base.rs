use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// A non-default router was configured without an expression.
    #[error("channel `{channel_id}` uses the `{router_type}` router but has no `router_expression`")]
    MissingRouterExpression {
        channel_id: String,
        router_type: String,
    },
    /// Two channel policies share the same id.
    #[error("channel `{0}` is configured more than once")]
    DuplicateChannel(String),
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}

impl ValidationError {
    pub(crate) fn invalid(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}
