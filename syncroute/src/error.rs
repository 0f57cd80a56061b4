//! Error types for routing, batching and delivery operations.
//!
//! [`SyncError`] carries a classification, a static description, optional dynamic detail and
//! the callsite that produced it. Several errors can be aggregated into one, which is how
//! per-channel failures of a routing pass are reported together.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Error type of the routing core.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Errors collected from independent units of work, such as channels of a pass.
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Classification of a [`SyncError`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration
    ConfigError,
    MissingChannelPolicy,
    InvalidChannelPolicy,
    InvalidRouterExpression,

    // Policy evaluation
    SubselectFailed,
    LookupFailed,
    ExpressionFailed,
    CatalogUnavailable,

    // Capture
    CaptureReadFailed,

    // Persistence
    StoreQueryFailed,
    StoreConnectionFailed,

    // State
    InvalidState,
    InvalidBatchTransition,
    BatchNotFound,
    LeaseNotHeld,

    // Workers
    RoutingWorkerPanic,
    PurgeWorkerPanic,

    // IO & serialization
    IoError,
    SerializationError,
    DeserializationError,

    Unknown,

    // Raised by failpoints in tests.
    #[cfg(feature = "failpoints")]
    WithNoRetry,
    #[cfg(feature = "failpoints")]
    WithTimedRetry,
}

impl ErrorKind {
    /// Returns `true` for errors caused by a missing or invalid channel configuration.
    ///
    /// Such errors disable the channel for the rest of the pass.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigError
                | ErrorKind::MissingChannelPolicy
                | ErrorKind::InvalidChannelPolicy
                | ErrorKind::InvalidRouterExpression
        )
    }

    /// Returns `true` for errors raised while computing the targets of an event.
    pub fn is_policy_evaluation(&self) -> bool {
        matches!(
            self,
            ErrorKind::SubselectFailed
                | ErrorKind::LookupFailed
                | ErrorKind::ExpressionFailed
                | ErrorKind::CatalogUnavailable
        )
    }
}

impl SyncError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the first available detail.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. Ignored on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Hash for SyncError {
    /// Hashes kind and static description only, so repeated occurrences group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();
        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps pool errors to [`ErrorKind::StoreConnectionFailed`] and everything else to
/// [`ErrorKind::StoreQueryFailed`].
impl From<sqlx::Error> for SyncError {
    #[track_caller]
    fn from(err: sqlx::Error) -> SyncError {
        let kind = match &err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                ErrorKind::StoreConnectionFailed
            }
            _ => ErrorKind::StoreQueryFailed,
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::StoreQueryFailed,
            Cow::Borrowed("Database migration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps configuration validation failures to [`ErrorKind::InvalidChannelPolicy`] for channel
/// problems and [`ErrorKind::ConfigError`] otherwise.
impl From<config::shared::ValidationError> for SyncError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> SyncError {
        let kind = match &err {
            config::shared::ValidationError::MissingRouterExpression { .. }
            | config::shared::ValidationError::DuplicateChannel(_) => {
                ErrorKind::InvalidChannelPolicy
            }
            _ => ErrorKind::ConfigError,
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::LoadConfigError> for SyncError {
    #[track_caller]
    fn from(err: config::LoadConfigError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration could not be loaded"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
