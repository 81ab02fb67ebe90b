use thiserror::Error;

/// Machine-readable error class, stable across message-text changes.
///
/// Callers should match on `LendError::kind()` rather than formatting/parsing
/// the `Display` text (spec §7: "every error carries a machine-readable kind").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientLiquidity,
    LtvExceeded,
    NotLiquidatable,
    OracleStale,
    OracleUnavailable,
    Conflict,
    Timeout,
    Duplicate,
    InvariantViolation,
}

#[derive(Error, Debug)]
pub enum LendError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: u64, available: u64 },

    #[error("ltv exceeded: debt value {debt_value} > max borrowable {max_borrowable}")]
    LtvExceeded {
        debt_value: String,
        max_borrowable: String,
    },

    #[error("position is not liquidatable: health factor {health_factor} >= RAY")]
    NotLiquidatable { health_factor: String },

    #[error("oracle quote for asset is stale: age {age_seconds}s > max {max_staleness_seconds}s")]
    OracleStale {
        age_seconds: u64,
        max_staleness_seconds: u64,
    },

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("unauthorized oracle publisher")]
    UnauthorizedPublisher,

    #[error("oracle quote signature invalid")]
    BadSignature,

    #[error("oracle price out of configured range")]
    OutOfRange,

    #[error("store conflict: optimistic-concurrency retries exhausted")]
    Conflict,

    #[error("intent deadline reached before commit")]
    Timeout,

    #[error("duplicate intent_id, returning cached result")]
    Duplicate,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("division by zero")]
    DivisionByZero,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl LendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LendError::Validation(_) => ErrorKind::Validation,
            LendError::NotFound(_) => ErrorKind::NotFound,
            LendError::InsufficientLiquidity { .. } => ErrorKind::InsufficientLiquidity,
            LendError::LtvExceeded { .. } => ErrorKind::LtvExceeded,
            LendError::NotLiquidatable { .. } => ErrorKind::NotLiquidatable,
            LendError::OracleStale { .. } => ErrorKind::OracleStale,
            LendError::OracleUnavailable(_)
            | LendError::UnauthorizedPublisher
            | LendError::BadSignature
            | LendError::OutOfRange => ErrorKind::OracleUnavailable,
            LendError::Conflict => ErrorKind::Conflict,
            LendError::Timeout => ErrorKind::Timeout,
            LendError::Duplicate => ErrorKind::Duplicate,
            // Arithmetic and invariant failures are never recovered locally (spec §7):
            // they surface to callers as the same fatal kind.
            LendError::Overflow
            | LendError::DivisionByZero
            | LendError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            LendError::Store(_) | LendError::Codec(_) | LendError::Config(_) | LendError::Crypto(_) => {
                ErrorKind::Validation
            }
        }
    }

    /// True for errors the caller may usefully retry without any change on their end.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, LendError>;
