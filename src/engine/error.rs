use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Unknown spot/booking/user id.
    NotFound(Ulid),
    /// Spot already held by another non-terminal booking.
    Conflict(Ulid),
    /// Malformed request input (bad duration, EV on a non-EV spot, ...).
    Validation(&'static str),
    /// External gateway rejected the payment. The hold is preserved.
    PaymentVerificationFailed(String),
    /// Actor does not own the booking.
    Unauthorized(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
    /// Unexpected failure. Always logged at the boundary, never swallowed.
    Internal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(id) => write!(f, "spot held by booking: {id}"),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::PaymentVerificationFailed(reason) => {
                write!(f, "payment verification failed: {reason}")
            }
            EngineError::Unauthorized(id) => write!(f, "not the owner of booking: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
