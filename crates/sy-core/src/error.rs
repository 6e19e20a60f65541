use uuid::Uuid;

// ---------------------------------------------------------------------------
// CoreError — the platform-wide error taxonomy
// ---------------------------------------------------------------------------

/// Error taxonomy shared by every subsystem.
///
/// Graph interrupts are deliberately NOT part of this enum; an interrupt is a
/// control-flow signal, not a failure, and is modelled as its own outcome tag
/// in the graph executor.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Input schema violated. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or expired credentials. Never retried.
    #[error("auth error: {0}")]
    Auth(String),

    /// Referenced entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or state-machine violation; the caller decides what to do.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network/broker/LLM timeout. Retried with backoff, bounded attempts.
    #[error("transient error: {0}")]
    Transient(String),

    /// A handler kept failing on the same message; it was routed to the DLQ.
    #[error("poison message {event_id} after {attempts} attempts: {last_error}")]
    PoisonMessage {
        event_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    /// Deadline elapsed or explicit cancel. Terminal for the affected task.
    #[error("cancelled")]
    Cancelled,

    /// Bug or invariant violation. Task marked failed, full context logged.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// Whether the error is terminal for the task it occurred in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoreError::Cancelled | CoreError::PoisonMessage { .. } | CoreError::Internal(_)
        )
    }

    /// HTTP status the REST layer maps this error onto.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::Auth(_) => 401,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Transient(_) => 503,
            CoreError::Cancelled => 499,
            CoreError::PoisonMessage { .. } | CoreError::Internal(_) => 500,
        }
    }

    /// User-visible message with diagnostic detail stripped. The full error
    /// stays in logs.
    pub fn sanitized(&self) -> String {
        match self {
            CoreError::Validation(_) => "The request was invalid.".into(),
            CoreError::Auth(_) => "You are not authorized for this action.".into(),
            CoreError::NotFound(_) => "The requested resource was not found.".into(),
            CoreError::Conflict(_) => "The request conflicts with current state.".into(),
            CoreError::Transient(_) => "A temporary failure occurred. Please retry.".into(),
            CoreError::Cancelled => "The operation was cancelled.".into(),
            CoreError::PoisonMessage { .. } | CoreError::Internal(_) => {
                "An internal error occurred.".into()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(CoreError::Transient("broker down".into()).is_retryable());
        assert!(!CoreError::Validation("bad".into()).is_retryable());
        assert!(!CoreError::Conflict("dup".into()).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }

    #[test]
    fn http_mapping() {
        assert_eq!(CoreError::Validation("x".into()).http_status(), 400);
        assert_eq!(CoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(CoreError::Conflict("x".into()).http_status(), 409);
        assert_eq!(CoreError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn sanitized_hides_detail() {
        let err = CoreError::Internal("dropped table users".into());
        assert!(!err.sanitized().contains("users"));
    }
}
