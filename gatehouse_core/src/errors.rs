//! Error kinds surfaced by the granted-tree core.
//!
//! The write layer and the HTTP layer match on these kinds; each carries the
//! status code it is surfaced with.

use thiserror::Error;

/// Errors produced by the core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The user has no grant path to the requested node key.
    #[error("permission denied")]
    PermissionDenied,

    /// The per-user lock is held in `DOING`: an administrator change is in
    /// flight and the read cannot be served consistently.
    #[error("the administrator is modifying permissions, please wait")]
    AdminIsModifyingPerm,

    /// Permission deletion is blocked while rebuild tasks are pending.
    #[error("cannot remove the permission now, rebuild tasks are pending")]
    CannotRemovePermNow,

    /// Another worker holds the per-user lock.
    #[error("someone is doing this already")]
    SomeoneIsDoingThis,

    /// The lock TTL expired before the commit transition; the rebuild
    /// transaction was rolled back and the task remains for retry.
    #[error("lock timed out during commit transition")]
    LockTimeout,

    /// A reverse write was issued on a relation that only defines forward
    /// semantics.
    #[error("reverse write not allowed on this relation")]
    ReverseNotAllowed,

    /// A bulk operation without a primary-key set (`pre_clear`) was issued.
    #[error("bulk operation without a pk set is not allowed")]
    IllegalBulkOp,

    /// A node key with empty segments or a leading/trailing colon.
    #[error("malformed node key: {0:?}")]
    MalformedKey(String),

    /// An invariant check failed during rebuild; the transaction was rolled
    /// back and the task remains for operator intervention.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A referenced row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl CoreError {
    /// The HTTP status this kind is surfaced with.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::PermissionDenied => 403,
            CoreError::AdminIsModifyingPerm => 409,
            CoreError::CannotRemovePermNow => 409,
            CoreError::SomeoneIsDoingThis => 409,
            CoreError::LockTimeout => 409,
            CoreError::ReverseNotAllowed => 400,
            CoreError::IllegalBulkOp => 400,
            CoreError::MalformedKey(_) => 400,
            CoreError::IntegrityViolation(_) => 500,
            CoreError::NotFound(_) => 404,
        }
    }
}

/// Result alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_surface_contract() {
        assert_eq!(CoreError::AdminIsModifyingPerm.status_code(), 409);
        assert_eq!(CoreError::CannotRemovePermNow.status_code(), 409);
        assert_eq!(CoreError::IllegalBulkOp.status_code(), 400);
        assert_eq!(CoreError::MalformedKey("a::b".into()).status_code(), 400);
        assert_eq!(CoreError::NotFound("node").status_code(), 404);
    }
}
