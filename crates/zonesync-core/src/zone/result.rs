//! Classification of remote results.
//!
//! Every recovery decision in the zone client switches on `ZoneResult`; nothing
//! else inspects `RemoteError` codes.

use std::time::Duration;

use super::retry::RetryPolicy;
use crate::error::ZoneError;
use crate::ports::{ConflictDetail, ErrorCode, RemoteError};

#[derive(Debug, Clone, PartialEq)]
pub enum ZoneResult<T> {
    Success(T),
    RetryAfter(Duration),
    LimitExceeded,
    ChangeTokenExpired,
    PartialFailure(ConflictDetail),
    ServerRecordChanged(ConflictDetail),
    ZoneNotFound,
    UserDeletedZone,
    Failure(RemoteError),
}

impl<T> ZoneResult<T> {
    /// Map a raw remote result onto the closed outcome set.
    ///
    /// Transient codes only become `RetryAfter` when the server sent a delay hint.
    pub fn refine(result: Result<T, RemoteError>) -> Self {
        let error = match result {
            Ok(value) => return ZoneResult::Success(value),
            Err(error) => error,
        };

        match error.code {
            ErrorCode::ServiceUnavailable | ErrorCode::RequestRateLimited | ErrorCode::ZoneBusy => {
                match error.retry_after {
                    Some(delay) => ZoneResult::RetryAfter(delay),
                    None => ZoneResult::Failure(error),
                }
            }
            ErrorCode::ZoneNotFound => ZoneResult::ZoneNotFound,
            ErrorCode::UserDeletedZone => ZoneResult::UserDeletedZone,
            ErrorCode::ChangeTokenExpired => ZoneResult::ChangeTokenExpired,
            ErrorCode::ServerRecordChanged => {
                ZoneResult::ServerRecordChanged(ConflictDetail::from_error(error))
            }
            ErrorCode::PartialFailure => ZoneResult::PartialFailure(ConflictDetail::from_error(error)),
            ErrorCode::LimitExceeded => ZoneResult::LimitExceeded,
            _ => ZoneResult::Failure(error),
        }
    }

    /// `refine`, then apply the policy's opt-in fallback for transient errors
    /// that came without a hint.
    pub fn refine_with(result: Result<T, RemoteError>, policy: &RetryPolicy) -> Self {
        match Self::refine(result) {
            ZoneResult::Failure(error) if policy.retry_without_hint && error.code.is_transient() => {
                ZoneResult::RetryAfter(policy.fallback_delay)
            }
            other => other,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ZoneResult::Success(_))
    }

    /// Terminal view of the outcome, for callers that don't recover from it.
    pub fn into_result(self) -> Result<T, ZoneError> {
        match self {
            ZoneResult::Success(value) => Ok(value),
            ZoneResult::RetryAfter(_) => Err(ZoneError::Unknown),
            ZoneResult::LimitExceeded => Err(ZoneError::LimitExceeded),
            ZoneResult::ChangeTokenExpired => Err(ZoneError::ChangeTokenExpired),
            ZoneResult::PartialFailure(detail) | ZoneResult::ServerRecordChanged(detail) => {
                Err(ZoneError::Conflict(detail))
            }
            ZoneResult::ZoneNotFound => Err(ZoneError::ZoneNotFound),
            ZoneResult::UserDeletedZone => Err(ZoneError::UserDeletedZone),
            ZoneResult::Failure(error) => Err(ZoneError::Remote(error)),
        }
    }

    /// The error a caller sees when it gives up on this outcome.
    pub fn into_error(self) -> ZoneError {
        match self.into_result() {
            Ok(_) => ZoneError::Unknown,
            Err(error) => error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn err(code: ErrorCode) -> Result<(), RemoteError> {
        Err(RemoteError::new(code, "test"))
    }

    fn hinted(code: ErrorCode, secs: u64) -> Result<(), RemoteError> {
        Err(RemoteError::new(code, "test").with_retry_after(Duration::from_secs(secs)))
    }

    #[test]
    fn ok_is_success() {
        assert_eq!(ZoneResult::refine(Ok::<_, RemoteError>(7)), ZoneResult::Success(7));
    }

    #[rstest]
    #[case::unavailable(ErrorCode::ServiceUnavailable)]
    #[case::rate_limited(ErrorCode::RequestRateLimited)]
    #[case::zone_busy(ErrorCode::ZoneBusy)]
    fn transient_with_hint_retries(#[case] code: ErrorCode) {
        assert_eq!(
            ZoneResult::refine(hinted(code, 5)),
            ZoneResult::RetryAfter(Duration::from_secs(5))
        );
    }

    #[rstest]
    #[case::unavailable(ErrorCode::ServiceUnavailable)]
    #[case::rate_limited(ErrorCode::RequestRateLimited)]
    #[case::zone_busy(ErrorCode::ZoneBusy)]
    fn transient_without_hint_fails(#[case] code: ErrorCode) {
        assert!(matches!(
            ZoneResult::refine(err(code)),
            ZoneResult::Failure(e) if e.code == code
        ));
    }

    #[rstest]
    #[case(ErrorCode::ZoneNotFound, ZoneResult::ZoneNotFound)]
    #[case(ErrorCode::UserDeletedZone, ZoneResult::UserDeletedZone)]
    #[case(ErrorCode::ChangeTokenExpired, ZoneResult::ChangeTokenExpired)]
    #[case(ErrorCode::LimitExceeded, ZoneResult::LimitExceeded)]
    fn unit_outcomes(#[case] code: ErrorCode, #[case] expected: ZoneResult<()>) {
        assert_eq!(ZoneResult::refine(err(code)), expected);
    }

    #[test]
    fn conflicts_keep_their_detail() {
        let result = ZoneResult::refine(err(ErrorCode::ServerRecordChanged));
        assert!(matches!(result, ZoneResult::ServerRecordChanged(d) if d.message == "test"));

        let result = ZoneResult::refine(err(ErrorCode::PartialFailure));
        assert!(matches!(result, ZoneResult::PartialFailure(_)));
    }

    #[rstest]
    #[case(ErrorCode::NetworkFailure)]
    #[case(ErrorCode::QuotaExceeded)]
    #[case(ErrorCode::Other)]
    fn everything_else_is_failure(#[case] code: ErrorCode) {
        assert!(matches!(ZoneResult::refine(err(code)), ZoneResult::Failure(_)));
    }

    #[test]
    fn fallback_applies_only_when_opted_in() {
        let mut policy = RetryPolicy::default();
        let result = ZoneResult::refine_with(err(ErrorCode::ZoneBusy), &policy);
        assert!(matches!(result, ZoneResult::Failure(_)));

        policy.retry_without_hint = true;
        let result = ZoneResult::refine_with(err(ErrorCode::ZoneBusy), &policy);
        assert_eq!(result, ZoneResult::RetryAfter(policy.fallback_delay));

        let result = ZoneResult::refine_with(err(ErrorCode::QuotaExceeded), &policy);
        assert!(matches!(result, ZoneResult::Failure(_)));
    }

    #[test]
    fn terminal_mapping() {
        assert!(matches!(
            ZoneResult::<()>::UserDeletedZone.into_result(),
            Err(ZoneError::UserDeletedZone)
        ));
        assert!(matches!(
            ZoneResult::refine(err(ErrorCode::QuotaExceeded)).into_result(),
            Err(ZoneError::Remote(e)) if e.code == ErrorCode::QuotaExceeded
        ));
    }
}
