//! Maps workflow errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::{ErrorKind, LedgerError, ProvisionError, ValidationError};

/// Error returned by every handler; the body is an [`crate::error::ErrorPayload`].
#[derive(Debug)]
pub struct ApiError(pub ProvisionError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.0.to_error_payload().kind)
    }
}

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::SignerMismatch
        | ErrorKind::Rejection
        | ErrorKind::DuplicateInitialization
        | ErrorKind::Conflict
        | ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::ChainRevert => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::ACCEPTED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Dependency | ErrorKind::Ledger | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ErrorKind::Chain => StatusCode::BAD_GATEWAY,
        ErrorKind::SignerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = self.0.to_error_payload();
        let status = status_for(payload.kind);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", payload.message);
        } else {
            tracing::debug!("Request rejected ({}): {}", payload.code, payload.message);
        }
        (status, Json(payload)).into_response()
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        Self(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self(err.into())
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::types::{Address, TransactionRef};
    use std::time::Duration;

    #[test]
    fn statuses_follow_error_class() {
        let cases = [
            (
                ApiError::from(ValidationError::UnknownKind("Vault".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError(ProvisionError::SignerMismatch {
                    expected: Address::from_bytes(&[1; 20]),
                    actual: Address::from_bytes(&[2; 20]),
                }),
                StatusCode::CONFLICT,
            ),
            (ApiError(ProvisionError::WorkflowBusy), StatusCode::CONFLICT),
            (
                ApiError(ProvisionError::Timeout {
                    transaction: TransactionRef::new("0x01").unwrap(),
                    waited: Duration::from_secs(1),
                }),
                StatusCode::ACCEPTED,
            ),
            (
                ApiError(ProvisionError::UnknownTransaction {
                    transaction: TransactionRef::new("0x02").unwrap(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(LedgerError::Unavailable("disk full".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{:?}", err.0);
        }
    }
}
