use protocol::ProtocolError;
use thiserror::Error;
use warp::http::header::{HeaderValue, ALLOW, CONTENT_RANGE, WWW_AUTHENTICATE};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Reply;

use super::range::unsatisfied_range;
use crate::fs::FsError;
use crate::services::ServiceError;

/// Failures of one HTTP request. Each maps to a status code and a short
/// plain-text body.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing bearer token")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed { allow: Option<&'static str> },

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("unsupported media type, expected application/json")]
    UnsupportedMediaType,

    #[error("range not satisfiable")]
    RangeNotSatisfiable { total: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl warp::reject::Reject for HttpError {}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Unauthorized => StatusCode::UNAUTHORIZED,
            HttpError::Forbidden(_) => StatusCode::FORBIDDEN,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            HttpError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            HttpError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a rejection left over after routing.
    pub fn from_rejection(rejection: &warp::Rejection) -> Self {
        if let Some(err) = rejection.find::<HttpError>() {
            return err.duplicate();
        }
        if rejection.is_not_found() {
            HttpError::NotFound("no such endpoint".to_string())
        } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
            HttpError::MethodNotAllowed { allow: None }
        } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
            HttpError::PayloadTooLarge
        } else {
            HttpError::BadRequest(format!("{:?}", rejection))
        }
    }

    fn duplicate(&self) -> Self {
        match self {
            HttpError::BadRequest(m) => HttpError::BadRequest(m.clone()),
            HttpError::Unauthorized => HttpError::Unauthorized,
            HttpError::Forbidden(m) => HttpError::Forbidden(m.clone()),
            HttpError::NotFound(m) => HttpError::NotFound(m.clone()),
            HttpError::MethodNotAllowed { allow } => HttpError::MethodNotAllowed { allow: *allow },
            HttpError::PayloadTooLarge => HttpError::PayloadTooLarge,
            HttpError::UnsupportedMediaType => HttpError::UnsupportedMediaType,
            HttpError::RangeNotSatisfiable { total } => {
                HttpError::RangeNotSatisfiable { total: *total }
            }
            HttpError::Internal(m) => HttpError::Internal(m.clone()),
        }
    }
}

impl Reply for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = warp::reply::with_status(self.to_string(), status).into_response();
        let headers = response.headers_mut();
        match self {
            HttpError::Unauthorized => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            HttpError::MethodNotAllowed { allow: Some(allow) } => {
                headers.insert(ALLOW, HeaderValue::from_static(allow));
            }
            HttpError::RangeNotSatisfiable { total } => {
                if let Ok(value) = HeaderValue::from_str(&unsatisfied_range(total)) {
                    headers.insert(CONTENT_RANGE, value);
                }
            }
            _ => {}
        }
        response
    }
}

impl From<ServiceError> for HttpError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::PermissionDenied { .. } => HttpError::Forbidden(err.to_string()),
            ServiceError::InvalidPath(_) => HttpError::BadRequest(err.to_string()),
            ServiceError::Fs(FsError::NotFound(path)) => {
                HttpError::NotFound(path.display().to_string())
            }
            ServiceError::Fs(FsError::Io(e)) => HttpError::Internal(e.to_string()),
            ServiceError::Fs(other) => HttpError::BadRequest(other.to_string()),
        }
    }
}

impl From<ProtocolError> for HttpError {
    fn from(err: ProtocolError) -> Self {
        HttpError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        HttpError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::permissions::Action;

    #[test]
    fn test_service_errors_map_to_statuses() {
        let denied = ServiceError::PermissionDenied {
            action: Action::Read,
            path: "/x".into(),
        };
        assert_eq!(HttpError::from(denied).status(), StatusCode::FORBIDDEN);

        let missing = ServiceError::Fs(FsError::NotFound(PathBuf::from("/x")));
        assert_eq!(HttpError::from(missing).status(), StatusCode::NOT_FOUND);

        let dir = ServiceError::Fs(FsError::IsADirectory(PathBuf::from("/x")));
        assert_eq!(HttpError::from(dir).status(), StatusCode::BAD_REQUEST);

        let io = ServiceError::Fs(FsError::Io(std::io::Error::other("disk")));
        assert_eq!(HttpError::from(io).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_response_headers() {
        let response = HttpError::RangeNotSatisfiable { total: 1000 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */1000");

        let response = HttpError::MethodNotAllowed { allow: Some("POST") }.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");

        let response = HttpError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn test_custom_rejection_keeps_its_status() {
        let rejection = warp::reject::custom(HttpError::UnsupportedMediaType);
        assert_eq!(
            HttpError::from_rejection(&rejection).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            HttpError::from_rejection(&warp::reject::not_found()).status(),
            StatusCode::NOT_FOUND
        );
    }
}
