//! Request extraction shared by the routes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection};

use super::{HttpError, HttpState};

/// Largest accepted request body. Requests only ever carry a small JSON
/// document.
pub const MAX_BODY_SIZE: u64 = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

/// Inject the shared state.
pub fn with_state(
    state: Arc<HttpState>,
) -> impl Filter<Extract = (Arc<HttpState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// The request's query string as a map. A missing query is an empty map.
pub fn query() -> impl Filter<Extract = (HashMap<String, String>,), Error = Rejection> + Clone {
    warp::query::<HashMap<String, String>>()
}

/// Bearer token from `Authorization` or `?token=`; rejects with 401 when
/// neither is present.
pub fn token() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(query())
        .and_then(|header: Option<String>, query: HashMap<String, String>| async move {
            bearer_token(header.as_deref(), &query)
                .map(str::to_string)
                .ok_or_else(|| warp::reject::custom(HttpError::Unauthorized))
        })
}

/// JSON `{"path": ...}` body of the POST endpoints.
pub fn path_body() -> impl Filter<Extract = (PathQuery,), Error = Rejection> + Clone {
    warp::header::optional::<String>("content-type")
        .and(warp::body::content_length_limit(MAX_BODY_SIZE))
        .and(warp::body::bytes())
        .and_then(|content_type: Option<String>, body: Bytes| async move {
            parse_path_body(content_type.as_deref(), &body).map_err(warp::reject::custom)
        })
}

pub fn bearer_token<'a>(
    authorization: Option<&'a str>,
    query: &'a HashMap<String, String>,
) -> Option<&'a str> {
    let from_header = authorization.and_then(|value| {
        let (scheme, token) = value.trim().split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
    });
    from_header
        .or_else(|| query.get("token").map(String::as_str))
        .filter(|t| !t.is_empty())
}

pub fn parse_path_body(content_type: Option<&str>, body: &[u8]) -> Result<PathQuery, HttpError> {
    let is_json = content_type
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Err(HttpError::UnsupportedMediaType);
    }
    serde_json::from_slice(body).map_err(|e| HttpError::BadRequest(format!("invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bearer_token_sources() {
        let empty = query(&[]);
        assert_eq!(bearer_token(Some("Bearer abc"), &empty), Some("abc"));
        assert_eq!(bearer_token(Some("bearer  abc "), &empty), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc"), &empty), None);
        assert_eq!(bearer_token(None, &empty), None);

        let with_token = query(&[("token", "q")]);
        assert_eq!(bearer_token(None, &with_token), Some("q"));
        assert_eq!(bearer_token(Some("Bearer h"), &with_token), Some("h"));
        assert_eq!(bearer_token(None, &query(&[("token", "")])), None);
    }

    #[test]
    fn test_path_body_checks_content_type() {
        let body = br#"{"path": "/srv"}"#;
        let parsed = parse_path_body(Some("application/json; charset=utf-8"), body).unwrap();
        assert_eq!(parsed.path, "/srv");

        assert!(matches!(
            parse_path_body(Some("text/plain"), body),
            Err(HttpError::UnsupportedMediaType)
        ));
        assert!(matches!(parse_path_body(None, body), Err(HttpError::UnsupportedMediaType)));
        assert!(matches!(
            parse_path_body(Some("application/json"), b"{nope"),
            Err(HttpError::BadRequest(_))
        ));
        assert_eq!(parse_path_body(Some("application/json"), b"{}").unwrap().path, "");
    }

    #[tokio::test]
    async fn test_token_filter_rejects_without_credentials() {
        let filter = token();
        let found = warp::test::request()
            .path("/x?token=abc")
            .filter(&filter)
            .await
            .unwrap();
        assert_eq!(found, "abc");

        let rejection = warp::test::request().path("/x").filter(&filter).await.unwrap_err();
        assert!(matches!(rejection.find::<HttpError>(), Some(HttpError::Unauthorized)));
    }
}
