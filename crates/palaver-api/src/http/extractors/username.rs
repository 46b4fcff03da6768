//! Caller identity extractor.
//!
//! Authentication happens in front of this service. The authenticated
//! caller's name arrives in the `X-Username` header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::error::AppError;

pub const USERNAME_HEADER: &str = "x-username";

/// The caller's username, trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Username(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Username {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USERNAME_HEADER)
            .ok_or_else(|| AppError::Validation("Missing X-Username header".to_string()))?;
        let username = value
            .to_str()
            .map_err(|_| AppError::Validation("X-Username header is not valid text".to_string()))?
            .trim();
        if username.is_empty() {
            return Err(AppError::Validation("X-Username header is empty".to_string()));
        }
        Ok(Username(username.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<Username, AppError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header("X-Username", value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Username::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_present_header_is_trimmed() {
        assert_eq!(extract(Some("  alice ")).await.unwrap(), Username("alice".into()));
    }

    #[tokio::test]
    async fn test_missing_or_blank_header_rejected() {
        assert!(matches!(extract(None).await, Err(AppError::Validation(_))));
        assert!(matches!(extract(Some("   ")).await, Err(AppError::Validation(_))));
    }
}
