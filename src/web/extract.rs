//! Request extractors that reject with `ApiError` bodies.

use super::ApiError;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    Json,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

/// `Json<T>` whose rejections are JSON errors naming the offending field.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection_error(rejection)),
        }
    }
}

fn json_rejection_error(rejection: JsonRejection) -> ApiError {
    match rejection {
        JsonRejection::JsonDataError(err) => {
            let detail = err.body_text();
            match rejected_field(&detail) {
                Some(field) => ApiError::invalid_field(field, detail),
                None => ApiError::bad_request(detail),
            }
        }
        JsonRejection::JsonSyntaxError(err) => ApiError::bad_request(err.body_text()),
        other => {
            let status = other.status();
            let status = if status == StatusCode::UNPROCESSABLE_ENTITY { StatusCode::BAD_REQUEST } else { status };
            ApiError::new(status, other.body_text())
        }
    }
}

fn field_path_pattern() -> &'static Regex {
    static FIELD_PATH: OnceLock<Regex> = OnceLock::new();
    FIELD_PATH.get_or_init(|| Regex::new(r": ([A-Za-z_][\w.\[\]]*): ").expect("static field path pattern"))
}

fn missing_field_pattern() -> &'static Regex {
    static MISSING: OnceLock<Regex> = OnceLock::new();
    MISSING.get_or_init(|| Regex::new(r"missing field `(\w+)`").expect("static missing field pattern"))
}

/// Field named by a deserialization error, e.g. `interval_secs` from
/// "...target type: interval_secs: invalid value: integer `-5`...".
fn rejected_field(detail: &str) -> Option<String> {
    field_path_pattern()
        .captures(detail)
        .or_else(|| missing_field_pattern().captures(detail))
        .map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_field_from_path_and_missing_field() {
        assert_eq!(
            rejected_field(
                "Failed to deserialize the JSON body into the target type: interval_secs: invalid value: integer `-5`, expected u32 at line 1 column 40"
            )
            .as_deref(),
            Some("interval_secs")
        );
        assert_eq!(
            rejected_field("Failed to deserialize the JSON body into the target type: missing field `url` at line 1 column 15")
                .as_deref(),
            Some("url")
        );
        assert_eq!(rejected_field("expected value at line 1 column 1"), None);
    }
}
