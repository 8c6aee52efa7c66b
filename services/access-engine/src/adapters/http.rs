//! Response classification shared by the platform adapters

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::StepError;

/// Join a base URL and an API path
pub(crate) fn join(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub(crate) fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Whether a failed create means the object is already there
pub(crate) fn is_already_exists(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::CONFLICT {
        return true;
    }
    if !(status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY) {
        return false;
    }
    let body = body.to_ascii_lowercase();
    body.contains("already exists")
        || body.contains("already been taken")
        || body.contains("already used")
}

pub(crate) async fn send(request: RequestBuilder) -> Result<Response, StepError> {
    request.send().await.map_err(StepError::from)
}

/// Turn a non-2xx response into `Rejected` carrying the platform's payload
pub(crate) async fn rejected(response: Response) -> StepError {
    let status = response.status().as_u16();
    let payload = response.text().await.unwrap_or_default();
    StepError::Rejected { status, payload }
}

pub(crate) async fn expect_success(response: Response) -> Result<Response, StepError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(rejected(response).await)
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, StepError> {
    let response = expect_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| StepError::Decode(e.to_string()))
}

/// `Some(body)` on 2xx, `None` on 404, `Rejected` otherwise
pub(crate) async fn read_optional_json<T: DeserializeOwned>(
    response: Response,
) -> Result<Option<T>, StepError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    read_json(response).await.map(Some)
}

/// Create outcome for endpoints that signal duplicates via status code
pub(crate) async fn created_or_exists(response: Response) -> Result<bool, StepError> {
    let status = response.status();
    if status.is_success() {
        return Ok(true);
    }
    let payload = response.text().await.unwrap_or_default();
    if is_already_exists(status, &payload) {
        Ok(false)
    } else {
        Err(StepError::Rejected {
            status: status.as_u16(),
            payload,
        })
    }
}
