//! Normalization of backend responses
//!
//! Successful responses are always handed to callers in the shape
//! `{"result": ...}`. Failures are unwrapped from the backend's
//! `{"error": {"message": ..., "detail": ...}}` envelope into a [`BrokerError`].

use nowauth_tokens::BrokerError;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};

/// Turns a raw status and body into either a `{"result": ...}` value or an error
///
/// * An empty success body becomes `{"result": null}`.
/// * A success body without a `result` member is wrapped in one.
/// * A success body carrying an `error` member is an upstream error.
/// * `401` and `403` become authentication and permission errors.
/// * Any other failure becomes an upstream error with the backend's own message.
pub fn normalize_response(status: StatusCode, body: &[u8]) -> Result<Value, BrokerError> {
    if status.is_success() {
        normalize_success(status, body)
    } else {
        Err(classify_failure(status, body))
    }
}

fn normalize_success(status: StatusCode, body: &[u8]) -> Result<Value, BrokerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({ "result": null }));
    }

    let value: Value = serde_json::from_slice(body).map_err(|err| BrokerError::Upstream {
        status: Some(status.as_u16()),
        message: "backend returned a response that is not JSON".into(),
        detail: Some(err.to_string()),
    })?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let (message, detail) = describe_error(error);
        tracing::debug!(
            response.status = status.as_u16(),
            "successful response carried an embedded error"
        );
        return Err(BrokerError::Upstream {
            status: Some(status.as_u16()),
            message,
            detail,
        });
    }

    Ok(wrap_result(value))
}

fn wrap_result(value: Value) -> Value {
    match value {
        Value::Object(map) if map.contains_key("result") => Value::Object(map),
        other => {
            let mut wrapped = Map::with_capacity(1);
            wrapped.insert("result".into(), other);
            Value::Object(wrapped)
        }
    }
}

fn classify_failure(status: StatusCode, body: &[u8]) -> BrokerError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let (message, detail) = match parsed.as_ref().and_then(|v| v.get("error")) {
        Some(error) if !error.is_null() => describe_error(error),
        _ => (fallback_message(status, parsed.as_ref(), body), None),
    };

    match status {
        StatusCode::UNAUTHORIZED => BrokerError::authentication(message),
        StatusCode::FORBIDDEN => BrokerError::Permission(message),
        _ => BrokerError::Upstream {
            status: Some(status.as_u16()),
            message,
            detail,
        },
    }
}

/// Pulls a message and detail out of an `error` member
///
/// The backend sends either an object with `message` and `detail` strings or
/// a bare string.
fn describe_error(error: &Value) -> (String, Option<String>) {
    match error {
        Value::String(message) => (message.clone(), None),
        Value::Object(fields) => {
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or("backend reported an error")
                .to_owned();
            let detail = fields
                .get("detail")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .map(str::to_owned);
            (message, detail)
        }
        other => (other.to_string(), None),
    }
}

fn fallback_message(status: StatusCode, parsed: Option<&Value>, body: &[u8]) -> String {
    if let Some(message) = parsed.and_then(|v| v.get("message")).and_then(Value::as_str) {
        return message.to_owned();
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() || (parsed.is_none() && text.starts_with('<')) {
        return status
            .canonical_reason()
            .map_or_else(|| format!("HTTP {}", status.as_u16()), str::to_owned);
    }

    const MAX_LEN: usize = 200;
    match text.char_indices().nth(MAX_LEN) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_owned(),
    }
}
