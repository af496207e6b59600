use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no numeric id field")]
    MissingId,
    #[error("message has no string method field")]
    MissingMethod,
    #[error("response has neither ok nor errorCode")]
    MalformedResponse,
    #[error("message is neither request, response nor notification")]
    UnknownKind,
}

/// One protoo envelope.
///
/// ```text
/// request      { "request":true,  "id":<u32>, "method":"<name>", "data":<obj> }
/// response-ok  { "response":true, "id":<u32>, "ok":true,  "data":<obj> }
/// response-err { "response":true, "id":<u32>, "errorCode":<int>, "errorReason":"<str>" }
/// notification { "notification":true, "method":"<name>", "data":<obj> }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u32,
        method: String,
        data: Value,
    },
    ResponseSuccess {
        id: u32,
        data: Value,
    },
    ResponseError {
        id: u32,
        error_code: i64,
        error_reason: String,
    },
    Notification {
        method: String,
        data: Value,
    },
}

impl Message {
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|error| MessageError::InvalidJson(error.to_string()))?;
        let object = value.as_object().ok_or(MessageError::NotAnObject)?;

        if object.get("request").and_then(Value::as_bool) == Some(true) {
            let id = object
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok())
                .ok_or(MessageError::MissingId)?;
            let method = object
                .get("method")
                .and_then(Value::as_str)
                .ok_or(MessageError::MissingMethod)?
                .to_string();
            let data = object.get("data").cloned().unwrap_or_else(|| json!({}));

            Ok(Message::Request { id, method, data })
        } else if object.get("response").and_then(Value::as_bool) == Some(true) {
            let id = object
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok())
                .ok_or(MessageError::MissingId)?;

            if object.get("ok").and_then(Value::as_bool) == Some(true) {
                let data = object.get("data").cloned().unwrap_or_else(|| json!({}));

                Ok(Message::ResponseSuccess { id, data })
            } else if let Some(error_code) = object.get("errorCode").and_then(Value::as_i64) {
                let error_reason = object
                    .get("errorReason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                Ok(Message::ResponseError {
                    id,
                    error_code,
                    error_reason,
                })
            } else {
                Err(MessageError::MalformedResponse)
            }
        } else if object.get("notification").and_then(Value::as_bool) == Some(true) {
            let method = object
                .get("method")
                .and_then(Value::as_str)
                .ok_or(MessageError::MissingMethod)?
                .to_string();
            let data = object.get("data").cloned().unwrap_or_else(|| json!({}));

            Ok(Message::Notification { method, data })
        } else {
            Err(MessageError::UnknownKind)
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            Message::Request { id, method, data } => json!({
                "request": true,
                "id": id,
                "method": method,
                "data": data,
            }),
            Message::ResponseSuccess { id, data } => json!({
                "response": true,
                "id": id,
                "ok": true,
                "data": data,
            }),
            Message::ResponseError {
                id,
                error_code,
                error_reason,
            } => json!({
                "response": true,
                "id": id,
                "errorCode": error_code,
                "errorReason": error_reason,
            }),
            Message::Notification { method, data } => json!({
                "notification": true,
                "method": method,
                "data": data,
            }),
        };

        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_round_trip() {
        let messages = [
            Message::Request {
                id: 1,
                method: "join".to_string(),
                data: json!({ "displayName": "alice" }),
            },
            Message::ResponseSuccess {
                id: 1,
                data: json!({ "peers": [] }),
            },
            Message::ResponseError {
                id: 2,
                error_code: 500,
                error_reason: "kaboom".to_string(),
            },
            Message::Notification {
                method: "peerClosed".to_string(),
                data: json!({ "peerId": "bob" }),
            },
        ];

        for message in messages {
            assert_eq!(Message::parse(&message.to_json()), Ok(message));
        }
    }

    #[test]
    fn missing_data_defaults_to_empty_object() {
        let message = Message::parse(r#"{"request":true,"id":7,"method":"join"}"#).unwrap();
        assert_eq!(
            message,
            Message::Request {
                id: 7,
                method: "join".to_string(),
                data: json!({}),
            },
        );
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(matches!(
            Message::parse("not json"),
            Err(MessageError::InvalidJson(_)),
        ));
        assert_eq!(Message::parse("[1,2]"), Err(MessageError::NotAnObject));
        assert_eq!(
            Message::parse(r#"{"request":true,"method":"join"}"#),
            Err(MessageError::MissingId),
        );
        assert_eq!(
            Message::parse(r#"{"response":true,"id":1}"#),
            Err(MessageError::MalformedResponse),
        );
        assert_eq!(
            Message::parse(r#"{"hello":"world"}"#),
            Err(MessageError::UnknownKind),
        );
    }
}
