use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{RollcallError, Result};

/// JSON body returned by the attendance endpoint.
///
/// Only `message` is interpreted; every other field is kept verbatim in
/// `extra` because its schema belongs to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceResponse {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AttendanceResponse {
    pub const MESSAGE_FIELD: &'static str = "message";

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(Value::String(message.into())),
            extra: Map::new(),
        }
    }

    /// The status text to display. Absent, null or non-string values count as missing.
    pub fn message(&self) -> Result<&str> {
        match &self.message {
            Some(Value::String(text)) => Ok(text),
            _ => Err(RollcallError::MissingField(Self::MESSAGE_FIELD.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_and_keeps_extra_fields() {
        let response: AttendanceResponse =
            serde_json::from_str(r#"{"message":"Present: Alice","reg_no":"A1"}"#).unwrap();
        assert_eq!(response.message().unwrap(), "Present: Alice");
        assert_eq!(response.extra.get("reg_no"), Some(&Value::from("A1")));
    }

    #[test]
    fn missing_or_non_string_message_is_an_error() {
        let absent: AttendanceResponse = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(matches!(
            absent.message(),
            Err(RollcallError::MissingField(field)) if field == "message"
        ));

        let null: AttendanceResponse = serde_json::from_str(r#"{"message":null}"#).unwrap();
        assert!(null.message().is_err());

        let number: AttendanceResponse = serde_json::from_str(r#"{"message":7}"#).unwrap();
        assert!(number.message().is_err());
    }
}
