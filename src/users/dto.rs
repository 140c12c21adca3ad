use serde::{Deserialize, Serialize};

use crate::users::repo::User;

/// Uniform response envelope: `{success, data?, error?, message?}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn message_only(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }
}

/// Raw query strings, so a non-numeric value falls back to the default
/// instead of tripping the extractor's plain-text rejection.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<String>,
    offset: Option<String>,
}

impl ListQuery {
    pub fn limit(&self) -> i64 {
        parse_or(&self.limit, 100)
    }

    pub fn offset(&self) -> i64 {
        parse_or(&self.offset, 0)
    }
}

fn parse_or(raw: &Option<String>, default: i64) -> i64 {
    raw.as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
        .max(0)
}

/// Required fields are `Option` so the handler can answer with the envelope
/// instead of a deserialization rejection.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    #[serde(default = "default_true", rename = "syncToMoodle")]
    pub sync_to_moodle: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SyncRequest {
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserPage {
    pub users: Vec<User>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_absent_fields() {
        let ok = ApiResponse::ok(serde_json::json!({"id": 1}));
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("error"));
        assert!(!json.contains("message"));

        let fail = ApiResponse::<serde_json::Value>::fail("boom");
        let json = serde_json::to_string(&fail).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"error\":\"boom\""));
        assert!(!json.contains("data"));
    }

    #[test]
    fn create_request_sync_defaults_to_true() {
        let body: CreateUserRequest = serde_json::from_str(
            r#"{"email":"a@x.com","username":"alice","password":"pw","name":"Alice"}"#,
        )
        .unwrap();
        assert!(body.sync_to_moodle);

        let body: CreateUserRequest = serde_json::from_str(
            r#"{"email":"a@x.com","username":"alice","password":"pw","name":"Alice","syncToMoodle":false}"#,
        )
        .unwrap();
        assert!(!body.sync_to_moodle);
    }

    #[test]
    fn list_query_parses_integers() {
        let q: ListQuery = serde_json::from_str(r#"{"limit":"25","offset":"10"}"#).unwrap();
        assert_eq!(q.limit(), 25);
        assert_eq!(q.offset(), 10);
    }

    #[test]
    fn list_query_defaults_when_absent_or_malformed() {
        let q: ListQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.limit(), 100);
        assert_eq!(q.offset(), 0);

        let q: ListQuery = serde_json::from_str(r#"{"limit":"abc","offset":"1.5"}"#).unwrap();
        assert_eq!(q.limit(), 100);
        assert_eq!(q.offset(), 0);
    }

    #[test]
    fn list_query_clamps_negative_values() {
        let q: ListQuery = serde_json::from_str(r#"{"limit":"-5","offset":"-1"}"#).unwrap();
        assert_eq!(q.limit(), 0);
        assert_eq!(q.offset(), 0);
    }
}
