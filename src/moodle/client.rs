use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MoodleConfig;

const REST_PATH: &str = "/webservice/rest/server.php";
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MoodleError {
    #[error("Moodle web service token is not configured (MOODLE_TOKEN is missing)")]
    NotConfigured,

    /// The endpoint answered with an HTML page instead of JSON, which means
    /// web services are disabled or the REST path is wrong.
    #[error("Moodle REST API endpoint returned an HTML page; ensure web services and the REST protocol are enabled")]
    EndpointUnavailable,

    #[error("Moodle REST API endpoint not found (404); check the endpoint path")]
    EndpointNotFound,

    #[error("Moodle authentication failed; check the configured token")]
    AuthFailed,

    #[error("Cannot connect to Moodle at {0}")]
    Unreachable(String),

    #[error("Moodle error: {0}")]
    Api(String),

    #[error("Unexpected Moodle response: {0}")]
    InvalidResponse(String),

    #[error("Moodle request failed: {0}")]
    Transport(reqwest::Error),
}

/// Fields sent to `core_user_create_users`.
#[derive(Debug, Clone)]
pub struct NewMoodleUser {
    pub username: String,
    pub password: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
}

/// Selective fields for `core_user_update_users`.
#[derive(Debug, Clone, Default)]
pub struct MoodleUserPatch {
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MoodleUserRef {
    pub id: i32,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub success: bool,
    pub message: String,
}

/// Seam between the user service and the LMS. Implemented by the real HTTP
/// client below and by stubs in tests.
#[async_trait]
pub trait MoodleClient: Send + Sync {
    /// Create a remote account and return its id. Falls back to a username
    /// lookup when Moodle reports the account already exists.
    async fn create_user(&self, new: &NewMoodleUser) -> Result<i32, MoodleError>;

    /// Best-effort lookup; any failure is reported as absence.
    async fn get_user_by_username(&self, username: &str) -> Option<MoodleUserRef>;

    /// Returns false on any failure, transport errors included.
    async fn update_user(&self, id: i32, patch: &MoodleUserPatch) -> bool;

    /// Suspend semantics on the Moodle side. Same contract as `update_user`.
    async fn delete_user(&self, id: i32) -> bool;

    async fn test_connection(&self) -> ConnectionStatus;
}

pub struct MoodleHttpClient {
    http: Client,
    endpoint: String,
    base_url: String,
    token: String,
}

impl MoodleHttpClient {
    pub fn new(config: &MoodleConfig) -> anyhow::Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let endpoint = format!("{base_url}{REST_PATH}");
        let http = Client::builder().timeout(CALL_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint,
            base_url,
            token: config.token.clone(),
        })
    }

    fn classify(&self, err: reqwest::Error) -> MoodleError {
        if err.is_connect() {
            MoodleError::Unreachable(self.base_url.clone())
        } else {
            MoodleError::Transport(err)
        }
    }

    /// One REST call: token/format/function as query parameters, the
    /// function-specific fields as a Moodle-style indexed form body.
    async fn call(&self, function: &str, fields: &[(String, String)]) -> Result<Value, MoodleError> {
        if self.token.is_empty() {
            return Err(MoodleError::NotConfigured);
        }

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[
                ("wstoken", self.token.as_str()),
                ("moodlewsrestformat", "json"),
                ("wsfunction", function),
            ])
            .form(fields)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().await.map_err(MoodleError::Transport)?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MoodleError::AuthFailed);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(MoodleError::EndpointNotFound);
        }
        // A 200 with an HTML page means web services are not wired up.
        if body.contains("<!DOCTYPE") || body.trim_start().starts_with("<html") {
            return Err(MoodleError::EndpointUnavailable);
        }
        if !status.is_success() {
            return Err(MoodleError::Api(format!("HTTP {status}: {body}")));
        }

        debug!(%function, "moodle call ok");
        serde_json::from_str(&body).map_err(|_| {
            let mut excerpt = body;
            excerpt.truncate(200);
            MoodleError::InvalidResponse(excerpt)
        })
    }
}

/// Extract the error message from a Moodle "exception" response, if any.
fn exception_message(value: &Value) -> Option<String> {
    value.get("exception")?;
    let msg = value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| value.get("errorcode").and_then(Value::as_str))
        .unwrap_or("Unknown error");
    Some(msg.to_string())
}

#[async_trait]
impl MoodleClient for MoodleHttpClient {
    async fn create_user(&self, new: &NewMoodleUser) -> Result<i32, MoodleError> {
        let fields = vec![
            ("users[0][username]".into(), new.username.clone()),
            ("users[0][password]".into(), new.password.clone()),
            ("users[0][firstname]".into(), new.firstname.clone()),
            ("users[0][lastname]".into(), new.lastname.clone()),
            ("users[0][email]".into(), new.email.clone()),
            ("users[0][auth]".into(), "manual".into()),
        ];

        let value = self.call("core_user_create_users", &fields).await?;

        if let Some(msg) = exception_message(&value) {
            // The account may already exist remotely; adopt it instead of failing.
            if msg.contains("already exists") || msg.contains("duplicate") {
                if let Some(existing) = self.get_user_by_username(&new.username).await {
                    return Ok(existing.id);
                }
            }
            return Err(MoodleError::Api(msg));
        }

        value
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|u| u.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id as i32)
            .ok_or_else(|| MoodleError::InvalidResponse("created-user id missing".into()))
    }

    async fn get_user_by_username(&self, username: &str) -> Option<MoodleUserRef> {
        let fields = vec![
            ("field".into(), "username".into()),
            ("values[0]".into(), username.to_string()),
        ];

        let value = match self.call("core_user_get_users_by_field", &fields).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, %username, "moodle user lookup failed");
                return None;
            }
        };

        let user = value.as_array()?.first()?;
        Some(MoodleUserRef {
            id: user.get("id").and_then(Value::as_i64)? as i32,
            username: user.get("username").and_then(Value::as_str)?.to_string(),
        })
    }

    async fn update_user(&self, id: i32, patch: &MoodleUserPatch) -> bool {
        let mut fields = vec![("users[0][id]".to_string(), id.to_string())];
        if let Some(firstname) = &patch.firstname {
            fields.push(("users[0][firstname]".into(), firstname.clone()));
        }
        if let Some(lastname) = &patch.lastname {
            fields.push(("users[0][lastname]".into(), lastname.clone()));
        }
        if let Some(email) = &patch.email {
            fields.push(("users[0][email]".into(), email.clone()));
        }

        match self.call("core_user_update_users", &fields).await {
            Ok(value) => match exception_message(&value) {
                Some(msg) => {
                    warn!(moodle_user_id = id, error = %msg, "moodle update rejected");
                    false
                }
                None => true,
            },
            Err(e) => {
                warn!(moodle_user_id = id, error = %e, "moodle update failed");
                false
            }
        }
    }

    async fn delete_user(&self, id: i32) -> bool {
        let fields = vec![("userids[0]".to_string(), id.to_string())];

        match self.call("core_user_delete_users", &fields).await {
            Ok(value) => match exception_message(&value) {
                Some(msg) => {
                    warn!(moodle_user_id = id, error = %msg, "moodle delete rejected");
                    false
                }
                None => true,
            },
            Err(e) => {
                warn!(moodle_user_id = id, error = %e, "moodle delete failed");
                false
            }
        }
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self.call("core_webservice_get_site_info", &[]).await {
            Ok(value) => {
                if let Some(msg) = exception_message(&value) {
                    return ConnectionStatus {
                        success: false,
                        message: format!("Moodle error: {msg}"),
                    };
                }
                let site = value
                    .get("sitename")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown");
                ConnectionStatus {
                    success: true,
                    message: format!("Connected to Moodle successfully. Site: {site}"),
                }
            }
            Err(e) => {
                let message = match &e {
                    MoodleError::NotConfigured
                    | MoodleError::EndpointUnavailable
                    | MoodleError::EndpointNotFound
                    | MoodleError::AuthFailed
                    | MoodleError::Unreachable(_) => e.to_string(),
                    other => format!("Connection test failed: {other}"),
                };
                ConnectionStatus {
                    success: false,
                    message,
                }
            }
        }
    }
}
