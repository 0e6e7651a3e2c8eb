//! REST backend client
//!
//! Only the endpoints the chat, login and profile-completion flows need. Every
//! request except login carries the bearer token from local storage.

use crate::config::Config;
use crate::context::{ProfileCompletion, ProfileSection};
use crate::error::{Error, Result};
use crate::message::{self, FileAttachment, Message, RawMessage};
use crate::storage::{Credentials, UserProfile};
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    #[serde(alias = "id", deserialize_with = "de_string_or_number")]
    user_id: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    sender_id: &'a str,
    receiver_id: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_type: Option<&'a str>,
}

impl<'a> SendMessageRequest<'a> {
    fn new(
        sender_id: &'a str,
        receiver_id: &'a str,
        content: &'a str,
        file: Option<&'a FileAttachment>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            content,
            file_url: file.map(|f| f.url.as_str()),
            file_name: file.map(|f| f.name.as_str()),
            file_size: file.map(|f| f.size),
            file_type: file.map(|f| f.mime_type.as_str()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineStatusResponse {
    #[serde(alias = "online")]
    is_online: bool,
}

/// Thin wrapper over the backend endpoints
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: Config,
    credentials: Option<Credentials>,
}

impl ApiClient {
    pub fn new(config: &Config, credentials: Option<Credentials>) -> Self {
        Self {
            http: Client::new(),
            config: config.clone(),
            credentials,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    fn authed(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let creds = self.credentials.as_ref().ok_or(Error::NotAuthenticated)?;
        Ok(builder.bearer_auth(&creds.token))
    }

    fn my_user_id(&self) -> Result<&str> {
        self.credentials
            .as_ref()
            .map(|c| c.user_id.as_str())
            .ok_or(Error::NotAuthenticated)
    }

    /// Sign in and keep the returned credentials on this client
    pub async fn login(&mut self, email: &str, password: &str) -> Result<Credentials> {
        let response = self
            .http
            .post(self.config.endpoint("Auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await?;
        let body: LoginResponse = check(response).await?.json().await?;

        let creds = Credentials {
            token: body.token,
            user_id: body.user_id,
            role: body.role,
            user: body.user,
        };
        self.credentials = Some(creds.clone());
        Ok(creds)
    }

    /// Raw history between two users
    pub async fn history_raw(&self, user_a: &str, user_b: &str) -> Result<String> {
        let url = self
            .config
            .endpoint(&format!("Message/history/{}/{}", user_a, user_b));
        let response = self.authed(self.http.get(url))?.send().await?;
        Ok(check(response).await?.text().await?)
    }

    /// History with the peer; `None` when the fetch or the body is bad
    ///
    /// Used for both the initial load and the poll, so failures are logged and
    /// folded into "no batch" instead of surfacing.
    pub async fn fetch_history(&self, peer_id: &str) -> Option<Vec<Message>> {
        let me = match self.my_user_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(error = %e, "cannot fetch history");
                return None;
            }
        };
        let body = match self.history_raw(&me, peer_id).await {
            Ok(body) => body,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "history fetch failed");
                return None;
            }
        };
        let batch = message::parse_batch_str(&body)?;
        debug!(peer = %peer_id, count = batch.len(), "history fetched");
        Some(message::resolve_batch(batch, &me, Utc::now()))
    }

    /// Post a message, with an already uploaded attachment if any; the
    /// server answers with the stored message
    pub async fn send_message(
        &self,
        receiver_id: &str,
        text: &str,
        file: Option<&FileAttachment>,
    ) -> Result<Message> {
        let me = self.my_user_id()?;
        let request = SendMessageRequest::new(me, receiver_id, text, file);
        let response = self
            .authed(self.http.post(self.config.endpoint("Message/send")))?
            .json(&request)
            .send()
            .await?;
        let raw: RawMessage = check(response).await?.json().await?;
        Ok(raw.into_message(me, Utc::now()))
    }

    /// Peer presence; errors read as offline
    pub async fn online_status(&self, user_id: &str) -> bool {
        let url = self.config.endpoint(&format!("User/online/{}", user_id));
        let result = async {
            let response = self.authed(self.http.get(url))?.send().await?;
            let status: OnlineStatusResponse = check(response).await?.json().await?;
            Ok::<_, Error>(status.is_online)
        }
        .await;

        result.unwrap_or_else(|e| {
            debug!(user = %user_id, error = %e, "online status unavailable");
            false
        })
    }

    /// Whether a profile section has any content for the current user
    pub async fn section_filled(&self, section: ProfileSection) -> Result<bool> {
        let me = self.my_user_id()?;
        let url = self
            .config
            .endpoint(&format!("{}/{}", section.resource(), me));
        let response = self.authed(self.http.get(url))?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: serde_json::Value = check(response).await?.json().await?;
        Ok(has_content(&body))
    }

    /// Check every section; sections that fail to load count as empty
    pub async fn profile_completion(&self) -> ProfileCompletion {
        let mut completion = ProfileCompletion::default();
        for section in ProfileSection::ALL {
            let filled = match self.section_filled(section).await {
                Ok(filled) => filled,
                Err(e) => {
                    debug!(section = section.resource(), error = %e, "section not loaded");
                    false
                }
            };
            completion.mark(section, filled);
        }
        completion
    }
}

fn has_content(body: &serde_json::Value) -> bool {
    match body {
        serde_json::Value::Null => false,
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(fields) => !fields.is_empty(),
        serde_json::Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// Map non-2xx responses to errors
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        body,
    })
}

fn de_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, got {}", other))),
    }
}
