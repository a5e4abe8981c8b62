//! Telegram Bot API transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    RequestBuilder,
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, warn};

use super::{Alert, CommandBatch, InboundCommand, NotifyError, Transport};

const API_BASE: &str = "https://api.telegram.org";

/// Bot token plus the chat that receives alerts.
#[derive(Clone)]
pub struct TelegramCredentials {
    pub token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    chat_id: String,
    poll_timeout: Duration,
}

impl TelegramTransport {
    /// `poll_timeout` is the long-poll window passed to `getUpdates`.
    pub fn new(credentials: &TelegramCredentials, poll_timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()
            .map_err(http)?;
        Ok(Self {
            client,
            base_url: format!("{API_BASE}/bot{}", credentials.token),
            chat_id: credentials.chat_id.clone(),
            poll_timeout,
        })
    }

    fn method(&self, name: &str) -> String {
        format!("{}/{name}", self.base_url)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, NotifyError> {
        let response: ApiResponse<T> = request
            .send()
            .await
            .map_err(http)?
            .json()
            .await
            .map_err(http)?;
        response.into_result()
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let request = self
            .client
            .post(self.method("sendMessage"))
            .json(&json!({ "chat_id": chat_id, "text": text }));
        self.call::<serde_json::Value>(request).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn connect(&self) -> Result<String, NotifyError> {
        let me: BotUser = self.call(self.client.get(self.method("getMe"))).await?;
        Ok(me.username.unwrap_or(me.first_name))
    }

    async fn send_alert(&self, alert: &Alert) -> Result<(), NotifyError> {
        let Some(path) = alert.artifact.as_ref() else {
            return self.send_text(&self.chat_id, &alert.summary).await;
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), "evidence unreadable, sending text only: {err}");
                return self.send_text(&self.chat_id, &alert.summary).await;
            }
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "alert.jpg".to_string());
        let photo = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/jpeg")
            .map_err(http)?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", alert.summary.clone())
            .part("photo", photo);

        let request = self.client.post(self.method("sendPhoto")).multipart(form);
        self.call::<serde_json::Value>(request).await.map(|_| ())
    }

    async fn poll_commands(&self, offset: Option<i64>) -> Result<CommandBatch, NotifyError> {
        let mut query = vec![
            ("timeout", self.poll_timeout.as_secs().to_string()),
            ("allowed_updates", "[\"message\"]".to_string()),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        let updates: Vec<Update> = self
            .call(self.client.get(self.method("getUpdates")).query(&query))
            .await?;
        let batch = parse_updates(updates);
        if !batch.commands.is_empty() {
            debug!(count = batch.commands.len(), "received remote messages");
        }
        Ok(batch)
    }

    async fn reply(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        self.send_text(&chat_id.to_string(), text).await
    }
}

/// Strip the URL so the bot token never reaches the logs.
fn http(err: reqwest::Error) -> NotifyError {
    NotifyError::Http(err.without_url())
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, NotifyError> {
        if !self.ok {
            return Err(NotifyError::Api(
                self.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        self.result
            .ok_or_else(|| NotifyError::Api("response carried no result".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct BotUser {
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    from: Option<Sender>,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: i64,
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Turn raw updates into commands and compute the next acknowledge offset.
/// Updates without text or sender are skipped but still acknowledged.
fn parse_updates(updates: Vec<Update>) -> CommandBatch {
    let next_offset = updates.iter().map(|u| u.update_id + 1).max();
    let commands = updates
        .into_iter()
        .filter_map(|update| {
            let message = update.message?;
            let from = message.from?;
            let text = message.text?;
            Some(InboundCommand {
                sender_id: from.id,
                sender_name: from.username.unwrap_or(from.first_name),
                chat_id: message.chat.id,
                text,
            })
        })
        .collect();
    CommandBatch {
        next_offset,
        commands,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_become_commands_and_advance_offset() {
        let raw = r#"{
            "ok": true,
            "result": [
                {"update_id": 100, "message": {"from": {"id": 42, "first_name": "Ada", "username": "ada"},
                    "chat": {"id": 420}, "text": "/arm"}},
                {"update_id": 101, "message": {"from": {"id": 7, "first_name": "Eve"},
                    "chat": {"id": 70}, "sticker": {}}},
                {"update_id": 102, "edited_message": {}}
            ]
        }"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let batch = parse_updates(response.into_result().unwrap());

        assert_eq!(batch.next_offset, Some(103));
        assert_eq!(
            batch.commands,
            vec![InboundCommand {
                sender_id: 42,
                sender_name: "ada".into(),
                chat_id: 420,
                text: "/arm".into(),
            }]
        );
    }

    #[test]
    fn empty_poll_keeps_offset() {
        let batch = parse_updates(Vec::new());
        assert_eq!(batch, CommandBatch::default());
    }

    #[test]
    fn api_errors_surface_description() {
        let raw = r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#;
        let response: ApiResponse<BotUser> = serde_json::from_str(raw).unwrap();
        match response.into_result() {
            Err(NotifyError::Api(description)) => assert_eq!(description, "Unauthorized"),
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[test]
    fn credentials_debug_hides_token() {
        let creds = TelegramCredentials {
            token: "123:secret".into(),
            chat_id: "99".into(),
        };
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
