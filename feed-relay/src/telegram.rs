use crate::types::{Button, ChallengeImage, Messenger, SentMessage};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use interfaces::defs::ButtonRow;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize, PartialEq)]
struct InlineKeyboard {
    inline_keyboard: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct InlineButton {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_data: Option<String>,
}

impl From<&Button> for InlineButton {
    fn from(button: &Button) -> Self {
        match button {
            Button::Url { label, url } => InlineButton {
                text: label.clone(),
                url: Some(url.clone()),
                callback_data: None,
            },
            Button::Callback { label, data } => InlineButton {
                text: label.clone(),
                url: None,
                callback_data: Some(data.clone()),
            },
        }
    }
}

fn keyboard(buttons: &[ButtonRow]) -> Option<InlineKeyboard> {
    if buttons.is_empty() {
        return None;
    }
    Some(InlineKeyboard {
        inline_keyboard: buttons
            .iter()
            .map(|row| row.iter().map(InlineButton::from).collect())
            .collect(),
    })
}

#[derive(Serialize)]
struct SendPhoto<'a> {
    chat_id: &'a str,
    photo: &'a str,
    caption: &'a str,
    parse_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    chat: ApiChat,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
}

impl From<ApiMessage> for SentMessage {
    fn from(message: ApiMessage) -> Self {
        SentMessage {
            chat_id: message.chat.id.to_string(),
            message_id: message.message_id,
        }
    }
}

/// Bot API client. Captions and texts are sent as HTML.
pub struct TelegramMessenger {
    client: Client,
    api_base: String,
    token: String,
}

impl TelegramMessenger {
    pub fn new(client: Client, token: &str) -> Self {
        Self::with_api_base(client, token, DEFAULT_API_BASE)
    }

    pub fn with_api_base(client: Client, token: &str, api_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, request: reqwest::RequestBuilder) -> anyhow::Result<T> {
        // Errors carry the URL, and the URL carries the token
        let response = request.send().await.map_err(reqwest::Error::without_url)?;
        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("{} returned an unreadable response ({})", method, status))?;

        if !body.ok {
            return Err(anyhow!(
                "{} failed: {}",
                method,
                body.description.unwrap_or_else(|| status.to_string())
            ));
        }
        body.result.ok_or_else(|| anyhow!("{} returned no result", method))
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_photo(
        &self,
        chat_id: &str,
        media: &str,
        caption: &str,
        buttons: &[ButtonRow],
    ) -> anyhow::Result<SentMessage> {
        let payload = SendPhoto {
            chat_id,
            photo: media,
            caption,
            parse_mode: "HTML",
            reply_markup: keyboard(buttons),
        };
        let request = self.client.post(self.endpoint("sendPhoto")).json(&payload);
        let message: ApiMessage = self.call("sendPhoto", request).await?;
        debug!(chat_id = %chat_id, message_id = message.message_id, "sendPhoto ok");
        Ok(message.into())
    }

    async fn send_text(&self, chat_id: &str, text: &str, buttons: &[ButtonRow]) -> anyhow::Result<SentMessage> {
        let payload = SendMessage {
            chat_id,
            text,
            parse_mode: "HTML",
            reply_markup: keyboard(buttons),
        };
        let request = self.client.post(self.endpoint("sendMessage")).json(&payload);
        let message: ApiMessage = self.call("sendMessage", request).await?;
        debug!(chat_id = %chat_id, message_id = message.message_id, "sendMessage ok");
        Ok(message.into())
    }

    async fn send_image(&self, chat_id: &str, image: &ChallengeImage, caption: &str) -> anyhow::Result<SentMessage> {
        let part = Part::bytes(image.data.clone())
            .file_name("challenge")
            .mime_str(&image.mime_type)
            .with_context(|| format!("Invalid mime type {}", image.mime_type))?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);

        let request = self.client.post(self.endpoint("sendPhoto")).multipart(form);
        let message: ApiMessage = self.call("sendPhoto", request).await?;
        debug!(chat_id = %chat_id, message_id = message.message_id, "Challenge image sent");
        Ok(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buttons_map_to_inline_keyboard() {
        let rows = vec![
            vec![Button::url("View", "https://example.com/p/1")],
            vec![Button::callback("-1", "downvote"), Button::callback("+1", "upvote")],
        ];
        let value = serde_json::to_value(keyboard(&rows)).unwrap();
        assert_eq!(
            value,
            json!({
                "inline_keyboard": [
                    [{ "text": "View", "url": "https://example.com/p/1" }],
                    [
                        { "text": "-1", "callback_data": "downvote" },
                        { "text": "+1", "callback_data": "upvote" }
                    ]
                ]
            })
        );
    }

    #[test]
    fn no_buttons_means_no_markup() {
        assert!(keyboard(&[]).is_none());
        let payload = SendMessage {
            chat_id: "@feed",
            text: "hi",
            parse_mode: "HTML",
            reply_markup: keyboard(&[]),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("reply_markup").is_none());
    }

    #[test]
    fn error_response_is_parsed() {
        let body: ApiResponse<ApiMessage> =
            serde_json::from_str(r#"{"ok":false,"error_code":400,"description":"Bad Request: wrong file"}"#).unwrap();
        assert!(!body.ok);
        assert_eq!(body.description.as_deref(), Some("Bad Request: wrong file"));
    }

    #[test]
    fn sent_message_uses_returned_chat() {
        let body: ApiResponse<ApiMessage> =
            serde_json::from_str(r#"{"ok":true,"result":{"message_id":9,"chat":{"id":-1001},"date":0}}"#).unwrap();
        let sent: SentMessage = body.result.unwrap().into();
        assert_eq!(sent.chat_id, "-1001");
        assert_eq!(sent.message_id, 9);
    }

    #[test]
    fn endpoint_includes_token_and_method() {
        let messenger = TelegramMessenger::with_api_base(Client::new(), "123:abc", "http://localhost:8081/");
        assert_eq!(messenger.endpoint("sendMessage"), "http://localhost:8081/bot123:abc/sendMessage");
    }
}
