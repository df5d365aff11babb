//! LINE Messaging API client
//!
//! Thin HTTP wrapper over the provider's reply/push/multicast/broadcast
//! endpoints. Every call carries a bounded timeout (set on the shared
//! reqwest client) and surfaces the provider's error body verbatim on
//! rejection, since operators need the exact reason.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::data::MessagePayload;
use crate::error::AppError;

/// Profile fields LINE returns for a chat participant.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "pictureUrl")]
    pub picture_url: Option<String>,
    #[serde(rename = "language")]
    pub language: Option<String>,
}

/// Seam over the LINE Messaging API.
///
/// Production uses [`LineClient`]; tests substitute a recording stub
/// so orchestration logic is exercised without network access.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Reply to one inbound event using its single-use reply token.
    async fn reply(
        &self,
        access_token: &str,
        reply_token: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError>;

    /// Push to a single recipient without a reply token.
    async fn push(
        &self,
        access_token: &str,
        to: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError>;

    /// Send to up to 500 explicit recipients in one call.
    async fn multicast(
        &self,
        access_token: &str,
        to: &[String],
        messages: &[serde_json::Value],
    ) -> Result<(), AppError>;

    /// Send to all followers against the official quota. The provider
    /// does not return a recipient list for this mode.
    async fn broadcast(
        &self,
        access_token: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError>;

    /// Fetch a user's profile. `None` means the provider would not
    /// disclose it (blocked bot, deleted account).
    async fn get_profile(
        &self,
        access_token: &str,
        line_user_id: &str,
    ) -> Result<Option<UserProfile>, AppError>;
}

/// Production LINE Messaging API client
#[derive(Clone)]
pub struct LineClient {
    http_client: Arc<reqwest::Client>,
    base_url: String,
}

impl LineClient {
    /// Create a new client against a base URL (overridable for tests).
    pub fn new(http_client: Arc<reqwest::Client>, base_url: String) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_json(
        &self,
        endpoint: &str,
        access_token: &str,
        body: serde_json::Value,
    ) -> Result<(), AppError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let started = Instant::now();

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await;

        crate::metrics::PROVIDER_REQUEST_DURATION_SECONDS
            .with_label_values(&[endpoint])
            .observe(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                crate::metrics::PROVIDER_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "transport_error"])
                    .inc();
                return Err(error.into());
            }
        };

        let status = response.status();
        crate::metrics::PROVIDER_REQUESTS_TOTAL
            .with_label_values(&[endpoint, status.as_str()])
            .inc();

        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(rejection_error(endpoint, status, &detail));
        }

        Ok(())
    }
}

/// Map a non-success provider response to an error.
///
/// 429 means the channel's quota is exhausted; everything else carries
/// the provider's response body for diagnosis.
fn rejection_error(context: &str, status: reqwest::StatusCode, detail: &str) -> AppError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        tracing::warn!(context, detail, "Provider rate limit hit");
        return AppError::RateLimited;
    }
    AppError::Provider(format!("{context} rejected with HTTP {status}: {detail}"))
}

#[async_trait]
impl MessagingApi for LineClient {
    async fn reply(
        &self,
        access_token: &str,
        reply_token: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.post_json(
            "/v2/bot/message/reply",
            access_token,
            serde_json::json!({
                "replyToken": reply_token,
                "messages": messages,
            }),
        )
        .await
    }

    async fn push(
        &self,
        access_token: &str,
        to: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.post_json(
            "/v2/bot/message/push",
            access_token,
            serde_json::json!({
                "to": to,
                "messages": messages,
            }),
        )
        .await
    }

    async fn multicast(
        &self,
        access_token: &str,
        to: &[String],
        messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.post_json(
            "/v2/bot/message/multicast",
            access_token,
            serde_json::json!({
                "to": to,
                "messages": messages,
            }),
        )
        .await
    }

    async fn broadcast(
        &self,
        access_token: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.post_json(
            "/v2/bot/message/broadcast",
            access_token,
            serde_json::json!({
                "messages": messages,
            }),
        )
        .await
    }

    async fn get_profile(
        &self,
        access_token: &str,
        line_user_id: &str,
    ) -> Result<Option<UserProfile>, AppError> {
        let url = format!("{}/v2/bot/profile/{}", self.base_url, line_user_id);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(rejection_error("profile fetch", status, &detail));
        }

        let profile = response.json::<UserProfile>().await?;
        Ok(Some(profile))
    }
}

/// Build LINE wire message objects
pub mod wire {
    use serde_json::Value;

    use crate::data::MessagePayload;

    /// Fallback duration for outbound audio; LINE requires one and we
    /// do not probe the media.
    const DEFAULT_AUDIO_DURATION_MS: u64 = 60_000;

    /// Build a text message
    pub fn text(content: &str) -> Value {
        serde_json::json!({
            "type": "text",
            "text": content,
        })
    }

    /// Build an image message; the preview falls back to the original.
    pub fn image(media_url: &str) -> Value {
        serde_json::json!({
            "type": "image",
            "originalContentUrl": media_url,
            "previewImageUrl": media_url,
        })
    }

    /// Build a video message
    pub fn video(media_url: &str) -> Value {
        serde_json::json!({
            "type": "video",
            "originalContentUrl": media_url,
            "previewImageUrl": media_url,
        })
    }

    /// Build an audio message
    pub fn audio(media_url: &str) -> Value {
        serde_json::json!({
            "type": "audio",
            "originalContentUrl": media_url,
            "duration": DEFAULT_AUDIO_DURATION_MS,
        })
    }

    /// Build a sticker message
    pub fn sticker(package_id: &str, sticker_id: &str) -> Value {
        serde_json::json!({
            "type": "sticker",
            "packageId": package_id,
            "stickerId": sticker_id,
        })
    }

    /// Build a location message
    pub fn location(title: &str, address: &str, latitude: f64, longitude: f64) -> Value {
        serde_json::json!({
            "type": "location",
            "title": title,
            "address": address,
            "latitude": latitude,
            "longitude": longitude,
        })
    }

    /// Build a template message
    pub fn template(alt_text: &str, template: &Value) -> Value {
        serde_json::json!({
            "type": "template",
            "altText": alt_text,
            "template": template,
        })
    }

    /// Build a flex message
    pub fn flex(alt_text: &str, contents: &Value) -> Value {
        serde_json::json!({
            "type": "flex",
            "altText": alt_text,
            "contents": contents,
        })
    }

    /// Translate an internal payload into its provider wire shape.
    ///
    /// Files have no dedicated outbound type at the provider; they are
    /// sent as a text message carrying the download link.
    pub fn from_payload(payload: &MessagePayload) -> Value {
        match payload {
            MessagePayload::Text { content } => text(content),
            MessagePayload::Image { media_url } => image(media_url),
            MessagePayload::Video { media_url } => video(media_url),
            MessagePayload::Audio { media_url } => audio(media_url),
            MessagePayload::File { media_url } => text(media_url),
            MessagePayload::Location {
                title,
                address,
                latitude,
                longitude,
            } => location(
                title.as_deref().unwrap_or("Location"),
                address.as_deref().unwrap_or(""),
                *latitude,
                *longitude,
            ),
            MessagePayload::Sticker {
                package_id,
                sticker_id,
            } => sticker(package_id, sticker_id),
            MessagePayload::Template { alt_text, template: t } => template(alt_text, t),
            MessagePayload::Flex { alt_text, contents } => flex(alt_text, contents),
        }
    }
}

/// Convenience wrapper: single wire message list for one payload.
pub fn wire_messages(payload: &MessagePayload) -> Vec<serde_json::Value> {
    vec![wire::from_payload(payload)]
}
