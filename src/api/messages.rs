//! Manual message sending

use axum::{Json, Router, extract::State, routing::post};
use url::Url;

use crate::AppState;
use crate::api::dto::{MessageResponse, SendMessageRequest};
use crate::auth::CurrentUser;
use crate::config::AppConfig;
use crate::data::{Capability, MessagePayload, MessageSource};
use crate::error::AppError;

/// Validate and canonicalize a media URL supplied by an operator.
///
/// Only HTTPS is accepted; the provider refuses to fetch anything
/// else. URLs pointing at this deployment's own host are rebuilt on
/// the configured base URL so a staging hostname pasted from a browser
/// still resolves for the provider.
fn normalize_media_url(config: &AppConfig, raw: &str) -> Result<String, AppError> {
    let parsed = Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("invalid media URL: {e}")))?;

    if parsed.scheme() != "https" {
        return Err(AppError::Validation(
            "media URLs must use https".to_string(),
        ));
    }

    if parsed.host_str() == Some(config.server.domain.as_str()) {
        return Ok(format!("{}{}", config.server.base_url(), parsed.path()));
    }

    Ok(raw.to_string())
}

fn normalize_payload(
    config: &AppConfig,
    payload: MessagePayload,
) -> Result<MessagePayload, AppError> {
    Ok(match payload {
        MessagePayload::Image { media_url } => MessagePayload::Image {
            media_url: normalize_media_url(config, &media_url)?,
        },
        MessagePayload::Video { media_url } => MessagePayload::Video {
            media_url: normalize_media_url(config, &media_url)?,
        },
        MessagePayload::Audio { media_url } => MessagePayload::Audio {
            media_url: normalize_media_url(config, &media_url)?,
        },
        MessagePayload::File { media_url } => MessagePayload::File {
            media_url: normalize_media_url(config, &media_url)?,
        },
        other => other,
    })
}

/// `POST /api/messages/send`
async fn send_message(
    State(state): State<AppState>,
    CurrentUser(account): CurrentUser,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let conversation = state
        .db
        .get_conversation(&request.conversation_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let channel = state
        .db
        .get_channel(&conversation.channel_id)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .gate
        .require(&account.id, &channel, Capability::Reply)
        .await?;

    let user = state
        .db
        .get_line_user_by_id(&conversation.line_user_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let payload = normalize_payload(&state.config, request.message)?;
    let message = state
        .dispatcher
        .send(
            &channel,
            &conversation,
            &user.line_user_id,
            None,
            payload,
            MessageSource::Manual,
        )
        .await?;

    Ok(Json(MessageResponse { message }))
}

pub fn messages_router() -> Router<AppState> {
    Router::new().route("/messages/send", post(send_message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_domain(domain: &str) -> AppConfig {
        let mut config = AppConfig::default_for_tests();
        config.server.domain = domain.to_string();
        config.server.protocol = "https".to_string();
        config
    }

    #[test]
    fn rejects_non_https_media() {
        let config = config_with_domain("inbox.example.com");
        assert!(normalize_media_url(&config, "http://cdn.example.com/a.jpg").is_err());
        assert!(normalize_media_url(&config, "not a url").is_err());
    }

    #[test]
    fn external_https_url_passes_through() {
        let config = config_with_domain("inbox.example.com");
        let url = "https://cdn.example.com/a.jpg";
        assert_eq!(normalize_media_url(&config, url).unwrap(), url);
    }

    #[test]
    fn own_host_url_is_rebuilt_on_base_url() {
        let config = config_with_domain("inbox.example.com");
        let normalized =
            normalize_media_url(&config, "https://inbox.example.com:8443/media/abc.jpg").unwrap();
        assert_eq!(normalized, "https://inbox.example.com/media/abc.jpg");
    }
}
