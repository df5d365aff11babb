//! E2E tests for webhook ingestion

mod common;

use common::TestServer;

#[tokio::test]
async fn health_check_works() {
    let server = TestServer::new().await;
    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn signed_webhook_creates_conversation_and_message() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    let body = TestServer::text_webhook_body("U0001", "Hello from LINE", "rt-1");
    let response = server.post_signed_webhook(&channel, body).await;
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["success"], true);

    let user = server
        .state
        .db
        .get_line_user(&channel.id, "U0001")
        .await
        .unwrap()
        .expect("line user should be created");
    let conversation = server
        .state
        .db
        .get_conversation_for_user(&channel.id, &user.id)
        .await
        .unwrap()
        .expect("conversation should be created");
    assert_eq!(conversation.status, "unread");
    assert_eq!(conversation.unread_count, 1);
    assert_eq!(
        conversation.last_message_preview.as_deref(),
        Some("Hello from LINE")
    );

    let messages = server
        .state
        .db
        .get_messages_for_conversation(&conversation.id, 10)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn duplicate_deliveries_converge_on_one_conversation() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    for _ in 0..2 {
        let body = TestServer::text_webhook_body("U0001", "Hello", "rt-1");
        let response = server.post_signed_webhook(&channel, body).await;
        assert_eq!(response.status(), 200);
    }

    let user = server
        .state
        .db
        .get_line_user(&channel.id, "U0001")
        .await
        .unwrap()
        .unwrap();
    let conversation = server
        .state
        .db
        .get_conversation_for_user(&channel.id, &user.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.unread_count, 2);
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    let body = TestServer::text_webhook_body("U0001", "Hello", "rt-1");
    let response = server
        .client
        .post(server.url(&format!("/webhook/{}", channel.id)))
        .header("content-type", "application/json")
        .header("x-line-signature", "not-a-valid-signature")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    assert!(
        server
            .state
            .db
            .get_line_user(&channel.id, "U0001")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn missing_signature_is_rejected_by_default() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    let body = TestServer::text_webhook_body("U0001", "Hello", "rt-1");
    let response = server
        .client
        .post(server.url(&format!("/webhook/{}", channel.id)))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn unknown_channel_is_404() {
    let server = TestServer::new().await;

    let body = TestServer::text_webhook_body("U0001", "Hello", "rt-1");
    let response = server
        .client
        .post(server.url("/webhook/01J00000000000000000000000"))
        .header("content-type", "application/json")
        .header("x-line-signature", "irrelevant")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn soft_deleted_channel_stops_accepting_webhooks() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    server.state.db.soft_delete_channel(&channel.id).await.unwrap();

    let body = TestServer::text_webhook_body("U0001", "Hello", "rt-1");
    let response = server.post_signed_webhook(&channel, body).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn auto_reply_fires_for_matching_keyword() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    let rule = linedeck::data::AutoReplyRule {
        id: linedeck::data::EntityId::new().0,
        account_id: account.id.clone(),
        channel_id: None,
        keyword: "hours".to_string(),
        match_type: "contains".to_string(),
        reply_content: "We are open 9-18 JST.".to_string(),
        is_active: true,
        priority: 1,
        created_at: chrono::Utc::now(),
    };
    server.state.db.insert_auto_reply_rule(&rule).await.unwrap();

    let body = TestServer::text_webhook_body("U0001", "what are your hours?", "rt-9");
    let response = server.post_signed_webhook(&channel, body).await;
    assert_eq!(response.status(), 200);

    let replies = server.api.replies.lock().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, "rt-9");
    assert_eq!(replies[0].1[0]["text"], "We are open 9-18 JST.");
}

#[tokio::test]
async fn bot_log_endpoint_records_outgoing_message() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let channel = server.create_test_channel(&account).await;

    let response = server
        .client
        .post(server.url(&format!("/bot-messages/log/{}", common::TEST_BOT_TOKEN)))
        .json(&serde_json::json!({
            "line_user_id": "U0002",
            "message_type": "text",
            "content": "Bot already replied"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let user = server
        .state
        .db
        .get_line_user(&channel.id, "U0002")
        .await
        .unwrap()
        .unwrap();
    let conversation = server
        .state
        .db
        .get_conversation_for_user(&channel.id, &user.id)
        .await
        .unwrap()
        .unwrap();
    // Bot-logged messages are outgoing: preview updates, unread does not.
    assert_eq!(conversation.unread_count, 0);
    assert_eq!(
        conversation.last_message_preview.as_deref(),
        Some("Bot already replied")
    );

    // No provider call happens for logged messages.
    assert!(server.api.pushes.lock().unwrap().is_empty());
    assert!(server.api.replies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn bot_log_with_bad_token_is_unauthorized() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    server.create_test_channel(&account).await;

    let response = server
        .client
        .post(server.url("/bot-messages/log/wrong-token"))
        .json(&serde_json::json!({
            "line_user_id": "U0002",
            "message_type": "text",
            "content": "hi"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
