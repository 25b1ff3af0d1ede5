use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mailpipe::classify::{Categorizer, GeminiCategorizer};
use mailpipe::errors::SyncError;
use mailpipe::notify::{Notifier, WebhookNotifier};
use mailpipe::types::{Category, EmailDocument};

const GENERATE_PATH: &str = "/v1beta/models/gemini-test:generateContent";

fn categorizer(server: &MockServer, key: Option<&str>) -> GeminiCategorizer {
    GeminiCategorizer::new(
        &server.uri(),
        "gemini-test",
        key.map(str::to_string),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn answer(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{ "content": { "parts": [{ "text": text }] } }]
    }))
}

#[tokio::test]
async fn gemini_answer_maps_to_category() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .and(header("x-goog-api-key", "k-123"))
        .and(body_partial_json(json!({
            "generationConfig": { "responseMimeType": "application/json" }
        })))
        .respond_with(answer(r#"{"category": "Meeting Booked"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let category = categorizer(&server, Some("k-123"))
        .categorize("Call confirmed", "See you Tuesday at 10")
        .await
        .unwrap();
    assert_eq!(category, Category::MeetingBooked);
}

#[tokio::test]
async fn gemini_failures_are_classification_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(answer(r#"{"category": "Probably interested"}"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let gemini = categorizer(&server, Some("k"));
    for _ in 0..2 {
        assert!(matches!(
            gemini.categorize("s", "b").await,
            Err(SyncError::Classification(_))
        ));
    }

    // No key: no request at all.
    assert!(categorizer(&server, None).categorize("s", "b").await.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

fn lead() -> EmailDocument {
    EmailDocument {
        id: "<lead@example.org>".into(),
        account_id: "me@example.com".into(),
        folder: "INBOX".into(),
        subject: "Pricing".into(),
        from: "Lead <lead@example.org>".into(),
        to: vec!["me@example.com".into()],
        date: Utc::now(),
        body: "Send me a quote".into(),
        ai_category: Category::Interested,
        indexed_at: Utc::now(),
    }
}

#[tokio::test]
async fn notifier_posts_to_both_targets() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slack"))
        .and(body_partial_json(json!({
            "text": "*New Interested Lead!*\n*From:* Lead <lead@example.org>\n*Subject:* Pricing"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({
            "event": "InterestedLead",
            "emailData": { "id": "<lead@example.org>", "aiCategory": "Interested" }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(
        Some(format!("{}/slack", server.uri())),
        Some(format!("{}/hook", server.uri())),
    );
    notifier.notify_interested(&lead()).await.unwrap();
}

#[tokio::test]
async fn notifier_attempts_each_target_independently() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slack"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(
        Some(format!("{}/slack", server.uri())),
        Some(format!("{}/hook", server.uri())),
    );
    let err = notifier.notify_interested(&lead()).await.unwrap_err();
    assert!(err.to_string().contains("slack"));

    // Unset targets are skipped.
    WebhookNotifier::new(None, None)
        .notify_interested(&lead())
        .await
        .unwrap();
}
