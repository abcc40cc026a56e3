mod common;

use std::time::Duration;

use common::{start_mock, Reply, FAKE_PNG};
use peek_lib::dispatch::{QueryRequest, WorkflowClient};
use peek_lib::settings::Complexity;

fn request(screenshot: Option<Vec<u8>>, session_id: Option<&str>, tts_enabled: bool) -> QueryRequest {
    QueryRequest {
        query: "what is this error?".into(),
        screenshot,
        complexity: Complexity::High,
        session_id: session_id.map(str::to_string),
        tts_enabled,
    }
}

#[tokio::test]
async fn sends_every_form_field() {
    let mock = start_mock(Reply::ok(r#"{"output": "A null pointer."}"#)).await;
    let client = WorkflowClient::new(Duration::from_secs(5)).unwrap();

    let outcome = client
        .dispatch(&mock.url, request(Some(FAKE_PNG.to_vec()), Some("s-1"), true))
        .await;
    assert!(!outcome.failed);
    assert_eq!(outcome.text, "A null pointer.");

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    let fields = &requests[0].fields;
    assert_eq!(fields["query"], "what is this error?");
    assert_eq!(fields["complexity"], "High");
    assert_eq!(fields["response_format"], "speech");
    assert_eq!(fields["has_screenshot"], "true");
    assert_eq!(fields["tts_enabled"], "true");
    assert_eq!(fields["sessionId"], "s-1");

    let shot = requests[0].screenshot.clone().unwrap();
    assert_eq!(shot.file_name.as_deref(), Some("screenshot.png"));
    assert_eq!(shot.content_type.as_deref(), Some("image/png"));
    assert_eq!(shot.bytes, FAKE_PNG);
}

#[tokio::test]
async fn optional_parts_are_omitted() {
    let mock = start_mock(Reply::ok(r#"{"text": "fallback field"}"#)).await;
    let client = WorkflowClient::new(Duration::from_secs(5)).unwrap();

    let outcome = client.dispatch(&mock.url, request(None, None, false)).await;
    assert_eq!(outcome.text, "fallback field");

    let captured = &mock.requests()[0];
    assert_eq!(captured.fields["response_format"], "markdown");
    assert_eq!(captured.fields["has_screenshot"], "false");
    assert!(!captured.fields.contains_key("sessionId"));
    assert!(captured.screenshot.is_none());
}

#[tokio::test]
async fn plain_text_reply_is_used_verbatim() {
    let mock = start_mock(Reply::ok("Just words, no JSON.")).await;
    let client = WorkflowClient::new(Duration::from_secs(5)).unwrap();
    let outcome = client.dispatch(&mock.url, request(None, None, false)).await;
    assert!(!outcome.failed);
    assert_eq!(outcome.text, "Just words, no JSON.");
}

#[tokio::test]
async fn non_success_status_becomes_error_text() {
    let mock = start_mock(Reply::status(503, "workflow paused")).await;
    let client = WorkflowClient::new(Duration::from_secs(5)).unwrap();
    let outcome = client.dispatch(&mock.url, request(None, None, false)).await;
    assert!(outcome.failed);
    assert_eq!(
        outcome.text,
        "Error: workflow returned HTTP 503: workflow paused"
    );
}

#[tokio::test]
async fn timeout_becomes_error_text() {
    let mock = start_mock(Reply::ok("late").delayed(Duration::from_secs(3))).await;
    let client = WorkflowClient::new(Duration::from_millis(200)).unwrap();
    let outcome = client.dispatch(&mock.url, request(None, None, false)).await;
    assert!(outcome.failed);
    assert!(outcome.text.starts_with("Error: request failed"));
}
