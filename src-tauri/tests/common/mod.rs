#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;

pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-data";

#[derive(Debug, Clone, Default)]
pub struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// One multipart POST as the workflow saw it.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub fields: BTreeMap<String, String>,
    pub screenshot: Option<UploadedFile>,
}

#[derive(Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<Captured>>>,
    reply: Arc<Mutex<Reply>>,
}

/// A local stand-in for the remote workflow webhook.
pub struct MockWorkflow {
    pub url: String,
    requests: Arc<Mutex<Vec<Captured>>>,
    reply: Arc<Mutex<Reply>>,
}

impl MockWorkflow {
    pub fn requests(&self) -> Vec<Captured> {
        self.requests.lock().clone()
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }
}

async fn hook(State(state): State<MockState>, mut multipart: Multipart) -> (StatusCode, String) {
    let mut captured = Captured::default();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "screenshot" {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.unwrap().to_vec();
            captured.screenshot = Some(UploadedFile {
                file_name,
                content_type,
                bytes,
            });
        } else {
            captured.fields.insert(name, field.text().await.unwrap());
        }
    }
    state.requests.lock().push(captured);

    let reply = state.reply.lock().clone();
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    (StatusCode::from_u16(reply.status).unwrap(), reply.body)
}

/// Must be called inside a tokio runtime.
pub async fn start_mock(reply: Reply) -> MockWorkflow {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let reply = Arc::new(Mutex::new(reply));
    let state = MockState {
        requests: requests.clone(),
        reply: reply.clone(),
    };
    let app = Router::new()
        .route("/webhook/peek", post(hook))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockWorkflow {
        url: format!("http://{}:{}/webhook/peek", addr.ip(), addr.port()),
        requests,
        reply,
    }
}
