#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handler signature used by the mock target: (path, headers, body) -> response.
pub type Respond = Arc<dyn Fn(&str, &HeaderMap, &str) -> Response + Send + Sync>;

/// Every request the mock target received, in arrival order.
#[derive(Clone, Default)]
pub struct Received {
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl Received {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct TargetState {
    received: Received,
    respond: Respond,
    barrier: Option<Arc<tokio::sync::Barrier>>,
}

pub struct MockTarget {
    pub url: String,
    pub received: Received,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MockTarget {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// An address nothing is listening on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/testpost", port)
}

/// Spawn a target that answers every request with `respond`.
pub async fn spawn_target<F>(respond: F) -> MockTarget
where
    F: Fn(&str, &HeaderMap, &str) -> Response + Send + Sync + 'static,
{
    spawn(Arc::new(respond), None).await
}

/// Spawn a target that holds each request until `parties` requests are in flight.
pub async fn spawn_rendezvous_target<F>(parties: usize, respond: F) -> MockTarget
where
    F: Fn(&str, &HeaderMap, &str) -> Response + Send + Sync + 'static,
{
    spawn(
        Arc::new(respond),
        Some(Arc::new(tokio::sync::Barrier::new(parties))),
    )
    .await
}

async fn spawn(respond: Respond, barrier: Option<Arc<tokio::sync::Barrier>>) -> MockTarget {
    let received = Received::default();
    let state = TargetState {
        received: received.clone(),
        respond,
        barrier,
    };

    let app = Router::new().fallback(handle).with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock target listener");
    let port = listener.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock target server error: {}", err);
        }
    });

    MockTarget {
        url: format!("http://127.0.0.1:{}/testpost", port),
        received,
        shutdown_tx,
        handle,
    }
}

async fn handle(
    State(state): State<TargetState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = String::from_utf8_lossy(&body).into_owned();
    state.received.hits.fetch_add(1, Ordering::SeqCst);
    state.received.bodies.lock().unwrap().push(body.clone());

    if let Some(barrier) = &state.barrier {
        barrier.wait().await;
    }

    (state.respond)(uri.path(), &headers, &body)
}

/// Plain response with an optional extra header.
pub fn reply(status: u16, body: &str, header: Option<(&'static str, &'static str)>) -> Response {
    let status = StatusCode::from_u16(status).expect("valid status code");
    let mut response = (status, body.to_string()).into_response();
    if let Some((name, value)) = header {
        response
            .headers_mut()
            .insert(name, axum::http::HeaderValue::from_static(value));
    }
    response
}
