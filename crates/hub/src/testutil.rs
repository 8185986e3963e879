//! Fake HTTP peers for tests: stand-ins for the advisory agent and the
//! notification relay, served by axum on an ephemeral local port.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// (destination id, body) pairs received by the fake relay.
pub(crate) type Deliveries = Arc<Mutex<Vec<(String, String)>>>;

/// Serve `router` on 127.0.0.1 and return its base URL.
pub(crate) async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL nothing is listening on.
pub(crate) async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub(crate) async fn fake_relay() -> (String, Deliveries) {
    let deliveries: Deliveries = Arc::default();
    let router = Router::new()
        .route(
            "/{target}",
            post(
                |State(d): State<Deliveries>, Path(target): Path<String>, body: String| async move {
                    d.lock().await.push((target, body));
                    "ok"
                },
            ),
        )
        .with_state(Arc::clone(&deliveries));
    (serve(router).await, deliveries)
}
