use std::sync::Arc;

use axum::extract::State;
use axum::Router;
use tokio::sync::RwLock;

use vulnwatch::Store;

/// Connect to the test database named by DATABASE_URL and bring the schema
/// up to date. Returns None (and the caller skips) when no database is
/// available.
pub async fn test_store() -> Option<Store> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping integration test");
        return None;
    };
    let store = Store::connect(&url).await.expect("failed to connect");
    store.migrate().await.expect("failed to run migrations");
    Some(store)
}

pub type SharedBody = Arc<RwLock<String>>;

pub fn shared_body(initial: &str) -> SharedBody {
    Arc::new(RwLock::new(initial.to_string()))
}

/// Serve a mutable document at every path on an ephemeral local port.
/// Returns the base URL of the mock upstream.
pub async fn serve_document(body: SharedBody) -> String {
    let app = Router::new().fallback(serve_body).with_state(body);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock server");
    let addr = listener.local_addr().expect("mock server address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server failed");
    });
    format!("http://{addr}")
}

async fn serve_body(State(body): State<SharedBody>) -> String {
    body.read().await.clone()
}

/// Serve a router on an ephemeral local port; for mocks that need to vary
/// their response by query parameters.
pub async fn serve_router(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock server");
    let addr = listener.local_addr().expect("mock server address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server failed");
    });
    format!("http://{addr}")
}
