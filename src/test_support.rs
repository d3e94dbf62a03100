//! Local HTTP responder used as a mocked target in tests.

use axum::{extract::Path, http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;

/// Serve a responder on an ephemeral port and return its address.
///
/// - `/` answers 200
/// - `/status/{code}` answers with `code`
/// - `/slow` answers 200 after 5 seconds
pub async fn spawn_responder() -> SocketAddr {
    let app = Router::new()
        .route("/", get(|| async { StatusCode::OK }))
        .route(
            "/status/{code}",
            get(|Path(code): Path<u16>| async move {
                StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
