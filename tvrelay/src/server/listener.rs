//! HTTP listener for viewer connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{
        header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, LOCATION, USER_AGENT},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::server::session::{ResponseHead, ViewerResponse, ViewerSession};
use crate::tuner::key::ViewerKey;
use crate::web::{self, WebState};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

/// The HTTP server: stream endpoint plus the status API.
pub struct Server {
    config: ServerConfig,
    state: Arc<WebState>,
}

impl Server {
    pub fn new(config: ServerConfig, state: Arc<WebState>) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/stream/:token", get(stream_channel))
            .merge(web::routes())
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Run the server until ctrl-c.
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Server listening on http://{}", self.config.listen_addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
    }
}

/// `GET /stream/:token`
async fn stream_channel(
    State(state): State<Arc<WebState>>,
    Path(token): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let Some(request) = state.resolver.resolve(&token) else {
        debug!("Unknown stream token {}", token);
        return (StatusCode::NOT_FOUND, "unknown channel").into_response();
    };

    let ip = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let id = state.next_viewer_id();
    let (session, response) = ViewerSession::new(
        id,
        ViewerKey::new(ip, user_agent),
        Arc::clone(&state.registry),
        state.placeholder.clone(),
    );
    tokio::spawn(session.run(request));

    let ViewerResponse { head, body } = response;
    match head.await {
        Ok(ResponseHead::Redirect(url)) => (StatusCode::FOUND, [(LOCATION, url)]).into_response(),
        Ok(ResponseHead::Live { content_type }) => stream_response(content_type, body),
        Ok(ResponseHead::Placeholder) => stream_response("video/mp2t", body),
        Ok(ResponseHead::Failed(e)) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "stream unavailable").into_response(),
    }
}

fn stream_response(content_type: &'static str, body: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(body).map(Ok::<_, io::Error>);
    (
        [
            (CONTENT_TYPE, content_type),
            (CONNECTION, "close"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::default_placeholder;
    use crate::test_helpers::{test_directory, test_registry, ScriptedLauncher};
    use axum::http::Request;
    use tower::ServiceExt;
    use tvrelay_protocol::ChannelRequest;

    fn server(tuner_limit: usize) -> Server {
        let registry = test_registry(Arc::new(ScriptedLauncher::new()), tuner_limit);
        let resolver = test_directory(tuner_limit)
            .with_channel("1001", ChannelRequest::new("M1", "http://src/ch1", "Ch 1"))
            .with_channel("9001", ChannelRequest::new("DIRECT", "http://src/ch9", "Ch 9"));
        let state = Arc::new(WebState::new(
            registry,
            Arc::new(resolver),
            default_placeholder(),
        ));
        Server::new(
            ServerConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
            },
            state,
        )
    }

    async fn get(server: &Server, uri: &str) -> Response {
        server
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_counts() {
        let server = server(1);
        let response = get(&server, "/api/status").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["active_playlists"], 0);
        assert_eq!(value["active_viewers"], 0);
    }

    #[tokio::test]
    async fn test_unknown_token_is_404() {
        let server = server(1);
        let response = get(&server, "/stream/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unbuffered_channel_redirects() {
        let server = server(1);
        let response = get(&server, "/stream/9001").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "http://src/ch9");
    }

    #[tokio::test]
    async fn test_buffered_channel_streams() {
        let server = server(1);
        let response = get(&server, "/stream/1001").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp2t");
        assert_eq!(response.headers()[CONNECTION], "close");

        let status = get(&server, "/api/status").await;
        let body = axum::body::to_bytes(status.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["active_playlists"], 1);
        assert_eq!(value["active_viewers"], 1);

        let streams = get(&server, "/api/streams").await;
        let body = axum::body::to_bytes(streams.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["stream_count"], 1);
        assert_eq!(value["sessions"][0]["streams"][0]["url"], "http://src/ch1");

        drop(response);
    }
}
