//! HTTP server for the gateway.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{handle, GatewayState};
use crate::error::{GatewayError, Result};

/// HTTP server fronting the upstream origin.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared request state
    state: GatewayState,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(addr: SocketAddr, state: GatewayState) -> Self {
        Self { addr, state }
    }

    /// The router serving every path through the admission handler.
    pub fn router(state: GatewayState) -> Router {
        Router::new().fallback(handle).with_state(state)
    }

    /// Bind the listener. Failing to bind is fatal.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Could not bind listener");
            GatewayError::Io(e)
        })
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(addr = %listener.local_addr()?, "Gateway listening");

        let app = Self::router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "Gateway server failed");
            GatewayError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, Response, StatusCode};
    use axum::response::IntoResponse;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::gateway::Forwarder;
    use crate::ratelimit::{
        MemoryStore, PacingPolicy, RateController, RateLimiter, RemoteAddr, SlidingWindow,
        DEFAULT_NAMESPACE,
    };

    struct EchoForwarder;

    #[async_trait]
    impl Forwarder for EchoForwarder {
        async fn forward(&self, request: Request<Body>, client: IpAddr) -> Result<Response<Body>> {
            Ok((StatusCode::OK, format!("{} from {}", request.uri().path(), client))
                .into_response())
        }
    }

    fn test_state(ceiling: u64) -> GatewayState {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            DEFAULT_NAMESPACE,
            SlidingWindow::default(),
            ceiling,
        );
        GatewayState::new(
            Arc::new(RateController::new(limiter)),
            PacingPolicy::default(),
            Arc::new(EchoForwarder),
            Arc::new(RemoteAddr),
        )
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = GatewayServer::new(taken.local_addr().unwrap(), test_state(5));
        assert!(matches!(server.bind().await, Err(GatewayError::Io(_))));
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let server = GatewayServer::new(addr, test_state(500));
        let task = tokio::spawn(server.serve_on(listener, async {
            let _ = stopped.await;
        }));

        let response = raw_request(
            addr,
            "GET /rem HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("Remaining: 500, should sleep for 0ns\n"));

        let response = raw_request(
            addr,
            "GET /haha HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("/haha from 127.0.0.1"));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
