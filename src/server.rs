use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, ServerError};
use crate::listing::PageRenderer;
use crate::paths::PathResolver;
use crate::storage::Storage;
use crate::{handlers, listing, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Goes `Created -> Listening -> ShuttingDown -> Stopped`.
///
/// [`Server::bind`] opens the socket and spawns the accept loop on its own task. The returned
/// [`Listening`] handle waits for a stop signal, then gives in-flight requests
/// `shutdown_timeout` to finish before they are cancelled.
pub struct Server {
    config: Config,
    renderer: Arc<dyn PageRenderer>,
    lifecycle: watch::Sender<Lifecycle>,
    force_close: watch::Sender<bool>,
}

impl Server {
    pub fn new(config: Config, renderer: Arc<dyn PageRenderer>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        let (force_close, _) = watch::channel(false);
        Self {
            config,
            renderer,
            lifecycle,
            force_close,
        }
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn router(&self) -> Router {
        let storage = Storage::new(PathResolver::new(self.config.work_dir.clone()));
        let state = Arc::new(AppState {
            storage,
            config: self.config.clone(),
            renderer: Arc::clone(&self.renderer),
        });

        let app = Router::new()
            .merge(listing::routes())
            .merge(handlers::routes())
            .fallback(handlers::route_not_found)
            .layer(middleware::from_fn_with_state(
                self.force_close.subscribe(),
                cancel_on_force_close,
            ))
            // Upload size is enforced while streaming each part.
            .layer(DefaultBodyLimit::disable())
            .layer(TimeoutLayer::new(self.config.write_timeout))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if self.config.cors_enabled() {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    /// Bind the configured address and start accepting connections.
    pub async fn bind(self) -> Result<Listening, ServerError> {
        let addr = self.config.addr.as_str();
        let bind_error = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let app = self.router();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        self.lifecycle.send_replace(Lifecycle::Listening);
        info!(addr = %local_addr, root = %self.config.work_dir.display(), "listening");

        Ok(Listening {
            local_addr,
            task,
            stop: Some(stop_tx),
            shutdown_timeout: self.config.shutdown_timeout,
            lifecycle: self.lifecycle,
            force_close: self.force_close,
        })
    }
}

/// Each request runs until it completes or the drain period runs out, whichever is first.
/// A cancelled handler is dropped, so its in-progress upload is removed.
async fn cancel_on_force_close(
    State(mut force_close): State<watch::Receiver<bool>>,
    request: Request,
    next: Next,
) -> Response {
    let forced = async move {
        let closed = force_close.wait_for(|closed| *closed).await.is_ok();
        if !closed {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        response = next.run(request) => response,
        _ = forced => AppError::ShuttingDown.into_response(),
    }
}

/// A bound, serving server.
pub struct Listening {
    local_addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
    stop: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
    lifecycle: watch::Sender<Lifecycle>,
    force_close: watch::Sender<bool>,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `signal` resolves, then drain. An accept loop that ends on its own
    /// before the signal is reported as an error.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            finished = &mut self.task => {
                self.lifecycle.send_replace(Lifecycle::Stopped);
                return match finished {
                    Ok(Ok(())) => Err(ServerError::Serve(std::io::Error::other(
                        "accept loop exited without a shutdown request",
                    ))),
                    Ok(Err(e)) => Err(ServerError::Serve(e)),
                    Err(join) => Err(ServerError::Serve(std::io::Error::other(join))),
                };
            }
            _ = signal => {}
        }
        self.shutdown().await
    }

    /// Stop accepting and wait up to the shutdown timeout for in-flight requests. Requests
    /// still running after that are cancelled with a 503 and their connections close.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        self.lifecycle.send_replace(Lifecycle::ShuttingDown);
        info!(timeout = ?self.shutdown_timeout, "shutting down");
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        let result = match tokio::time::timeout(self.shutdown_timeout, &mut self.task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ServerError::Serve(e)),
            Ok(Err(join)) => Err(ServerError::Serve(std::io::Error::other(join))),
            Err(_) => {
                self.force_close.send_replace(true);
                self.task.abort();
                warn!(timeout = ?self.shutdown_timeout, "requests still in flight, forcing close");
                Err(ServerError::ShutdownTimeout(self.shutdown_timeout))
            }
        };

        self.lifecycle.send_replace(Lifecycle::Stopped);
        info!("stopped");
        result
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal");
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use axum::response::Response;
    use axum::Router;

    use crate::config::{Config, ConfigLayer};
    use crate::listing::{HtmlListing, PageRenderer};

    use super::Server;

    pub const BOUNDARY: &str = "dirhost-test-boundary";

    pub fn test_config(dir: &Path, tweak: impl FnOnce(&mut ConfigLayer)) -> Config {
        let mut overrides = ConfigLayer {
            addr: Some("127.0.0.1:0".to_string()),
            work_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        tweak(&mut overrides);
        Config::resolve(ConfigLayer::defaults(), None, overrides).unwrap()
    }

    pub fn test_router(dir: &Path, tweak: impl FnOnce(&mut ConfigLayer)) -> Router {
        Server::new(test_config(dir, tweak), Arc::new(HtmlListing)).router()
    }

    pub fn test_router_with(dir: &Path, renderer: Arc<dyn PageRenderer>) -> Router {
        Server::new(test_config(dir, |_| {}), renderer).router()
    }

    pub async fn read_body(res: Response) -> Vec<u8> {
        axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    pub struct TestPart<'a> {
        name: &'a str,
        file_name: Option<&'a str>,
        data: &'a [u8],
    }

    impl<'a> TestPart<'a> {
        pub fn file(file_name: &'a str, data: &'a [u8]) -> Self {
            Self { name: "file", file_name: Some(file_name), data }
        }

        pub fn text(name: &'a str, value: &'a str) -> Self {
            Self { name, file_name: None, data: value.as_bytes() }
        }
    }

    pub fn multipart_body(parts: &[TestPart<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        part.name, file_name
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
                ),
            }
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    pub fn multipart_request(parts: &[TestPart<'_>]) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }
}
