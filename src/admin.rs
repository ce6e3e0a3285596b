use crate::error::{json_error_response, ErrorCode};
use crate::instance::{instance_key, LaunchOptions};
use crate::registry::InstanceRegistry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the manager
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

/// Body of `POST /instances`
#[derive(Debug, Deserialize)]
struct LaunchRequest {
    project_path: String,
    model: Option<String>,
    /// Wait for readiness before answering
    #[serde(default)]
    wait: bool,
}

/// Control API server over an instance registry
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<InstanceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<InstanceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, registry, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    registry: Arc<InstanceRegistry>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, registry, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Build an instance key from `?project=<path>&model=<name>`
fn key_from_query(query: Option<&str>) -> Option<String> {
    let mut project = None;
    let mut model = None;

    for pair in query?.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        // Form encoding uses '+' for spaces
        let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
        match name {
            "project" => project = Some(value),
            "model" => model = Some(value),
            _ => {}
        }
    }

    let project = project.filter(|p| !p.is_empty())?;
    let model = model.filter(|m| !m.is_empty());
    Some(instance_key(&project, model.as_deref()))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    registry: Arc<InstanceRegistry>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!(%method, %path, "Control API request");

    let response = match (&method, path.as_str()) {
        // Health check for the control API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint (no auth required)
        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        _ if !check_auth(&req, &auth_token) => {
            warn!(%path, "Unauthorized control API request");
            json_error_response(ErrorCode::Unauthorized, "unauthorized")
        }

        (&Method::GET, "/instances") => {
            let instances = registry.list_instances();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "count": instances.len(),
                    "instances": instances,
                }),
            )
        }

        (&Method::POST, "/instances") => launch_instance(req, &registry).await,

        (&Method::DELETE, "/instances") => {
            let stopped = registry.stop_all();
            info!(stopped, "All instances stopped via control API");
            json_response(StatusCode::OK, serde_json::json!({ "stopped": stopped }))
        }

        (&Method::GET, "/instance") => match key_from_query(query.as_deref()) {
            None => json_error_response(ErrorCode::BadRequest, "missing 'project' query parameter"),
            Some(key) => match registry.get_instance(&key) {
                Some(instance) => json_response(StatusCode::OK, serde_json::json!(instance)),
                None => json_error_response(
                    ErrorCode::InstanceNotFound,
                    format!("No instance registered for '{}'", key),
                ),
            },
        },

        (&Method::DELETE, "/instance") => match key_from_query(query.as_deref()) {
            None => json_error_response(ErrorCode::BadRequest, "missing 'project' query parameter"),
            Some(key) => {
                let stopped = registry.stop(&key);
                json_response(
                    StatusCode::OK,
                    serde_json::json!({ "key": key, "stopped": stopped }),
                )
            }
        },

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

async fn launch_instance(
    req: Request<Incoming>,
    registry: &Arc<InstanceRegistry>,
) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(
                ErrorCode::BadRequest,
                format!("failed to read body: {}", e),
            )
        }
    };

    let request: LaunchRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_error_response(ErrorCode::BadRequest, format!("invalid body: {}", e))
        }
    };

    let key = instance_key(&request.project_path, request.model.as_deref());
    let options = LaunchOptions {
        model: request.model.clone(),
    };

    let result = if request.wait {
        registry
            .launch_and_wait(&key, &request.project_path, options)
            .await
    } else {
        registry.launch(&key, &request.project_path, options).await
    };

    match result {
        Ok(port) => {
            info!(key = %key, port, "Instance launched via control API");
            json_response(StatusCode::OK, serde_json::json!({ "key": key, "port": port }))
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Launch via control API failed");
            e.to_response()
        }
    }
}
