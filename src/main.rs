use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weft::{FetchError, Gateway, GatewayConfig, swapi};

#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Relational RPC query gateway")]
struct Args {
    /// Gateway configuration (YAML). Without it the bundled demo catalog is served.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Serve the bundled Star Wars catalog in process.
    #[arg(long, conflicts_with = "config")]
    demo: bool,
}

type ResponseBody = BoxBody<Bytes, hyper::Error>;

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(body.to_string()))
        .unwrap_or_else(|_| internal_server_error())
}

fn error_response(status: StatusCode, error: &FetchError) -> Response<ResponseBody> {
    json_response(status, &json!({ "errors": [error.to_marker()] }))
}

/// Rejected queries map to 400; upstream failures to 502 and 504.
fn status_of(error: &FetchError) -> StatusCode {
    match error {
        FetchError::ParseError { .. }
        | FetchError::UnknownOperation { .. }
        | FetchError::UnknownField { .. }
        | FetchError::LimitExceeded { .. } => StatusCode::BAD_REQUEST,
        FetchError::Transport(_) => StatusCode::BAD_GATEWAY,
        FetchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::OK,
    }
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<ResponseBody>, Infallible> {
    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/fetch") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                        .body(full("Failed to read request body"))
                        .unwrap_or_else(|_| internal_server_error()));
                }
            };

            match serde_json::from_slice::<Value>(&body_bytes) {
                Ok(literal) => match gateway.process_request(&literal).await {
                    Ok(data) => json_response(StatusCode::OK, &json!({ "data": data })),
                    Err(e) => {
                        warn!(error = %e, "query failed");
                        error_response(status_of(&e), &e)
                    }
                },
                Err(e) => {
                    let error = FetchError::ParseError {
                        path: "$".to_string(),
                        message: format!("invalid JSON request: {}", e),
                    };
                    error_response(StatusCode::BAD_REQUEST, &error)
                }
            }
        }

        (&Method::GET, "/") => json_response(
            StatusCode::OK,
            &json!({ "services": gateway.registry().services() }),
        ),

        (&Method::OPTIONS, _) => Response::builder()
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

// Create a standard internal server error response
fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

fn build_gateway(args: &Args) -> Result<Gateway, FetchError> {
    match &args.config {
        Some(path) => {
            let mut config = GatewayConfig::load(path)?;
            config.apply_env_overrides()?;
            info!(config = %path.display(), "loaded gateway configuration");
            Gateway::from_config(&config)
        }
        None => {
            let mut config = swapi::config()?;
            config.apply_env_overrides()?;
            let transport = swapi::transport()?;
            info!("serving the bundled demo catalog");
            Ok(Gateway::new(
                Arc::new(swapi::registry()?),
                Arc::new(transport),
                config.resolver_config(),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let gateway = match build_gateway(&args) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            return Err(e.into());
        }
    };

    let addr = SocketAddr::from((args.bind, args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "weft gateway listening, POST queries to /fetch");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway_clone = Arc::clone(&gateway);

        let executor = TokioExecutor;

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(executor)
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "error processing connection");
            }
        });
    }
}
