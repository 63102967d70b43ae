use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tracing::info;

use super::Registry;

pub const HEALTH_PATH: &str = "/health";

fn respond(req: &Request<Body>, registry: &Registry, metrics_path: &str) -> Response<Body> {
    let path = req.uri().path();
    let (status, body) = if path == metrics_path {
        (StatusCode::OK, Body::from(registry.snapshot()))
    } else if path == HEALTH_PATH {
        (StatusCode::OK, Body::empty())
    } else {
        (StatusCode::NOT_FOUND, Body::from("not found"))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Binds the metrics listener and returns its address with the server future.
pub fn bind_metrics(
    addr: SocketAddr,
    metrics_path: String,
    registry: Arc<Registry>,
) -> Result<(SocketAddr, BoxFuture<'static, Result<(), hyper::Error>>), hyper::Error> {
    let metrics_path = Arc::new(metrics_path);
    let path_for_log = Arc::clone(&metrics_path);
    let make_svc = make_service_fn(move |_conn| {
        let registry = Arc::clone(&registry);
        let metrics_path = Arc::clone(&metrics_path);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let response = respond(&req, &registry, &metrics_path);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    info!("Serving metrics at {} {}", local_addr, path_for_log);
    Ok((local_addr, server.boxed()))
}

/// Serves the registry at `metrics_path` and a liveness probe at `/health`.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics_path: String,
    registry: Arc<Registry>,
) -> Result<(), hyper::Error> {
    let (_, server) = bind_metrics(addr, metrics_path, registry)?;
    server.await
}
