//! Status HTTP endpoint: datapath counters and liveness.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::metrics::Metrics;

/// Served routes, one row per path: content type plus a body builder over
/// the shared counters.
const ROUTES: &[(&str, &str, fn(&Metrics) -> String)] = &[
    ("/metrics", "text/plain; version=0.0.4", prometheus_body),
    ("/healthz", "text/plain", health_body),
];

fn prometheus_body(metrics: &Metrics) -> String {
    metrics.to_prometheus()
}

fn health_body(_: &Metrics) -> String {
    "ok\n".to_string()
}

fn respond(path: &str, metrics: &Metrics) -> Response<String> {
    for (route, content_type, body) in ROUTES {
        if *route == path {
            return Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, *content_type)
                .body(body(metrics))
                .unwrap();
        }
    }
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(String::new())
        .unwrap()
}

/// Accept loop for the status endpoint. Runs until the listener dies.
pub async fn serve_status(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!("status endpoint on port {} (/metrics, /healthz)", port);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(serve_connection(stream, peer, Arc::clone(&metrics)));
            }
            Err(e) => warn!("status accept failed: {}", e),
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, metrics: Arc<Metrics>) {
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let response = respond(req.uri().path(), &metrics);
        async move { Ok::<_, Infallible>(response) }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("status connection from {} ended with error: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_route_serves_counters() {
        let metrics = Metrics::new();
        metrics.inc_egress();
        let resp = respond("/metrics", &metrics);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain; version=0.0.4");
        assert!(resp.body().contains("ztp_packets_egress_total 1"));
    }

    #[test]
    fn health_route_reports_ok() {
        let resp = respond("/healthz", &Metrics::new());
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "ok\n");
    }

    #[test]
    fn unknown_paths_are_not_found() {
        let resp = respond("/nope", &Metrics::new());
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.body().is_empty());
    }
}
