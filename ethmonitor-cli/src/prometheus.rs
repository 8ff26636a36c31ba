//! Prometheus metrics HTTP endpoint, following `block-watcher`'s
//! `prometheus` module: a tiny `hyper` server that serves the process's
//! default registry on every request.

use std::net::SocketAddr;

use anyhow::Result as AnyResult;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use prometheus::{Encoder, TextEncoder};
use structopt::StructOpt;
use tracing::{error, info};

#[derive(Clone, Debug, StructOpt)]
pub struct Options {
    /// Address the Prometheus metrics endpoint binds to.
    #[structopt(long, env = "PROMETHEUS_ADDRESS", default_value = "0.0.0.0:9998")]
    pub prometheus_address: SocketAddr,
}

async fn serve_metrics(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        error!(?err, "failed to encode metrics");
        return Ok(Response::builder().status(500).body(Body::empty()).unwrap());
    }
    Ok(Response::builder()
        .header("content-type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Runs the metrics endpoint until the process exits. Intended to be
/// `tokio::spawn`ed alongside the monitor loop.
pub async fn main(options: Options) -> AnyResult<()> {
    let make_svc = make_service_fn(|_conn| async { Ok::<_, hyper::Error>(service_fn(serve_metrics)) });
    info!(address = %options.prometheus_address, "serving prometheus metrics");
    Server::bind(&options.prometheus_address).serve(make_svc).await?;
    Ok(())
}
