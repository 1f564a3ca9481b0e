//! Metrics collection for the raft connection layer
//!
//! Counters are registered in a process-wide Prometheus registry and can be
//! served in the text exposition format with [`serve`].

use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Raft batches handed to the transport, by outcome
    pub static ref RAFT_BATCH_COUNTER_VEC: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_batches", "raft message batches sent to peers"),
        &["result"]
    )
    .unwrap();

    pub static ref RAFT_BATCH_BYTES: IntCounter =
        IntCounter::new("raft_batch_bytes", "framed raft bytes sent to peers").unwrap();

    pub static ref READ_INDEX_ROUNDS: IntCounter =
        IntCounter::new("read_index_rounds", "read index requests issued to raft").unwrap();

    pub static ref CONF_CHANGE_RETRIES: IntCounter =
        IntCounter::new("conf_change_retries", "conf change proposals retried").unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_BATCH_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RAFT_BATCH_BYTES.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(READ_INDEX_ROUNDS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CONF_CHANGE_RETRIES.clone()));
}

/// Renders the registry in the text exposition format.
pub fn encode() -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY_INSTANCE.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Serves the registry on `addr` until `closer` fires.
pub async fn serve(addr: SocketAddr, closer: CancellationToken) {
    let make_svc = make_service_fn(|_| async {
        Ok::<_, hyper::Error>(service_fn(|_: Request<Body>| async {
            match encode() {
                Ok(buffer) => Ok::<_, hyper::Error>(Response::new(Body::from(buffer))),
                Err(e) => {
                    log::error!("{}", e);
                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        }))
    });
    let server = match hyper::Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            log::error!("Unable to bind metrics server on {}: {}", addr, e);
            return;
        }
    };
    log::info!("metrics server started on {}", addr);
    if let Err(e) = server
        .with_graceful_shutdown(async move { closer.cancelled().await })
        .await
    {
        log::error!("metrics server failed: {}", e);
    }
}
