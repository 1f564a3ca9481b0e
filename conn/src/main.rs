use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use conn::config::NodeConfig;
use conn::engine::driver::RaftDriver;
use conn::engine::storage::MemStore;
use conn::engine::StateMachine;
use conn::raft_client::GrpcTransport;
use conn::raft_service::RaftService;
use conn::{metrics, Node};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs one raft group member")]
struct Args {
    /// Path to the node config
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// Keeps nothing but the position of the log it has seen.
#[derive(Default)]
struct LogStateMachine {
    last_applied: u64,
}

impl StateMachine for LogStateMachine {
    fn apply(&mut self, index: u64, data: &[u8]) {
        self.last_applied = index;
        log::info!("Applied entry {} ({} bytes)", index, data.len());
    }

    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]) {
        log::info!(
            "Restored snapshot at index {} term {} ({} bytes), was at {}",
            last_index,
            last_term,
            data.len(),
            self.last_applied
        );
        self.last_applied = last_index;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
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
                log::error!("Failed to install signal handler: {}", e);
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
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = NodeConfig::from_toml(&args.config)?;
    metrics::init_registry();

    let store = if config.bootstrap {
        MemStore::bootstrap(&[config.id])?
    } else {
        MemStore::new()
    };
    let node = Node::new(
        config.raft_context(),
        Arc::new(store.clone()),
        Arc::new(GrpcTransport::new()),
        config.message_queue_size,
    )?;
    let (snapshot_index, restart) = node.past_life()?;
    log::info!(
        "Starting node {:#x}, restart: {}, snapshot index: {}",
        node.id,
        restart,
        snapshot_index
    );
    for peer in &config.peers {
        node.connect(peer.id, &peer.addr)?;
    }

    let closer = CancellationToken::new();
    let (_handle, driver) = RaftDriver::start(
        node.clone(),
        store,
        LogStateMachine::default(),
        &config,
        closer.clone(),
    )?;

    let addr: SocketAddr = config.addr.parse()?;
    let grpc_closer = closer.clone();
    let grpc = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(RaftService::new(node.clone()).into_server())
            .serve_with_shutdown(addr, async move { grpc_closer.cancelled().await }),
    );
    log::info!("grpc server started on {}", addr);

    if let Some(metrics_addr) = config.metrics_addr.as_deref() {
        let metrics_addr: SocketAddr = metrics_addr.parse()?;
        tokio::spawn(metrics::serve(metrics_addr, closer.clone()));
    }

    shutdown_signal().await;
    log::info!("server stop");
    closer.cancel();
    if let Err(e) = driver.await {
        log::error!("raft driver panicked: {}", e);
    }
    match grpc.await {
        Ok(Err(e)) => log::error!("grpc server failed: {}", e),
        Err(e) => log::error!("grpc server panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
