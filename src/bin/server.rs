use quorum_kv_store::api::{self, ServerConfig};
use quorum_kv_store::{ClusterConfig, Coordinator, LsmConfig, LsmEngine};

use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

fn to_io(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let server_config = ServerConfig::from_env();

    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "./.kvdata".to_string());
    let node_url = env::var("NODE_URL").unwrap_or_else(|_| {
        format!("http://{}:{}", server_config.host, server_config.port)
    });

    let cluster = match env::var("CLUSTER") {
        Ok(list) => ClusterConfig::new(
            list.split(',').map(|s| s.trim().to_string()).collect(),
            node_url,
        ),
        Err(_) => ClusterConfig::standalone(node_url),
    };
    cluster.validate().map_err(to_io)?;

    let lsm_config = LsmConfig::builder()
        .dir_path(PathBuf::from(data_dir))
        .build();
    lsm_config.validate().map_err(to_io)?;

    let engine = Arc::new(LsmEngine::open(lsm_config).map_err(to_io)?);
    let coordinator = Arc::new(
        Coordinator::new(
            Arc::clone(&engine),
            &cluster,
            server_config.request_timeout(),
        )
        .map_err(to_io)?,
    );

    info!(
        "Node {} starting on {}:{} (cluster of {})",
        cluster.self_url,
        server_config.host,
        server_config.port,
        cluster.size()
    );

    let result = api::start_server(Arc::clone(&engine), coordinator, &server_config).await;

    // Flush buffered writes on every exit path before reporting the
    // server's own result.
    engine.close().map_err(to_io)?;
    result
}
