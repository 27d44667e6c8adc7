//! Serve command - run a cache node

use crate::cli::args::ServeArgs;
use crate::cli::commands::teardown::{teardown_request_path, validate_service_id};
use crate::config::{is_plain_name, Config};
use crate::error::{MeshError, MeshResult};
use crate::lifecycle::ServiceLifecycle;
use crate::node::CacheNode;
use crate::ui;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

const TEARDOWN_POLL: Duration = Duration::from_secs(1);

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> MeshResult<()> {
    let mut config = config.clone();
    if let Some(stamp) = args.stamp {
        if !is_plain_name(&stamp) {
            return Err(MeshError::InvalidStamp(stamp));
        }
        config.node.stamp = stamp;
    }
    if let Some(machine) = args.machine {
        config.node.machine = Some(machine);
    }
    let service_id = args
        .service_id
        .or_else(|| config.node.service_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    validate_service_id(&service_id)?;

    let node = Arc::new(CacheNode::from_config(&config)?);
    let lifecycle = Arc::new(
        ServiceLifecycle::new(service_id.clone(), node.clone())
            .with_shutdown_timeout(Duration::from_secs(config.node.shutdown_timeout_minutes * 60)),
    );

    ui::section("casmesh node");
    ui::key_value("service id", &service_id);
    ui::key_value("stamp", node.stamp());
    ui::key_value("machine", node.machine().as_str());
    ui::key_value("data root", &config.data_root().display().to_string());

    let interrupt = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                lifecycle.request_shutdown();
            }
        })
    };
    let watcher = tokio::spawn(watch_teardown_requests(
        lifecycle.clone(),
        config.data_root(),
    ));

    let result = lifecycle.run().await;
    interrupt.abort();
    watcher.abort();
    result?;

    ui::step_ok("Node stopped");
    Ok(())
}

async fn watch_teardown_requests(lifecycle: Arc<ServiceLifecycle>, data_root: PathBuf) {
    let service_id = lifecycle.service_id().to_string();
    let path = teardown_request_path(&data_root, &service_id);
    let mut stop = lifecycle.shutdown_signal();
    let mut ticker = tokio::time::interval(TEARDOWN_POLL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.wait() => break,
        }
        if fs::metadata(&path).await.is_err() {
            continue;
        }
        if let Err(e) = fs::remove_file(&path).await {
            warn!("Failed to clear teardown request {}: {}", path.display(), e);
        }
        if lifecycle.request_teardown(&service_id) {
            info!(service_id, "Teardown request accepted");
        }
    }
}
