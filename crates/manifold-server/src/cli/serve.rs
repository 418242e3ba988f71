// crates/manifold-server/src/cli/serve.rs
// Server assembly and the stdio serve loop

use anyhow::Result;
use manifold::config::{self, EnvConfig, Profile};
use manifold::downstream::ConnectionManager;
use manifold::embeddings::EmbeddingClient;
use manifold::error::ManifoldError;
use manifold::gate::ConfirmationGate;
use manifold::index::CapabilityIndex;
use manifold::mcp::ManifoldServer;
use std::sync::Arc;
use tracing::info;

/// Build the full server context for a profile. Shared by `serve` and
/// `reindex`; `ignore_cache` skips the warm-cache load for rebuilds.
pub(crate) async fn build_server(profile_name: &str, ignore_cache: bool) -> Result<ManifoldServer> {
    let env_config = EnvConfig::load();
    env_config.validate().log_warnings();

    let profile_path = config::profile_path(profile_name);
    let profile = Arc::new(Profile::load(&profile_path)?);
    info!(
        profile = profile_name,
        downstreams = profile.downstreams.len(),
        "Profile loaded"
    );

    // An unwritable cache directory is fatal at startup, not a
    // surprise at the first save
    let cache_dir = config::cache_csv_path(profile_name)
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(config::data_dir);
    std::fs::create_dir_all(&cache_dir).map_err(|e| {
        ManifoldError::Fatal(format!(
            "cache directory {} is not writable: {e}",
            cache_dir.display()
        ))
    })?;

    let embeddings = Arc::new(EmbeddingClient::from_config(&env_config.embeddings));
    info!(model = %embeddings.model_id(), "Embedding backend selected");

    let index = Arc::new(CapabilityIndex::new(
        config::cache_csv_path(profile_name),
        config::cache_meta_path(profile_name),
        profile.content_hash(),
        embeddings.model_id(),
    ));
    if !ignore_cache && index.load() {
        info!(tools = index.snapshot().records.len(), "Warm start");
    }

    let gate = Arc::new(ConfirmationGate::new(&embeddings, profile.gate_enabled).await?);
    if !profile.gate_enabled {
        info!("Confirmation gate disabled by profile");
    }

    let connections = ConnectionManager::new(profile.clone(), config::logs_dir());

    Ok(ManifoldServer::new(
        profile,
        index,
        embeddings,
        gate,
        connections,
    ))
}

/// Run the MCP server over stdio until the upstream disconnects.
pub async fn run(profile_name: &str) -> Result<()> {
    let server = build_server(profile_name, false).await?;
    let connections = server.connections.clone();
    let index = server.index.clone();

    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;

    tokio::select! {
        outcome = service.waiting() => {
            outcome?;
            info!("Upstream disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    // Drain children and flush the cache inside the shutdown budget
    connections.shutdown().await;
    if let Err(e) = index.save() {
        tracing::warn!("Final cache save failed: {e}");
    }
    Ok(())
}
