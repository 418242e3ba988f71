// crates/manifold-server/src/cli/reindex.rs
// Forced rebuild of the capability cache

use super::serve::build_server;
use anyhow::Result;
use manifold::background;
use manifold_types::IndexingProgress;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run(profile_name: &str) -> Result<()> {
    let server = build_server(profile_name, true).await?;

    let (progress_tx, mut progress_rx) = watch::channel::<Option<IndexingProgress>>(None);
    let reporter = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            if let Some(p) = progress_rx.borrow_and_update().clone() {
                match &p.current_downstream {
                    Some(name) => eprintln!("[{}/{}] probing {name}...", p.current, p.total),
                    None => eprintln!("[{}/{}]", p.current, p.total),
                }
            }
        }
    });

    background::reconcile(server.clone(), Arc::new(progress_tx)).await;
    reporter.abort();

    let snapshot = server.index.snapshot();
    println!(
        "Indexed {} tools from {} downstreams",
        snapshot.records.len(),
        snapshot.downstream_hashes.len()
    );
    if !snapshot.failed.is_empty() {
        let mut names: Vec<&String> = snapshot.failed.keys().collect();
        names.sort();
        for name in names {
            println!("  failed: {name} ({})", snapshot.failed[name].error);
        }
    }

    server.connections.shutdown().await;
    Ok(())
}
