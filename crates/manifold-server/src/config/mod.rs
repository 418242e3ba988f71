// crates/manifold-server/src/config/mod.rs
// Configuration: profile model, environment, filesystem layout

mod env;
mod profile;

pub use env::{ConfigValidation, EmbeddingsConfig, EnvConfig};
pub use profile::{
    AuthConfig, AuthKind, DownstreamDefinition, DownstreamEntry, Profile, RemoteTransport,
    content_hash,
};

use std::path::PathBuf;

/// Per-user data directory, `MANIFOLD_CACHE_DIR` override first.
///
/// Layout underneath:
///   profiles/<name>.json       profile files (owned externally)
///   cache/<name>.tools.csv     tool identity cache
///   cache/<name>.meta.json     schemas, embeddings, hashes
///   logs/<downstream>.stderr.log
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("MANIFOLD_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("manifold")
}

pub fn profile_path(profile: &str) -> PathBuf {
    data_dir().join("profiles").join(format!("{profile}.json"))
}

pub fn cache_csv_path(profile: &str) -> PathBuf {
    data_dir().join("cache").join(format!("{profile}.tools.csv"))
}

pub fn cache_meta_path(profile: &str) -> PathBuf {
    data_dir().join("cache").join(format!("{profile}.meta.json"))
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}
