// crates/manifold-server/src/index/store.rs
// Cache persistence: tool identity CSV + metadata blob

use super::{FailedDownstream, Snapshot, ToolRecord};
use crate::error::{ManifoldError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// Bumped on incompatible layout changes; a mismatch discards the cache.
const FORMAT_VERSION: u64 = 1;

/// Serialized cache content, ready to hit the disk.
pub(super) struct Encoded {
    csv: String,
    meta: String,
}

impl Encoded {
    /// Digest over both files, for the byte-identical save skip.
    pub(super) fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.csv.as_bytes());
        hasher.update(self.meta.as_bytes());
        hasher.finalize().into()
    }
}

/// Serialize the snapshot. The CSV carries tool identities for fast
/// scanning; the metadata blob carries schemas, embeddings, hashes,
/// and failure notes.
pub(super) fn encode(snapshot: &Snapshot, profile_hash: &str, model_id: &str) -> Encoded {
    let mut csv = String::from("display_name,downstream,local_name,description\n");
    for record in &snapshot.records {
        csv.push_str(&csv_row(&[
            &record.display_name,
            &record.downstream,
            &record.local_name,
            &record.description,
        ]));
        csv.push('\n');
    }

    let tools: serde_json::Map<String, Value> = snapshot
        .records
        .iter()
        .map(|record| {
            (
                record.display_name.clone(),
                json!({
                    "schema": record.input_schema,
                    "embedding_base64": encode_embedding(&record.embedding),
                    "tags": record.tags,
                    "last_seen_at": record.last_seen_at,
                }),
            )
        })
        .collect();

    // Keys sorted so identical snapshots serialize to identical bytes
    let mut failed_names: Vec<&String> = snapshot.failed.keys().collect();
    failed_names.sort();
    let failed: serde_json::Map<String, Value> = failed_names
        .into_iter()
        .map(|name| {
            let failure = &snapshot.failed[name];
            (
                name.clone(),
                json!({
                    "error": failure.error,
                    "retry_after_secs": failure.retry_after_secs,
                }),
            )
        })
        .collect();

    let meta = json!({
        "version": FORMAT_VERSION,
        "profile_hash": profile_hash,
        "model_id": model_id,
        "per_downstream_hash": sorted_map(&snapshot.downstream_hashes),
        "tools": tools,
        "failed": failed,
    });

    Encoded {
        csv,
        // Trailing newline keeps the file text-tool friendly
        meta: format!("{:#}\n", meta),
    }
}

/// Temp-then-rename both files. The rename is atomic on the same
/// filesystem, so a crashed save never leaves a torn cache.
pub(super) fn write(csv_path: &Path, meta_path: &Path, encoded: &Encoded) -> Result<()> {
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(csv_path, encoded.csv.as_bytes())?;
    write_atomic(meta_path, encoded.meta.as_bytes())?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and reassemble the snapshot. `Ok(None)` when no cache exists;
/// errors are surfaced for the caller to log and treat as empty.
pub(super) fn load(csv_path: &Path, meta_path: &Path) -> Result<Option<Snapshot>> {
    if !csv_path.exists() || !meta_path.exists() {
        return Ok(None);
    }
    let csv = std::fs::read_to_string(csv_path)?;
    let meta: Value = serde_json::from_str(&std::fs::read_to_string(meta_path)?)?;

    let version = meta.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
    if version != FORMAT_VERSION {
        return Err(ManifoldError::Config(format!(
            "cache format version {version} (expected {FORMAT_VERSION})"
        )));
    }

    let tools = meta
        .get("tools")
        .and_then(|t| t.as_object())
        .cloned()
        .unwrap_or_default();

    let mut records = Vec::new();
    for (line_no, line) in csv.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_row(line).ok_or_else(|| {
            ManifoldError::Config(format!("malformed CSV row at line {}", line_no + 1))
        })?;
        if fields.len() != 4 {
            return Err(ManifoldError::Config(format!(
                "expected 4 CSV fields at line {}, got {}",
                line_no + 1,
                fields.len()
            )));
        }
        let display_name = &fields[0];
        let Some(extra) = tools.get(display_name.as_str()) else {
            // Identity without metadata: dropped, re-indexed later
            tracing::warn!(tool = %display_name, "Cache CSV row without metadata, dropping");
            continue;
        };
        let embedding = extra
            .get("embedding_base64")
            .and_then(|e| e.as_str())
            .map(decode_embedding)
            .transpose()?
            .unwrap_or_default();
        records.push(ToolRecord {
            display_name: fields[0].clone(),
            downstream: fields[1].clone(),
            local_name: fields[2].clone(),
            description: fields[3].clone(),
            input_schema: extra.get("schema").cloned().unwrap_or(Value::Null),
            embedding,
            tags: extra
                .get("tags")
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or_default(),
            last_seen_at: extra
                .get("last_seen_at")
                .and_then(|l| l.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }
    records.sort_by(|a, b| a.display_name.cmp(&b.display_name));

    let downstream_hashes: HashMap<String, String> = meta
        .get("per_downstream_hash")
        .and_then(|h| serde_json::from_value(h.clone()).ok())
        .unwrap_or_default();

    let failed: HashMap<String, FailedDownstream> = meta
        .get("failed")
        .and_then(|f| f.as_object())
        .map(|obj| {
            obj.iter()
                .map(|(name, v)| {
                    (
                        name.clone(),
                        FailedDownstream {
                            error: v
                                .get("error")
                                .and_then(|e| e.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            retry_after_secs: v
                                .get("retry_after_secs")
                                .and_then(|r| r.as_u64())
                                .unwrap_or(0),
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(Snapshot {
        profile_hash: meta
            .get("profile_hash")
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string(),
        model_id: meta
            .get("model_id")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        downstream_hashes,
        records,
        failed,
    }))
}

fn encode_embedding(embedding: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    BASE64.encode(bytes)
}

fn decode_embedding(encoded: &str) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ManifoldError::Config(format!("bad embedding encoding: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(ManifoldError::Config(
            "embedding byte length not a multiple of 4".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Quote fields containing commas, quotes, or newlines; embedded
/// quotes double.
fn csv_row(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|field| {
            if field.contains(',') || field.contains('"') || field.contains('\n') {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                (*field).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_csv_row(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            '"' => return None, // quote in the middle of a bare field
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(current);
    Some(fields)
}

fn sorted_map(map: &HashMap<String, String>) -> Value {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let sorted: serde_json::Map<String, Value> = keys
        .into_iter()
        .map(|k| (k.clone(), Value::String(map[k].clone())))
        .collect();
    Value::Object(sorted)
}
