// crates/manifold-server/src/finder/mod.rs
// Semantic finder: query parsing, ranking, dominance dampening, paging

use crate::embeddings::EmbeddingClient;
use crate::error::{ManifoldError, Result};
use crate::index::{CapabilityIndex, ScoredRecord};
use manifold_types::{DownstreamState, DownstreamStatus, FindPage, IndexingProgress, ToolHit};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;
pub const DEFAULT_THRESHOLD: f32 = 0.35;

/// Results per category that rank undampened. From the 4th result of
/// a category onward, scores are multiplied down so one downstream
/// with many similar tools cannot monopolize the page.
const CATEGORY_FREE_SLOTS: usize = 3;
const CATEGORY_DAMPEN: f32 = 0.6;

/// Parsed and defaulted `find` input.
#[derive(Debug, Clone)]
pub struct FinderQuery {
    /// `|`-separated multi-intent query; empty means enumerate all.
    pub description: Option<String>,
    pub page: usize,
    pub limit: usize,
    pub depth: u8,
    pub confidence_threshold: f32,
}

impl Default for FinderQuery {
    fn default() -> Self {
        Self {
            description: None,
            page: 1,
            limit: DEFAULT_LIMIT,
            depth: 1,
            confidence_threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl FinderQuery {
    fn validate(&self) -> Result<()> {
        if self.page < 1 {
            return Err(ManifoldError::InvalidArgument(
                "page must be >= 1".into(),
            ));
        }
        if self.limit < 1 || self.limit > MAX_LIMIT {
            return Err(ManifoldError::InvalidArgument(format!(
                "limit must be in 1..={MAX_LIMIT}"
            )));
        }
        if self.depth != 1 && self.depth != 2 {
            return Err(ManifoldError::InvalidArgument(
                "depth must be 1 or 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ManifoldError::InvalidArgument(
                "confidence_threshold must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Sub-queries after `|` splitting; empty for enumerate-all.
    fn intents(&self) -> Vec<String> {
        self.description
            .as_deref()
            .unwrap_or("")
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Embedding-backed discovery over the capability index.
pub struct Finder {
    index: Arc<CapabilityIndex>,
    embeddings: Arc<EmbeddingClient>,
}

impl Finder {
    pub fn new(index: Arc<CapabilityIndex>, embeddings: Arc<EmbeddingClient>) -> Self {
        Self { index, embeddings }
    }

    /// Run a query and return one well-formed page. An empty index is
    /// an empty page (with `indexing` attached while reconciliation
    /// runs), never an error.
    pub async fn find(
        &self,
        query: FinderQuery,
        indexing: Option<IndexingProgress>,
    ) -> Result<FindPage> {
        query.validate()?;
        let intents = query.intents();

        let mut hits = if intents.is_empty() {
            self.enumerate_all()
        } else {
            self.ranked(&intents, query.confidence_threshold).await?
        };

        if !intents.is_empty() {
            dampen_dominant_categories(&mut hits);
        }

        let total = hits.len();
        let total_pages = total.div_ceil(query.limit);
        let start = (query.page - 1) * query.limit;
        let page_hits = if start >= total {
            &[]
        } else {
            &hits[start..(start + query.limit).min(total)]
        };

        let tools = page_hits
            .iter()
            .map(|hit| ToolHit {
                tool: hit.record.display_name.clone(),
                description: first_line(&hit.record.description),
                score: hit.score,
                input_schema: (query.depth == 2).then(|| hit.record.input_schema.clone()),
            })
            .collect();

        Ok(FindPage {
            tools,
            page: query.page,
            limit: query.limit,
            total,
            total_pages,
            indexing,
            failed: self.failed_statuses(),
        })
    }

    /// Failure notes from the snapshot: failed downstreams are
    /// reported, never silently suppressed. Their cached tools keep
    /// ranking above.
    fn failed_statuses(&self) -> Vec<DownstreamStatus> {
        let snapshot = self.index.snapshot();
        let mut statuses: Vec<DownstreamStatus> = snapshot
            .failed
            .iter()
            .map(|(name, failure)| DownstreamStatus {
                name: name.clone(),
                state: DownstreamState::Failed,
                tool_count: snapshot.records_for(name).count(),
                last_error: Some(failure.error.clone()),
                retry_after_secs: Some(failure.retry_after_secs),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Empty query: every indexed tool in display-name order.
    fn enumerate_all(&self) -> Vec<ScoredRecord> {
        self.index
            .snapshot()
            .records
            .iter()
            .map(|record| ScoredRecord {
                record: record.clone(),
                score: 0.0,
            })
            .collect()
    }

    /// Embed each intent, search, and union with score = max across
    /// intents.
    async fn ranked(&self, intents: &[String], threshold: f32) -> Result<Vec<ScoredRecord>> {
        let vectors = self.embeddings.embed_batch(intents).await?;

        let mut merged: HashMap<String, ScoredRecord> = HashMap::new();
        for vector in &vectors {
            for hit in self.index.search(vector, usize::MAX, None) {
                if hit.score < threshold {
                    continue;
                }
                match merged.get_mut(&hit.record.display_name) {
                    Some(existing) => existing.score = existing.score.max(hit.score),
                    None => {
                        merged.insert(hit.record.display_name.clone(), hit);
                    }
                }
            }
        }

        let mut hits: Vec<ScoredRecord> = merged.into_values().collect();
        sort_hits(&mut hits);
        Ok(hits)
    }
}

/// Multiplicatively dampen the 4th and later results of each coarse
/// category (the downstream prefix of the display name), then restore
/// score order. Precision is preserved; monopolies are not.
fn dampen_dominant_categories(hits: &mut Vec<ScoredRecord>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for hit in hits.iter_mut() {
        let count = seen.entry(hit.record.downstream.clone()).or_insert(0);
        if *count >= CATEGORY_FREE_SLOTS {
            hit.score *= CATEGORY_DAMPEN;
        }
        *count += 1;
    }
    sort_hits(hits);
}

fn sort_hits(hits: &mut [ScoredRecord]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.display_name.cmp(&b.record.display_name))
    });
}

fn first_line(description: &str) -> String {
    description.lines().next().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ToolRecord;
    use serde_json::json;

    fn record_with_description(downstream: &str, local: &str, description: &str) -> ToolRecord {
        ToolRecord {
            downstream: downstream.to_string(),
            local_name: local.to_string(),
            display_name: ToolRecord::display_name(downstream, local),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
            embedding: vec![],
            tags: vec![],
            last_seen_at: "2025-11-02T10:00:00Z".to_string(),
        }
    }

    async fn seeded_finder(tools: &[(&str, &str, &str)]) -> Finder {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(CapabilityIndex::new(
            dir.path().join("t.csv"),
            dir.path().join("t.json"),
            "p".into(),
            "hashed-v1-384".into(),
        ));
        let embeddings = Arc::new(EmbeddingClient::hashed());

        let mut by_downstream: HashMap<String, Vec<ToolRecord>> = HashMap::new();
        for (downstream, local, description) in tools {
            let mut record = record_with_description(downstream, local, description);
            record.embedding = embeddings.embed(description).await.unwrap();
            by_downstream
                .entry(downstream.to_string())
                .or_default()
                .push(record);
        }
        for (downstream, records) in by_downstream {
            index.patch(&downstream, format!("hash-{downstream}"), records);
        }
        // The tempdir may drop: these tests never call save()
        drop(dir);
        Finder::new(index, embeddings)
    }

    #[tokio::test]
    async fn test_empty_query_enumerates_in_name_order() {
        let finder = seeded_finder(&[
            ("files", "write", "write data to a file"),
            ("files", "read", "read a file from disk"),
            ("mail", "send", "send an email message"),
        ])
        .await;

        let page = finder.find(FinderQuery::default(), None).await.unwrap();
        assert_eq!(page.total, 3);
        let names: Vec<&str> = page.tools.iter().map(|t| t.tool.as_str()).collect();
        assert_eq!(names, vec!["files:read", "files:write", "mail:send"]);
        assert!(page.tools.iter().all(|t| t.score == 0.0));
    }

    #[tokio::test]
    async fn test_limit_zero_rejected() {
        let finder = seeded_finder(&[]).await;
        let query = FinderQuery {
            limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            finder.find(query, None).await,
            Err(ManifoldError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_relevant_tool_ranks_first() {
        let finder = seeded_finder(&[
            ("mail", "send", "send an email message to a recipient"),
            ("files", "read", "read a file from local disk"),
            ("shell", "exec", "execute a shell command"),
        ])
        .await;

        let query = FinderQuery {
            description: Some("send email".into()),
            confidence_threshold: 0.0,
            ..Default::default()
        };
        let page = finder.find(query, None).await.unwrap();
        assert_eq!(page.tools[0].tool, "mail:send");
        assert!(page.tools[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_multi_intent_union_takes_max() {
        let finder = seeded_finder(&[
            ("mail", "send", "send an email message"),
            ("files", "read", "read a file from disk"),
        ])
        .await;

        let query = FinderQuery {
            description: Some("send email | read file".into()),
            confidence_threshold: 0.05,
            ..Default::default()
        };
        let page = finder.find(query, None).await.unwrap();
        let names: Vec<&str> = page.tools.iter().map(|t| t.tool.as_str()).collect();
        assert!(names.contains(&"mail:send"));
        assert!(names.contains(&"files:read"));
        // Union, not duplication
        assert_eq!(page.total, names.len());
    }

    #[tokio::test]
    async fn test_depth_two_includes_schema_and_keeps_order() {
        let finder = seeded_finder(&[
            ("mail", "send", "send an email message"),
            ("files", "read", "read a file from disk"),
        ])
        .await;

        let base = FinderQuery {
            description: Some("send email".into()),
            confidence_threshold: 0.0,
            ..Default::default()
        };
        let shallow = finder.find(base.clone(), None).await.unwrap();
        let deep = finder
            .find(FinderQuery { depth: 2, ..base }, None)
            .await
            .unwrap();

        let shallow_names: Vec<&str> = shallow.tools.iter().map(|t| t.tool.as_str()).collect();
        let deep_names: Vec<&str> = deep.tools.iter().map(|t| t.tool.as_str()).collect();
        assert_eq!(shallow_names, deep_names);
        assert!(shallow.tools.iter().all(|t| t.input_schema.is_none()));
        assert!(deep.tools.iter().all(|t| t.input_schema.is_some()));
    }

    #[tokio::test]
    async fn test_dominant_category_is_dampened() {
        // 12 near-identical shell tools that all mention emailing,
        // against 2 genuine email tools
        let mut tools: Vec<(String, String, String)> = (0..12)
            .map(|i| {
                (
                    "shell".to_string(),
                    format!("cmd{i:02}"),
                    format!("send an email using shell variant {i}"),
                )
            })
            .collect();
        tools.push((
            "mail".to_string(),
            "send".to_string(),
            "send an email message".to_string(),
        ));
        tools.push((
            "mail".to_string(),
            "draft".to_string(),
            "draft an email".to_string(),
        ));
        let borrowed: Vec<(&str, &str, &str)> = tools
            .iter()
            .map(|(a, b, c)| (a.as_str(), b.as_str(), c.as_str()))
            .collect();
        let finder = seeded_finder(&borrowed).await;

        let query = FinderQuery {
            description: Some("send email".into()),
            confidence_threshold: 0.0,
            limit: 20,
            ..Default::default()
        };
        let page = finder.find(query, None).await.unwrap();
        let names: Vec<&str> = page.tools.iter().map(|t| t.tool.as_str()).collect();

        assert!(
            names[..3].iter().any(|n| n.starts_with("mail:")),
            "an email tool must appear in the top 3, got {names:?}"
        );
        // Without dampening the 12 shell variants would bury
        // mail:draft at the bottom of the page
        let draft_pos = names.iter().position(|n| *n == "mail:draft").unwrap();
        assert!(
            draft_pos < 6,
            "dampening should lift mail:draft above the shell tail (position {draft_pos})"
        );
        // Dampened shell results score below the undampened leaders
        let first_shell = page
            .tools
            .iter()
            .find(|t| t.tool.starts_with("shell:"))
            .unwrap();
        let last_shell = page
            .tools
            .iter()
            .rev()
            .find(|t| t.tool.starts_with("shell:"))
            .unwrap();
        assert!(last_shell.score < first_shell.score * 0.7);
    }

    #[tokio::test]
    async fn test_pagination_is_stable() {
        let tools: Vec<(String, String, String)> = (0..7)
            .map(|i| {
                (
                    "files".to_string(),
                    format!("tool{i}"),
                    format!("file operation {i}"),
                )
            })
            .collect();
        let borrowed: Vec<(&str, &str, &str)> = tools
            .iter()
            .map(|(a, b, c)| (a.as_str(), b.as_str(), c.as_str()))
            .collect();
        let finder = seeded_finder(&borrowed).await;

        let base = FinderQuery {
            limit: 3,
            ..Default::default()
        };
        let page1 = finder.find(base.clone(), None).await.unwrap();
        let page3 = finder
            .find(FinderQuery { page: 3, ..base.clone() }, None)
            .await
            .unwrap();
        assert_eq!(page1.total, 7);
        assert_eq!(page1.total_pages, 3);
        assert_eq!(page1.tools.len(), 3);
        assert_eq!(page3.tools.len(), 1);

        // Past-the-end page: valid and empty
        let page9 = finder
            .find(FinderQuery { page: 9, ..base }, None)
            .await
            .unwrap();
        assert!(page9.tools.is_empty());
        assert_eq!(page9.total, 7);
    }

    #[tokio::test]
    async fn test_empty_index_reports_progress() {
        let finder = seeded_finder(&[]).await;
        let progress = IndexingProgress {
            total: 3,
            current: 1,
            current_downstream: Some("files".into()),
            started_at: "2025-11-02T10:00:00Z".into(),
            eta_seconds: Some(4),
        };
        let page = finder
            .find(FinderQuery::default(), Some(progress.clone()))
            .await
            .unwrap();
        assert!(page.tools.is_empty());
        assert_eq!(page.indexing, Some(progress));
    }
}
