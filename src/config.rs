use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Pipeline-wide knobs plus the set of configured targets.
/// Loaded once at startup; immutable for the life of the process.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Watch-loop poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-page navigation deadline.
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout_secs: u64,

    /// Whole-job deadline (navigation + extraction + commit).
    #[serde(default = "default_job_deadline")]
    pub job_deadline_secs: u64,

    /// In-job retries for transient navigation failures.
    #[serde(default = "default_max_nav_retries")]
    pub max_nav_retries: u32,

    /// Base for jittered exponential backoff between navigation retries.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Consecutive FAILED runs before a target is auto-disabled.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    pub targets: Vec<TargetConfig>,
}

/// One configured scrape destination: its page set and extraction adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub entry_urls: Vec<String>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    pub adapter: AdapterKind,
    /// Fields that define record identity; fingerprints hash exactly these.
    pub identity_fields: Vec<String>,
    /// Minimum seconds between scheduled runs of this target.
    #[serde(default = "default_target_interval")]
    pub interval_secs: u64,
}

/// Expands each entry URL into `pages` URLs via a query parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub param: String,
    pub pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// HTML table of vessel position rows.
    PositionGrid,
    /// Positions serialized as JSON inside a script tag.
    JsonFeed,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.targets.is_empty(), "config has no targets");
        for t in &self.targets {
            anyhow::ensure!(!t.id.is_empty(), "target with empty id");
            anyhow::ensure!(
                !t.entry_urls.is_empty(),
                "target {} has no entry URLs",
                t.id
            );
            anyhow::ensure!(
                !t.identity_fields.is_empty(),
                "target {} has no identity fields",
                t.id
            );
        }
        let mut ids: Vec<&str> = self.targets.iter().map(|t| t.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        anyhow::ensure!(
            ids.len() == self.targets.len(),
            "duplicate target ids in config"
        );
        Ok(())
    }

    pub fn target(&self, id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == id)
    }
}

impl TargetConfig {
    /// Full page set for one run: entry URLs expanded by the pagination rule.
    pub fn page_set(&self) -> Vec<String> {
        match &self.pagination {
            None => self.entry_urls.clone(),
            Some(p) => self
                .entry_urls
                .iter()
                .flat_map(|url| {
                    (1..=p.pages).map(move |n| {
                        let sep = if url.contains('?') { '&' } else { '?' };
                        format!("{}{}{}={}", url, sep, p.param, n)
                    })
                })
                .collect(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/vessels.sqlite")
}
fn default_poll_interval() -> u64 {
    60
}
fn default_navigation_timeout() -> u64 {
    45
}
fn default_job_deadline() -> u64 {
    300
}
fn default_max_nav_retries() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    2000
}
fn default_max_failures() -> u32 {
    3
}
fn default_target_interval() -> u64 {
    900
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "targets": [{
                "id": "north_sea",
                "entry_urls": ["https://tracker.example/fleet"],
                "adapter": "position_grid",
                "identity_fields": ["mmsi", "timestamp"]
            }]
        }"#
    }

    #[test]
    fn defaults_fill_in() {
        let config: PipelineConfig = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.max_consecutive_failures, 3);
        assert_eq!(config.max_nav_retries, 3);
        assert_eq!(config.targets[0].interval_secs, 900);
        assert!(config.targets[0].pagination.is_none());
    }

    #[test]
    fn page_set_without_pagination() {
        let config: PipelineConfig = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(
            config.targets[0].page_set(),
            vec!["https://tracker.example/fleet".to_string()]
        );
    }

    #[test]
    fn page_set_expands_pagination() {
        let target = TargetConfig {
            id: "t".into(),
            entry_urls: vec!["https://tracker.example/fleet?zone=4".into()],
            pagination: Some(Pagination {
                param: "page".into(),
                pages: 3,
            }),
            adapter: AdapterKind::PositionGrid,
            identity_fields: vec!["mmsi".into()],
            interval_secs: 900,
        };
        let pages = target.page_set();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], "https://tracker.example/fleet?zone=4&page=1");
        assert_eq!(pages[2], "https://tracker.example/fleet?zone=4&page=3");
    }

    #[test]
    fn duplicate_ids_rejected() {
        let json = r#"{
            "targets": [
                {"id": "a", "entry_urls": ["https://x"], "adapter": "json_feed", "identity_fields": ["k"]},
                {"id": "a", "entry_urls": ["https://y"], "adapter": "json_feed", "identity_fields": ["k"]}
            ]
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
