use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dmon_core::{TableRegistry, TableSpec};
use dmon_report::{CleaningRules, ColumnMap, DATE_FORMAT};
use dmon_storage::{HttpClientConfig, StoreConfig};
use serde::{Deserialize, Serialize};

pub const MONITOR_FILE: &str = "monitor.yaml";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub store_url: String,
    pub store_anon_key: String,
    pub realtime_url: String,
    pub export_url: String,
    pub poll_interval: Duration,
    pub cycle_timeout: Duration,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
    pub bind: String,
    /// Consecutive failed cycles before a critical error is raised.
    pub failure_threshold: u32,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let store_url = std::env::var("STORE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_default();
        let realtime_url = std::env::var("STORE_REALTIME_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| derive_realtime_url(&store_url));

        Self {
            store_anon_key: std::env::var("STORE_ANON_KEY").unwrap_or_default(),
            realtime_url,
            store_url,
            export_url: std::env::var("EXPORT_URL").unwrap_or_else(|_| {
                "https://iml.npa-enterprise.com/NPAAPILIVE/Home/ExportDailyOrderReport".to_string()
            }),
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", 300)),
            cycle_timeout: Duration::from_secs(env_parse("CYCLE_TIMEOUT_SECS", 300)),
            scheduler_enabled: std::env::var("DMON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            poll_cron: std::env::var("POLL_CRON").unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            user_agent: std::env::var("DMON_USER_AGENT")
                .unwrap_or_else(|_| "dmon-bot/0.1".to_string()),
            http_timeout_secs: env_parse("DMON_HTTP_TIMEOUT_SECS", 60),
            workspace_root: std::env::var("DMON_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            bind: std::env::var("DMON_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            failure_threshold: env_parse("DMON_FAILURE_THRESHOLD", 3),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.store_url.clone(), self.store_anon_key.clone())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    parse_or(std::env::var(name).ok(), default)
}

/// Unset, malformed and out-of-range values all fall back to `default`.
fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// `https://host` -> `wss://host/realtime/v1`.
pub fn derive_realtime_url(store_url: &str) -> String {
    let base = store_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/realtime/v1")
}

/// Query parameters sent with every export request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub params: BTreeMap<String, String>,
    pub from_param: String,
    pub to_param: String,
    /// Days before today the window starts.
    pub window_days: i64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            from_param: "strQuery2".to_string(),
            to_param: "strQuery3".to_string(),
            window_days: 1,
        }
    }
}

impl ExportSettings {
    pub fn request_params(&self, today: NaiveDate) -> Vec<(String, String)> {
        let from = today - chrono::Duration::days(self.window_days);
        let mut params: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.retain(|(k, _)| k != &self.from_param && k != &self.to_param);
        params.push((self.from_param.clone(), from.format(DATE_FORMAT).to_string()));
        params.push((self.to_param.clone(), today.format(DATE_FORMAT).to_string()));
        params
    }
}

/// Contents of `monitor.yaml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorFile {
    pub tables: Vec<TableSpec>,
    pub export: ExportSettings,
    pub cleaning: CleaningRules,
    pub columns: ColumnMap,
    /// Clear live tables whose section is missing from a report.
    pub clear_absent_sections: bool,
}

impl MonitorFile {
    pub fn registry(&self) -> TableRegistry {
        if self.tables.is_empty() {
            TableRegistry::default()
        } else {
            TableRegistry {
                tables: self.tables.clone(),
            }
        }
    }
}

pub fn load_monitor_file(root: &Path) -> Result<MonitorFile> {
    let path = root.join(MONITOR_FILE);
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no monitor file, using defaults");
        return Ok(MonitorFile::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
