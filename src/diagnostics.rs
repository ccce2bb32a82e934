//! Best-effort post-mortem capture: metrics, output captures and logs.

use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::launcher::RunArtifacts;

/// Default node metrics endpoint.
pub const DEFAULT_METRICS_URL: &str = "http://localhost:6116/metrics";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsCapture {
    Fetched(String),
    /// Why no metrics body was captured.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Diagnostics taken at one point in time.
#[derive(Debug, Clone)]
pub struct DiagnosticsBundle {
    pub captured_at: DateTime<Local>,
    pub metrics: MetricsCapture,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub log_files: Vec<LogFile>,
}

impl DiagnosticsBundle {
    /// Human-readable dump of everything captured.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Node diagnostics captured at {} ===", self.captured_at.to_rfc3339());

        let _ = writeln!(out, "--- Metrics ---");
        match &self.metrics {
            MetricsCapture::Fetched(body) => out.push_str(body),
            MetricsCapture::Unavailable(reason) => {
                let _ = writeln!(out, "(unavailable: {})", reason);
            }
        }

        for (title, capture) in [("STDOUT", &self.stdout), ("STDERR", &self.stderr)] {
            let _ = writeln!(out, "--- Node {} ---", title);
            match capture {
                Some(text) => out.push_str(text),
                None => out.push_str("(not captured)\n"),
            }
        }

        let _ = writeln!(out, "--- Logs ({} files) ---", self.log_files.len());
        for log in &self.log_files {
            let _ = writeln!(out, ">>> {}", log.path.display());
            out.push_str(&log.contents);
        }
        out
    }

    /// Writes `metrics.log` and `diagnostics.txt` into `dir`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        if let MetricsCapture::Fetched(body) = &self.metrics {
            fs::write(dir.join("metrics.log"), body)?;
        }
        let report = dir.join("diagnostics.txt");
        fs::write(&report, self.render())?;
        Ok(report)
    }
}

/// Gathers a [`DiagnosticsBundle`]. Never fails and never affects control flow.
#[derive(Debug, Clone)]
pub struct DiagnosticsCollector {
    metrics_url: Option<String>,
    client: Option<reqwest::Client>,
}

impl DiagnosticsCollector {
    pub fn new(metrics_url: Option<String>) -> Self {
        Self::with_fetch_timeout(metrics_url, Duration::from_secs(5))
    }

    pub fn with_fetch_timeout(metrics_url: Option<String>, fetch_timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(fetch_timeout).build() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Metrics client unavailable: {}", e);
                None
            }
        };
        Self { metrics_url, client }
    }

    pub fn metrics_url(&self) -> Option<&str> {
        self.metrics_url.as_deref()
    }

    pub async fn collect(&self, artifacts: &RunArtifacts) -> DiagnosticsBundle {
        let metrics = self.fetch_metrics().await;
        Self::bundle(metrics, artifacts)
    }

    /// Same as [`DiagnosticsCollector::collect`] without the metrics fetch.
    pub fn collect_local(artifacts: &RunArtifacts, reason: &str) -> DiagnosticsBundle {
        Self::bundle(MetricsCapture::Unavailable(reason.to_string()), artifacts)
    }

    fn bundle(metrics: MetricsCapture, artifacts: &RunArtifacts) -> DiagnosticsBundle {
        DiagnosticsBundle {
            captured_at: Local::now(),
            metrics,
            stdout: read_lossy(&artifacts.stdout),
            stderr: read_lossy(&artifacts.stderr),
            log_files: read_log_dir(&artifacts.log_dir),
        }
    }

    async fn fetch_metrics(&self) -> MetricsCapture {
        let Some(url) = self.metrics_url.as_deref() else {
            return MetricsCapture::Unavailable("no metrics endpoint configured".to_string());
        };
        let Some(client) = self.client.as_ref() else {
            return MetricsCapture::Unavailable("HTTP client could not be built".to_string());
        };

        debug!("Fetching metrics from {}", url);
        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return MetricsCapture::Unavailable(format!("GET {} failed: {}", url, e)),
        };
        if !response.status().is_success() {
            return MetricsCapture::Unavailable(format!("GET {} returned {}", url, response.status()));
        }
        match response.text().await {
            Ok(body) => MetricsCapture::Fetched(body),
            Err(e) => MetricsCapture::Unavailable(format!("reading body from {}: {}", url, e)),
        }
    }
}

fn read_lossy(path: &Path) -> Option<String> {
    fs::read(path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn read_log_dir(dir: &Path) -> Vec<LogFile> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            read_lossy(entry.path()).map(|contents| LogFile {
                path: entry.into_path(),
                contents,
            })
        })
        .collect()
}
