//! Configuration loading and parsing.
//!
//! Parses `medusa.toml`, tolerating unknown fields and missing values so the
//! file can evolve without breaking older builds. A missing or unparsable
//! file yields the defaults; parse failures are logged, not fatal.

use std::{fs, path::PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// Worker threads for the analyzer pool; 0 picks
    /// `min(4, available_parallelism)`.
    #[serde(default)]
    pub threads: usize,
    /// Minimum printable run for the string heuristic.
    #[serde(default = "AnalyzerConfig::default_string_min_length")]
    pub string_min_length: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            string_min_length: Self::default_string_min_length(),
        }
    }
}

impl AnalyzerConfig {
    const fn default_string_min_length() -> usize {
        4
    }

    /// Worker count with the auto value resolved.
    pub fn effective_threads(&self) -> usize {
        if self.threads != 0 {
            return self.threads;
        }
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        hw.min(4)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvaluatorConfig {
    /// Iteration ceiling for while-loop semantics.
    #[serde(default = "EvaluatorConfig::default_loop_iteration_cap")]
    pub loop_iteration_cap: u64,
    /// Expression depth ceiling for visitors.
    #[serde(default = "EvaluatorConfig::default_max_visit_depth")]
    pub max_visit_depth: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            loop_iteration_cap: Self::default_loop_iteration_cap(),
            max_visit_depth: Self::default_max_visit_depth(),
        }
    }
}

impl EvaluatorConfig {
    const fn default_loop_iteration_cap() -> u64 {
        1 << 20
    }

    const fn default_max_visit_depth() -> usize {
        256
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentConfig {
    /// Entries kept by the address navigation history.
    #[serde(default = "DocumentConfig::default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            history_capacity: Self::default_history_capacity(),
        }
    }
}

impl DocumentConfig {
    const fn default_history_capacity() -> usize {
        128
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub document: DocumentConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Original file contents, when a file was read.
    pub raw: Option<String>,
    pub file: ConfigFile,
}

/// Best-effort config path: the working directory first, then the platform
/// config directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("medusa.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("medusa").join("medusa.toml");
    }
    PathBuf::from("medusa.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    let Ok(content) = fs::read_to_string(&path) else {
        return Ok(Config::default());
    };
    match toml::from_str::<ConfigFile>(&content) {
        Ok(file) => {
            info!(target: "config", path = %path.display(), "configuration loaded");
            Ok(Config {
                raw: Some(content),
                file,
            })
        }
        Err(error) => {
            warn!(target: "config", path = %path.display(), %error, "configuration unparsable, using defaults");
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_is_missing() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_medusa__.toml"))).unwrap();
        assert_eq!(cfg.file.analyzer.string_min_length, 4);
        assert_eq!(cfg.file.evaluator.loop_iteration_cap, 1 << 20);
        assert_eq!(cfg.file.evaluator.max_visit_depth, 256);
        assert_eq!(cfg.file.document.history_capacity, 128);
        assert!(cfg.raw.is_none());
    }

    #[test]
    fn parses_known_sections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[analyzer]\nthreads = 2\nstring_min_length = 6\n\n[evaluator]\nloop_iteration_cap = 1024\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.analyzer.threads, 2);
        assert_eq!(cfg.file.analyzer.effective_threads(), 2);
        assert_eq!(cfg.file.analyzer.string_min_length, 6);
        assert_eq!(cfg.file.evaluator.loop_iteration_cap, 1024);
        // Untouched sections keep defaults.
        assert_eq!(cfg.file.document.history_capacity, 128);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[future]\nshiny = true\n[analyzer]\nthreads = 1\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.analyzer.threads, 1);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "not [valid toml").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.analyzer.threads, 0);
    }

    #[test]
    fn auto_thread_count_is_bounded() {
        let auto = AnalyzerConfig::default().effective_threads();
        assert!((1..=4).contains(&auto));
    }
}
