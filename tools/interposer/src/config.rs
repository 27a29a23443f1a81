use crate::errors::InterposerError;
use crate::logging::Level;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_PREFIX: &str = "TAPE: ";

/// Log categories and the subcategories each one accepts.
const LOG_CATEGORIES: [(&str, [&str; 2]); 5] = [
    ("fileio", ["open", "close"]),
    ("wrappr", ["call", "wrap"]),
    ("except", ["playback", "recorded"]),
    ("params", ["playback", "recorded"]),
    ("result", ["playback", "recorded"]),
];

pub type LogLevels = BTreeMap<String, BTreeMap<String, Level>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InterposerConfig {
    pub logging: LoggingConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub prefix: String,
    pub min_level: Level,
    pub levels: LogLevels,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DebugConfig {
    /// Where to write each hashed call identity, for diffing lookup misses.
    pub calls_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_LOG_PREFIX.to_string(),
            min_level: Level::Debug,
            levels: default_log_levels(),
        }
    }
}

impl LoggingConfig {
    /// Severity for a category/subcategory pair; unmapped pairs log at debug.
    pub fn level_for(&self, category: &str, subcategory: &str) -> Level {
        self.levels
            .get(category)
            .and_then(|subs| subs.get(subcategory))
            .copied()
            .unwrap_or(Level::Debug)
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }
}

pub fn default_log_levels() -> LogLevels {
    LOG_CATEGORIES
        .iter()
        .map(|(category, subs)| {
            let level = if *category == "fileio" {
                Level::Info
            } else {
                Level::Debug
            };
            let subs = subs
                .iter()
                .map(|sub| (sub.to_string(), level))
                .collect::<BTreeMap<_, _>>();
            (category.to_string(), subs)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialInterposerConfig {
    logging: Option<PartialLoggingConfig>,
    debug: Option<PartialDebugConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    prefix: Option<String>,
    min_level: Option<Level>,
    levels: Option<LogLevels>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDebugConfig {
    calls_dir: Option<PathBuf>,
}

/// Defaults, overlaid with the TOML file at `path` when one is given.
pub fn load_config(path: Option<&Path>) -> Result<InterposerConfig, InterposerError> {
    match path {
        Some(path) => {
            let contents =
                std::fs::read_to_string(path).map_err(|e| InterposerError::Io(e.to_string()))?;
            parse_config(&contents)
        }
        None => Ok(InterposerConfig::default()),
    }
}

pub fn parse_config(contents: &str) -> Result<InterposerConfig, InterposerError> {
    let partial: PartialInterposerConfig =
        toml::from_str(contents).map_err(|e| InterposerError::ConfigParse(e.to_string()))?;
    let mut cfg = InterposerConfig::default();
    merge_partial_config(&mut cfg, partial);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut InterposerConfig, partial: PartialInterposerConfig) {
    if let Some(logging) = partial.logging {
        if let Some(prefix) = logging.prefix {
            cfg.logging.prefix = prefix;
        }
        if let Some(min_level) = logging.min_level {
            cfg.logging.min_level = min_level;
        }
        if let Some(levels) = logging.levels {
            for (category, subs) in levels {
                let entry = cfg.logging.levels.entry(category).or_default();
                for (sub, level) in subs {
                    entry.insert(sub, level);
                }
            }
        }
    }

    if let Some(debug) = partial.debug {
        if let Some(calls_dir) = debug.calls_dir {
            cfg.debug.calls_dir = Some(calls_dir);
        }
    }
}

fn validate_config(cfg: &InterposerConfig) -> Result<(), InterposerError> {
    for (category, subs) in &cfg.logging.levels {
        let Some((_, known)) = LOG_CATEGORIES.iter().find(|(name, _)| *name == category.as_str()) else {
            return Err(InterposerError::InvalidConfig(format!(
                "unknown log category `{category}`"
            )));
        };
        if let Some(sub) = subs.keys().find(|sub| !known.contains(&sub.as_str())) {
            return Err(InterposerError::InvalidConfig(format!(
                "unknown log subcategory `{category}.{sub}`"
            )));
        }
    }
    Ok(())
}
