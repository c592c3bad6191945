//! `self/memory`: memory usage of the agent process, read from
//! `/proc/self/statm`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::{
    core::mb::{BaseMetricSet, Event, EventFetcher, FetchError, FetchStyle},
    register_metricset,
};

const STATM_PATH: &str = "/proc/self/statm";
const DEFAULT_PAGE_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to read file {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid format in {location}: {reason}")]
    InvalidFormat { location: String, reason: String },
}

/// Process memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessMemory {
    pub size: u64,
    pub resident: u64,
    pub shared: u64,
}

/// Metricset-specific keys of the module block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MemoryConfig {
    statm_path: PathBuf,
    page_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            statm_path: PathBuf::from(STATM_PATH),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct MemoryMetricSet {
    config: MemoryConfig,
}

impl MemoryMetricSet {
    pub fn build(base: &BaseMetricSet) -> Result<FetchStyle, FetchError> {
        let config: MemoryConfig = base.config()?;
        if config.page_size == 0 {
            return Err("page_size must be greater than zero".into());
        }
        Ok(FetchStyle::event(MemoryMetricSet { config }))
    }
}

#[async_trait::async_trait]
impl EventFetcher for MemoryMetricSet {
    async fn fetch(&self) -> Result<Event, FetchError> {
        let path = self.config.statm_path.display().to_string();
        let content = tokio::fs::read_to_string(&self.config.statm_path)
            .await
            .map_err(|source| MemoryError::FileRead {
                path: path.clone(),
                source,
            })?;

        let memory = parse_statm(&content, self.config.page_size, &path)?;

        let mut fields = serde_json::Map::new();
        fields.insert("size".into(), json!({ "bytes": memory.size }));
        fields.insert("rss".into(), json!({ "bytes": memory.resident }));
        fields.insert("share".into(), json!({ "bytes": memory.shared }));
        Ok(Event::from(fields))
    }
}

/// Parses `size resident shared ...` page counts.
fn parse_statm(content: &str, page_size: u64, location: &str) -> Result<ProcessMemory, MemoryError> {
    let mut pages = content.split_whitespace().map(|field| {
        field.parse::<u64>().map_err(|e| MemoryError::InvalidFormat {
            location: location.to_string(),
            reason: format!("'{}': {}", field, e),
        })
    });

    let mut next = |name: &str| -> Result<u64, MemoryError> {
        let count = pages.next().unwrap_or_else(|| {
            Err(MemoryError::InvalidFormat {
                location: location.to_string(),
                reason: format!("missing {} field", name),
            })
        })?;
        count
            .checked_mul(page_size)
            .ok_or_else(|| MemoryError::InvalidFormat {
                location: location.to_string(),
                reason: format!("{} of {} pages overflows with page size {}", name, count, page_size),
            })
    };

    Ok(ProcessMemory {
        size: next("size")?,
        resident: next("resident")?,
        shared: next("shared")?,
    })
}

register_metricset!("self", "memory", MemoryMetricSet::build, default);
