use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusStoreType {
    Sqlite,
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusStoreConfig {
    pub r#type: StatusStoreType,
    pub url: String,
    pub max_connections: u32,
}

impl Default for StatusStoreConfig {
    fn default() -> Self {
        Self {
            r#type: StatusStoreType::InMemory,
            url: "sqlite://hca_status.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl ConfigValidator for StatusStoreConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.r#type == StatusStoreType::Sqlite {
            ValidationUtils::validate_url(&self.url, "status_store.url", &["sqlite"])?;
            ValidationUtils::validate_count(
                self.max_connections as usize,
                "status_store.max_connections",
                100,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStoreType {
    /// 以本地目录模拟对象存储，桶即子目录
    LocalFs,
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub r#type: BlobStoreType,
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            r#type: BlobStoreType::LocalFs,
            root_dir: PathBuf::from("./hca-storage"),
        }
    }
}

impl ConfigValidator for StorageConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.r#type == BlobStoreType::LocalFs {
            ValidationUtils::validate_not_empty(
                &self.root_dir.to_string_lossy(),
                "storage.root_dir",
            )?;
        }
        Ok(())
    }
}
