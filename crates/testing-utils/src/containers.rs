//! 测试用的持久化状态存储

use std::sync::Arc;

use hca_config::{StatusStoreConfig, StatusStoreType};
use hca_domain::StatusStore;
use hca_errors::PipelineResult;
use hca_infrastructure::SqliteStatusStore;
use tempfile::TempDir;

/// 临时目录中的 SQLite 状态存储，随结构体一起删除
pub struct SqliteTestDatabase {
    _dir: TempDir,
    pub config: StatusStoreConfig,
    pub store: Arc<SqliteStatusStore>,
}

impl SqliteTestDatabase {
    pub async fn new() -> PipelineResult<Self> {
        let dir = tempfile::tempdir()?;
        let config = StatusStoreConfig {
            r#type: StatusStoreType::Sqlite,
            url: format!("sqlite://{}?mode=rwc", dir.path().join("status.db").display()),
            max_connections: 4,
        };
        let store = Arc::new(SqliteStatusStore::connect(&config).await?);
        Ok(Self {
            _dir: dir,
            config,
            store,
        })
    }

    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        self.store.clone()
    }

    /// 清空所有表，便于在同一个库上跑多轮
    pub async fn clean_tables(&self) -> PipelineResult<()> {
        for table in ["hca_tasks", "hca_runs"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(self.store.pool())
                .await?;
        }
        Ok(())
    }
}
