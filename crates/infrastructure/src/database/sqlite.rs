use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hca_config::StatusStoreConfig;
use hca_domain::{
    BlobLocation, BlobObject, Run, RunStatus, StatusStore, Task, TaskKey, TaskStatus,
};
use hca_errors::PipelineResult;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tracing::{debug, info, instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hca_runs (
        run_id TEXT PRIMARY KEY,
        submitted_by TEXT NOT NULL,
        submit_timestamp TEXT NOT NULL,
        status TEXT NOT NULL,
        image_bucket TEXT NOT NULL,
        image_prefix TEXT NOT NULL,
        pipeline_bucket TEXT NOT NULL,
        pipeline_key TEXT NOT NULL,
        record_bucket TEXT NOT NULL,
        record_prefix TEXT NOT NULL,
        completed_by TEXT,
        consolidation_enqueued INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hca_tasks (
        run_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        status TEXT NOT NULL,
        input_bucket TEXT NOT NULL,
        input_key TEXT NOT NULL,
        output_prefix TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (run_id, task_id)
    )
    "#,
];

/// SQLite 状态存储
///
/// 条件更新使用 `UPDATE ... WHERE status = ?`，以受影响行数判断是否胜出。
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StatusStoreConfig) -> PipelineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!("SQLite状态存储已就绪: {}", config.url);
        Ok(store)
    }

    pub async fn migrate(&self) -> PipelineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Run> {
        let status: String = row.try_get("status")?;
        let submit_timestamp: DateTime<Utc> = row.try_get("submit_timestamp")?;
        Ok(Run {
            run_id: row.try_get("run_id")?,
            submitted_by: row.try_get("submitted_by")?,
            submit_timestamp,
            status: status.parse()?,
            image_data: BlobLocation {
                bucket: row.try_get("image_bucket")?,
                prefix: row.try_get("image_prefix")?,
            },
            pipeline: BlobObject::new(
                row.try_get::<String, _>("pipeline_bucket")?,
                row.try_get::<String, _>("pipeline_key")?,
            ),
            record_location: BlobLocation {
                bucket: row.try_get("record_bucket")?,
                prefix: row.try_get("record_prefix")?,
            },
            completed_by: row.try_get("completed_by")?,
            consolidation_enqueued: row.try_get("consolidation_enqueued")?,
        })
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Task> {
        let status: String = row.try_get("status")?;
        Ok(Task {
            run_id: row.try_get("run_id")?,
            task_id: row.try_get("task_id")?,
            status: status.parse()?,
            input_rowset: BlobObject::new(
                row.try_get::<String, _>("input_bucket")?,
                row.try_get::<String, _>("input_key")?,
            ),
            output_prefix: row.try_get("output_prefix")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    #[instrument(skip(self, run), fields(run_id = %run.run_id, status = %run.status))]
    async fn create_run(&self, run: &Run) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO hca_runs (run_id, submitted_by, submit_timestamp, status,
                                  image_bucket, image_prefix, pipeline_bucket, pipeline_key,
                                  record_bucket, record_prefix)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT(run_id) DO NOTHING
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.submitted_by)
        .bind(run.submit_timestamp)
        .bind(run.status.as_str())
        .bind(&run.image_data.bucket)
        .bind(&run.image_data.prefix)
        .bind(&run.pipeline.bucket)
        .bind(&run.pipeline.key)
        .bind(&run.record_location.bucket)
        .bind(&run.record_location.prefix)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            debug!("写入运行记录成功: {}", run.run_id);
        } else {
            debug!("运行记录已存在: {}", run.run_id);
        }
        Ok(created)
    }

    async fn get_run(&self, run_id: &str) -> PipelineResult<Option<Run>> {
        let row = sqlx::query("SELECT * FROM hca_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    #[instrument(skip(self, task), fields(run_id = %task.run_id, task_id = %task.task_id))]
    async fn put_task(&self, task: &Task) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hca_tasks (run_id, task_id, status, input_bucket, input_key,
                                   output_prefix, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(run_id, task_id) DO UPDATE SET
                status = excluded.status,
                input_bucket = excluded.input_bucket,
                input_key = excluded.input_key,
                output_prefix = excluded.output_prefix,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.run_id)
        .bind(&task.task_id)
        .bind(task.status.as_str())
        .bind(&task.input_rowset.bucket)
        .bind(&task.input_rowset.key)
        .bind(&task.output_prefix)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("写入任务记录成功: {}/{}", task.run_id, task.task_id);
        Ok(())
    }

    async fn get_task(&self, key: &TaskKey) -> PipelineResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM hca_tasks WHERE run_id = $1 AND task_id = $2")
            .bind(&key.run_id)
            .bind(&key.task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn query_tasks(&self, run_id: &str) -> PipelineResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM hca_tasks WHERE run_id = $1 ORDER BY task_id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn update_run_status_if(
        &self,
        run_id: &str,
        expected: RunStatus,
        new: RunStatus,
    ) -> PipelineResult<bool> {
        let result = sqlx::query("UPDATE hca_runs SET status = $1 WHERE run_id = $2 AND status = $3")
            .bind(new.as_str())
            .bind(run_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn complete_run_if_running(
        &self,
        run_id: &str,
        outcome: RunStatus,
        task_id: &str,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            "UPDATE hca_runs SET status = $1, completed_by = $2 WHERE run_id = $3 AND status = $4",
        )
        .bind(outcome.as_str())
        .bind(task_id)
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_consolidation_enqueued(&self, run_id: &str) -> PipelineResult<bool> {
        let result = sqlx::query(
            "UPDATE hca_runs SET consolidation_enqueued = 1 WHERE run_id = $1 AND consolidation_enqueued = 0",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task = %key))]
    async fn update_task_status_if(
        &self,
        key: &TaskKey,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE hca_tasks SET status = $1, updated_at = $2
            WHERE run_id = $3 AND task_id = $4 AND status = $5
            "#,
        )
        .bind(new.as_str())
        .bind(Utc::now())
        .bind(&key.run_id)
        .bind(&key.task_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
