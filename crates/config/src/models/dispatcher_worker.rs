use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 元数据文件扩展名（不含点）
    pub metadata_extension: String,
    /// 工作节点上图像数据桶的挂载目录
    pub image_mount_dir: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            metadata_extension: "xdce".to_string(),
            image_mount_dir: "/home/ubuntu/bucket/".to_string(),
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_extension(
            &self.metadata_extension,
            "dispatcher.metadata_extension",
        )?;
        ValidationUtils::validate_not_empty(&self.image_mount_dir, "dispatcher.image_mount_dir")?;
        Ok(())
    }
}

/// 消费循环的运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConsumerMode {
    /// 持续长轮询，直到收到关闭信号
    #[default]
    LongPoll,
    /// 处理到队列为空即退出
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisToolConfig {
    pub program: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub sentinel_file_name: String,
}

impl Default for AnalysisToolConfig {
    fn default() -> Self {
        Self {
            program: "cellprofiler".to_string(),
            extra_args: Vec::new(),
            sentinel_file_name: "done.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub mode: ConsumerMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tasks: Option<usize>,
    pub scratch_dir: PathBuf,
    pub analysis_tool: AnalysisToolConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            mode: ConsumerMode::LongPoll,
            max_tasks: None,
            scratch_dir: std::env::temp_dir().join("hca-worker"),
            analysis_tool: AnalysisToolConfig::default(),
        }
    }
}

/// `{hostname}-{pid}`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.worker_id, "worker.worker_id")?;
        if let Some(max_tasks) = self.max_tasks {
            ValidationUtils::validate_count(max_tasks, "worker.max_tasks", 1_000_000)?;
        }
        ValidationUtils::validate_not_empty(
            &self.scratch_dir.to_string_lossy(),
            "worker.scratch_dir",
        )?;
        ValidationUtils::validate_not_empty(
            &self.analysis_tool.program,
            "worker.analysis_tool.program",
        )?;
        ValidationUtils::validate_not_empty(
            &self.analysis_tool.sentinel_file_name,
            "worker.analysis_tool.sentinel_file_name",
        )?;
        if self.analysis_tool.sentinel_file_name.contains('/') {
            return Err(crate::ConfigError::Validation(
                "worker.analysis_tool.sentinel_file_name must be a plain file name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    pub mode: ConsumerMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<usize>,
    pub scratch_dir: PathBuf,
    /// 结果文件扩展名（不含点）
    pub result_extension: String,
    /// 随合并消息下发的排除模式，同时在合并时与消息中的模式合并使用
    pub excluded_filename_patterns: Vec<String>,
    pub combined_file_prefix: String,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            mode: ConsumerMode::LongPoll,
            max_messages: None,
            scratch_dir: std::env::temp_dir().join("hca-consolidator"),
            result_extension: "csv".to_string(),
            excluded_filename_patterns: vec!["Experiment.csv".to_string()],
            combined_file_prefix: "combined_".to_string(),
        }
    }
}

impl ConfigValidator for ConsolidatorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if let Some(max_messages) = self.max_messages {
            ValidationUtils::validate_count(max_messages, "consolidator.max_messages", 1_000_000)?;
        }
        ValidationUtils::validate_not_empty(
            &self.scratch_dir.to_string_lossy(),
            "consolidator.scratch_dir",
        )?;
        ValidationUtils::validate_extension(
            &self.result_extension,
            "consolidator.result_extension",
        )?;
        ValidationUtils::validate_not_empty(
            &self.combined_file_prefix,
            "consolidator.combined_file_prefix",
        )?;
        for pattern in &self.excluded_filename_patterns {
            ValidationUtils::validate_not_empty(pattern, "consolidator.excluded_filename_patterns")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_config_validation() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.metadata_extension = ".xdce".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.image_mount_dir = String::new();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_worker_config_validation() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_id.ends_with(&std::process::id().to_string()));

        let mut invalid = config.clone();
        invalid.worker_id = "".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.max_tasks = Some(0);
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.analysis_tool.sentinel_file_name = "out/done.txt".to_string();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_consolidator_config_validation() {
        let config = ConsolidatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.excluded_filename_patterns, vec!["Experiment.csv"]);

        let mut invalid = config;
        invalid.excluded_filename_patterns.push("  ".to_string());
        assert!(invalid.validate().is_err());
    }
}
