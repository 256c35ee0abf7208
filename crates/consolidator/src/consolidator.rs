use std::sync::Arc;

use hca_config::ConsolidatorConfig;
use hca_domain::{base_name, ensure_trailing_slash, BlobStore, ConsolidationMessage};
use hca_errors::PipelineResult;
use hca_infrastructure::ScratchArea;
use tracing::{debug, info, instrument, warn};

use crate::merge::CsvMerger;
use crate::selection::{ExclusionRules, ResultSelection};

/// 上传到最终结果目录的一个合并文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedFile {
    pub key: String,
    pub sources: Vec<String>,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub run_id: String,
    pub files: Vec<CombinedFile>,
}

pub struct ResultConsolidator {
    blob_store: Arc<dyn BlobStore>,
    scratch: ScratchArea,
    result_extension: String,
    configured_exclusions: Vec<String>,
    combined_file_prefix: String,
    merger: CsvMerger,
}

impl ResultConsolidator {
    pub fn new(blob_store: Arc<dyn BlobStore>, scratch: ScratchArea, config: &ConsolidatorConfig) -> Self {
        Self {
            blob_store,
            scratch,
            result_extension: config.result_extension.clone(),
            configured_exclusions: config.excluded_filename_patterns.clone(),
            combined_file_prefix: config.combined_file_prefix.clone(),
            merger: CsvMerger,
        }
    }

    pub fn scratch(&self) -> &ScratchArea {
        &self.scratch
    }

    fn selection_for(&self, message: &ConsolidationMessage) -> ResultSelection {
        let patterns = self
            .configured_exclusions
            .iter()
            .chain(&message.excluded_filename_patterns);
        ResultSelection::new(
            &message.sub_task_record_prefix,
            &self.result_extension,
            ExclusionRules::new(patterns),
        )
    }

    /// 重复执行会覆盖同名的合并文件
    #[instrument(skip(self, message), fields(run_id = %message.run_id))]
    pub async fn consolidate(&self, message: &ConsolidationMessage) -> PipelineResult<ConsolidationReport> {
        let bucket = message.run_record_bucket.as_str();
        let listing = self
            .blob_store
            .list(bucket, &ensure_trailing_slash(&message.sub_task_record_prefix), true)
            .await?;
        let groups = self.selection_for(message).group(&listing.files);
        if groups.is_empty() {
            info!("运行 {} 没有可合并的结果文件", message.run_id);
        }

        let final_prefix = ensure_trailing_slash(&message.final_output_prefix);
        let mut files = Vec::with_capacity(groups.len());
        for (file_name, members) in groups {
            let combined_name = format!("{}{}", self.combined_file_prefix, file_name);
            let key = format!("{final_prefix}{combined_name}");
            let result = self
                .merge_group(bucket, &members, &combined_name, &key)
                .await;
            if let Err(e) = self.scratch.clear().await {
                warn!("清理临时目录失败: {}", e);
            }
            let rows = result?;
            info!("已合并 {} 个 {} 共 {} 行到 {}", members.len(), file_name, rows, key);
            files.push(CombinedFile {
                key,
                sources: members,
                rows,
            });
        }

        metrics::counter!("hca_consolidations_total").increment(1);
        Ok(ConsolidationReport {
            run_id: message.run_id.clone(),
            files,
        })
    }

    async fn merge_group(
        &self,
        bucket: &str,
        members: &[String],
        combined_name: &str,
        key: &str,
    ) -> PipelineResult<usize> {
        self.scratch.prepare().await?;
        let input_dir = self.scratch.input_dir();

        // 同组文件同名，本地用序号区分
        let mut local_paths = Vec::with_capacity(members.len());
        for (index, member) in members.iter().enumerate() {
            let path = input_dir.join(format!("{index}_{}", base_name(member)));
            self.blob_store.download_file(bucket, member, &path).await?;
            local_paths.push(path);
        }

        let table = self.merger.merge_files(&local_paths).await?;
        let combined_path = self.scratch.output_dir().join(combined_name);
        self.merger.write(&table, &combined_path).await?;
        self.blob_store.upload_file(&combined_path, bucket, key).await?;
        debug!("已上传合并文件 {}", key);
        Ok(table.row_count())
    }
}
