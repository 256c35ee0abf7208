use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use hca_config::AnalysisToolConfig;
use hca_domain::{AnalysisRequest, AnalysisTool, ToolExit};
use hca_errors::{PipelineError, PipelineResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// CellProfiler 2 流程文件中的标记，需要额外加 `-b`
const CP2_PIPELINE_MARKER: &str = "DateRevision:2";

/// 以无界面模式调用 CellProfiler
pub struct CellProfilerTool {
    program: String,
    extra_args: Vec<String>,
}

impl CellProfilerTool {
    pub fn new(config: &AnalysisToolConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    pub async fn is_cp2_pipeline(pipeline_path: &Path) -> PipelineResult<bool> {
        let content = tokio::fs::read(pipeline_path).await?;
        Ok(String::from_utf8_lossy(&content).contains(CP2_PIPELINE_MARKER))
    }

    pub fn command_args(&self, request: &AnalysisRequest, cp2_pipeline: bool) -> Vec<String> {
        let mut args = vec!["-c".to_string(), "-r".to_string()];
        if cp2_pipeline {
            args.push("-b".to_string());
        }
        args.push("-p".to_string());
        args.push(request.pipeline_path.display().to_string());
        args.push(format!("--data-file={}", request.rowset_path.display()));
        args.push("-o".to_string());
        args.push(request.output_dir.display().to_string());
        args.push("-d".to_string());
        args.push(request.sentinel_path.display().to_string());
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AnalysisTool for CellProfilerTool {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, request: &AnalysisRequest) -> PipelineResult<ToolExit> {
        let start_time = Instant::now();
        let cp2 = Self::is_cp2_pipeline(&request.pipeline_path).await?;
        let args = self.command_args(request, cp2);

        info!(
            "执行分析工具: task_id={}, command={} {}",
            request.task_id,
            self.program,
            args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::analysis_failure(format!("启动 {} 失败: {e}", self.program))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::analysis_failure("无法获取stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::analysis_failure("无法获取stderr"))?;

        // 工具运行时间很长，输出逐行转发到日志
        let task_id = request.task_id.as_str();
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id, "{}", line);
            }
        };
        let stderr_task = async {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id, stream = "stderr", "{}", line);
            }
        };
        tokio::join!(stdout_task, stderr_task);

        let exit_status = child
            .wait()
            .await
            .map_err(|e| PipelineError::analysis_failure(format!("等待进程结束失败: {e}")))?;

        let exit = ToolExit {
            exit_code: exit_status.code(),
            success: exit_status.success(),
        };
        if exit.success {
            info!(
                "分析工具退出: task_id={}, 耗时 {}ms",
                request.task_id,
                start_time.elapsed().as_millis()
            );
        } else {
            warn!(
                "分析工具异常退出: task_id={}, exit_code={:?}",
                request.task_id, exit.exit_code
            );
        }
        Ok(exit)
    }
}
