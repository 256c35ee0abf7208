use std::path::Path;

use hca_errors::{PipelineError, PipelineResult};
use tracing::{debug, warn};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// 拼接后的表格，列为各来源表头的并集（按首次出现顺序）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MergedTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&mut self, header: &str) -> usize {
        match self.headers.iter().position(|h| h == header) {
            Some(index) => index,
            None => {
                self.headers.push(header.to_string());
                for row in &mut self.rows {
                    row.push(String::new());
                }
                self.headers.len() - 1
            }
        }
    }

    /// 追加一个来源表，保持其行顺序，缺失的列留空
    pub fn append(&mut self, source: &[u8]) -> PipelineResult<usize> {
        let source = source.strip_prefix(UTF8_BOM).unwrap_or(source);
        if source.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(0);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(source);
        let source_headers = reader.headers()?.clone();
        let mapping: Vec<usize> = source_headers
            .iter()
            .map(|header| self.column_index(header))
            .collect();

        let mut appended = 0;
        for record in reader.records() {
            let record = record?;
            let mut row = vec![String::new(); self.headers.len()];
            for (field, &column) in record.iter().zip(&mapping) {
                row[column] = field.to_string();
            }
            self.rows.push(row);
            appended += 1;
        }
        Ok(appended)
    }

    /// 以 UTF-8 BOM 开头的 CSV 文本
    pub fn to_csv(&self) -> PipelineResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| PipelineError::consolidation_error(e.to_string()))
    }
}

/// 把一组同名结果文件合并成一个文件
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvMerger;

impl CsvMerger {
    pub async fn merge_files(&self, sources: &[impl AsRef<Path>]) -> PipelineResult<MergedTable> {
        let mut table = MergedTable::default();
        for source in sources {
            let source = source.as_ref();
            let body = tokio::fs::read(source).await?;
            let appended = table.append(&body).map_err(|e| {
                PipelineError::consolidation_error(format!(
                    "无法解析结果文件 {}: {}",
                    source.display(),
                    e
                ))
            })?;
            if appended == 0 {
                warn!("结果文件 {} 没有数据行", source.display());
            }
            debug!("合并 {} 的 {} 行", source.display(), appended);
        }
        Ok(table)
    }

    pub async fn write(&self, table: &MergedTable, dest: &Path) -> PipelineResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, table.to_csv()?).await?;
        Ok(())
    }
}
