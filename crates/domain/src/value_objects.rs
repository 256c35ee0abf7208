use serde::{Deserialize, Serialize};

/// 保证前缀以 `/` 结尾（空前缀保持为空，表示桶根目录）
pub fn ensure_trailing_slash(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// 存储键的最后一段（文件名）
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// 存储中的一个“目录”位置：桶 + 前缀
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
    pub bucket: String,
    pub prefix: String,
}

impl BlobLocation {
    pub fn new<B: Into<String>, P: AsRef<str>>(bucket: B, prefix: P) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: ensure_trailing_slash(prefix.as_ref()),
        }
    }

    pub fn object<S: AsRef<str>>(&self, relative_key: S) -> BlobObject {
        BlobObject::new(
            self.bucket.clone(),
            format!("{}{}", self.prefix, relative_key.as_ref()),
        )
    }
}

impl std::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix)
    }
}

/// 存储中的单个对象：桶 + 键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobObject {
    pub bucket: String,
    pub key: String,
}

impl BlobObject {
    pub fn new<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        base_name(&self.key)
    }
}

impl std::fmt::Display for BlobObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// 一次运行在记录目录下的存储布局
///
/// ```text
/// {prefix}{run_id}/sub_tasks/{well}/input/{well}.csv
/// {prefix}{run_id}/sub_tasks/{well}/output/
/// {prefix}{run_id}/consolidated_results/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecordLayout {
    bucket: String,
    run_root: String,
}

impl RunRecordLayout {
    pub const SUB_TASKS_DIR: &'static str = "sub_tasks";
    pub const INPUT_DIR: &'static str = "input";
    pub const OUTPUT_DIR: &'static str = "output";
    pub const CONSOLIDATED_DIR: &'static str = "consolidated_results";

    pub fn new(record_location: &BlobLocation, run_id: &str) -> Self {
        Self {
            bucket: record_location.bucket.clone(),
            run_root: format!("{}{}/", record_location.prefix, run_id),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn run_root(&self) -> &str {
        &self.run_root
    }

    pub fn sub_task_record_prefix(&self) -> String {
        format!("{}{}/", self.run_root, Self::SUB_TASKS_DIR)
    }

    pub fn task_input_rowset(&self, well: &str) -> BlobObject {
        BlobObject::new(
            self.bucket.clone(),
            format!(
                "{}{well}/{}/{well}.csv",
                self.sub_task_record_prefix(),
                Self::INPUT_DIR
            ),
        )
    }

    pub fn task_output_prefix(&self, well: &str) -> String {
        format!(
            "{}{well}/{}/",
            self.sub_task_record_prefix(),
            Self::OUTPUT_DIR
        )
    }

    pub fn final_output_prefix(&self) -> String {
        format!("{}{}/", self.run_root, Self::CONSOLIDATED_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_trailing_slash() {
        assert_eq!(ensure_trailing_slash("analysis_result"), "analysis_result/");
        assert_eq!(ensure_trailing_slash("analysis_result/"), "analysis_result/");
        assert_eq!(ensure_trailing_slash(""), "");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("a/b/c.csv"), "c.csv");
        assert_eq!(base_name("c.csv"), "c.csv");
    }

    #[test]
    fn test_run_record_layout() {
        let record = BlobLocation::new("hca-cloud-native", "run_history");
        let layout = RunRecordLayout::new(&record, "20190626_ABC123");

        assert_eq!(layout.bucket(), "hca-cloud-native");
        assert_eq!(layout.run_root(), "run_history/20190626_ABC123/");
        assert_eq!(
            layout.sub_task_record_prefix(),
            "run_history/20190626_ABC123/sub_tasks/"
        );
        assert_eq!(
            layout.task_input_rowset("A - 1").key,
            "run_history/20190626_ABC123/sub_tasks/A - 1/input/A - 1.csv"
        );
        assert_eq!(
            layout.task_output_prefix("A - 1"),
            "run_history/20190626_ABC123/sub_tasks/A - 1/output/"
        );
        assert_eq!(
            layout.final_output_prefix(),
            "run_history/20190626_ABC123/consolidated_results/"
        );
    }

    #[test]
    fn test_blob_location_object() {
        let location = BlobLocation::new("bucket", "pipeline_files");
        let object = location.object("test.cppipe");
        assert_eq!(object.key, "pipeline_files/test.cppipe");
        assert_eq!(object.file_name(), "test.cppipe");
        assert_eq!(object.to_string(), "bucket/pipeline_files/test.cppipe");
    }
}
