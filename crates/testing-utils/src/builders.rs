//! 测试数据构造器

use chrono::{DateTime, Utc};
use hca_domain::{BlobLocation, BlobObject, Run, Task};

/// 构造 `.xdce` 元数据文档
///
/// ```rust
/// use hca_testing_utils::MetadataDocumentBuilder;
///
/// let xml = MetadataDocumentBuilder::new()
///     .with_well("A - 1", 1, 1, &[1, 2], &["DAPI", "FITC"])
///     .build();
/// assert!(xml.contains("A - 1"));
/// ```
#[derive(Debug, Default, Clone)]
pub struct MetadataDocumentBuilder {
    images: Vec<ImageSpec>,
}

#[derive(Debug, Clone)]
struct ImageSpec {
    filename: String,
    well: String,
    row: u32,
    column: u32,
    field: u32,
    channel: String,
}

impl MetadataDocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(
        mut self,
        filename: &str,
        well: &str,
        row: u32,
        column: u32,
        field: u32,
        channel: &str,
    ) -> Self {
        self.images.push(ImageSpec {
            filename: filename.to_string(),
            well: well.to_string(),
            row,
            column,
            field,
            channel: channel.to_string(),
        });
        self
    }

    /// 按视野、通道的顺序为一个孔生成图像，文件名为 `{well}_f{field}_{channel}.tif`
    pub fn with_well(
        mut self,
        well: &str,
        row: u32,
        column: u32,
        fields: &[u32],
        channels: &[&str],
    ) -> Self {
        let stem = well.replace(' ', "");
        for field in fields {
            for channel in channels {
                let filename = format!("{stem}_f{field}_{channel}.tif");
                self = self.with_image(&filename, well, row, column, *field, channel);
            }
        }
        self
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn build(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ImageStack>\n  <Images>\n");
        for image in &self.images {
            xml.push_str(&format!(
                concat!(
                    "    <Image filename=\"{}\" acquisition_time_ms=\"0\">\n",
                    "      <Well label=\"{}\">\n",
                    "        <Row number=\"{}\"/>\n",
                    "        <Column number=\"{}\"/>\n",
                    "      </Well>\n",
                    "      <Identifier field_index=\"{}\" z_index=\"0\"/>\n",
                    "      <EmissionFilter name=\"{}\" wavelength=\"0\"/>\n",
                    "    </Image>\n"
                ),
                image.filename, image.well, image.row, image.column, image.field, image.channel
            ));
        }
        xml.push_str("  </Images>\n</ImageStack>\n");
        xml
    }
}

/// 构造运行记录
pub struct RunBuilder {
    run_id: String,
    submitted_by: String,
    submit_timestamp: DateTime<Utc>,
    image_data: BlobLocation,
    pipeline: BlobObject,
    record_location: BlobLocation,
}

impl RunBuilder {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            submitted_by: "tester".to_string(),
            submit_timestamp: Utc::now(),
            image_data: BlobLocation::new("images", "plate1/"),
            pipeline: BlobObject::new("pipelines", "measure.cppipe"),
            record_location: BlobLocation::new("records", "analysis_result/"),
        }
    }

    pub fn with_submitted_by(mut self, submitted_by: &str) -> Self {
        self.submitted_by = submitted_by.to_string();
        self
    }

    pub fn with_image_data(mut self, bucket: &str, prefix: &str) -> Self {
        self.image_data = BlobLocation::new(bucket, prefix);
        self
    }

    pub fn with_pipeline(mut self, bucket: &str, key: &str) -> Self {
        self.pipeline = BlobObject::new(bucket, key);
        self
    }

    pub fn with_record_location(mut self, bucket: &str, prefix: &str) -> Self {
        self.record_location = BlobLocation::new(bucket, prefix);
        self
    }

    pub fn build(self) -> Run {
        Run::new(
            self.run_id,
            self.submitted_by,
            self.submit_timestamp,
            self.image_data,
            self.pipeline,
            self.record_location,
        )
        .expect("RunBuilder produced an invalid run")
    }

    /// 运行记录加上每个孔对应的 Scheduled 任务
    pub fn build_with_tasks(self, wells: &[&str]) -> (Run, Vec<Task>) {
        let run = self.build();
        let tasks = wells
            .iter()
            .map(|well| Task::scheduled(&run, well).expect("invalid well label"))
            .collect();
        (run, tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_builder() {
        let builder = MetadataDocumentBuilder::new()
            .with_well("A - 1", 1, 1, &[1, 2], &["DAPI", "FITC"])
            .with_image("extra.tif", "B - 2", 2, 2, 1, "DAPI");
        assert_eq!(builder.image_count(), 5);

        let xml = builder.build();
        assert!(xml.contains("filename=\"A-1_f2_FITC.tif\""));
        assert!(xml.contains("<Well label=\"B - 2\">"));
    }

    #[test]
    fn test_run_builder() {
        let (run, tasks) = RunBuilder::new("r1")
            .with_record_location("out", "results")
            .build_with_tasks(&["A - 1", "B - 2"]);
        assert_eq!(run.record_location.prefix, "results/");
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[1].input_rowset.key,
            "results/r1/sub_tasks/B - 2/input/B - 2.csv"
        );
    }
}
