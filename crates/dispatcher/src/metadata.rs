//! 元数据拆分
//!
//! 读取 `.xdce` 元数据文档，把图像按 (孔, 视野) 分组成行，
//! 再按孔切分为每个任务的输入清单。

use std::collections::HashMap;

use hca_domain::value_objects::ensure_trailing_slash;
use hca_errors::{PipelineError, PipelineResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, instrument};

/// 每行固定的列，位于通道列之前
pub const FIXED_COLUMNS: [&str; 4] = ["Row_Number", "Column_Number", "Well_Location", "Field_Index"];

/// 通道列名前缀
pub const CHANNEL_COLUMN_PREFIX: &str = "URL_";

/// 文档中的一个 `Image` 元素
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub filename: String,
    pub well: String,
    pub row_number: String,
    pub column_number: String,
    pub field_index: String,
    pub channel: String,
}

impl ImageRecord {
    pub fn group_key(&self) -> String {
        format!("{}@{}", self.well, self.field_index)
    }
}

/// 一个 (孔, 视野) 分组，通道按首次出现顺序保存
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRow {
    pub well: String,
    pub row_number: String,
    pub column_number: String,
    pub field_index: String,
    pub channels: Vec<(String, String)>,
}

impl ImageRow {
    fn from_record(record: &ImageRecord, url: String) -> Self {
        Self {
            well: record.well.clone(),
            row_number: record.row_number.clone(),
            column_number: record.column_number.clone(),
            field_index: record.field_index.clone(),
            channels: vec![(record.channel.clone(), url)],
        }
    }

    /// 同一通道再次出现时覆盖原值
    fn set_channel(&mut self, channel: &str, url: String) {
        match self.channels.iter_mut().find(|(name, _)| name == channel) {
            Some((_, existing)) => *existing = url,
            None => self.channels.push((channel.to_string(), url)),
        }
    }

    pub fn channel_url(&self, channel: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, url)| url.as_str())
    }
}

/// 同一个孔的所有行，对应一个任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WellPartition {
    pub well: String,
    pub rows: Vec<ImageRow>,
}

impl WellPartition {
    /// 分区内出现过的通道，按首次出现顺序
    pub fn channels(&self) -> Vec<&str> {
        let mut channels: Vec<&str> = Vec::new();
        for row in &self.rows {
            for (name, _) in &row.channels {
                if !channels.contains(&name.as_str()) {
                    channels.push(name);
                }
            }
        }
        channels
    }

    pub fn header(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(
                self.channels()
                    .into_iter()
                    .map(|c| format!("{CHANNEL_COLUMN_PREFIX}{c}")),
            )
            .collect()
    }

    /// 写成 CSV，缺失的通道单元格留空
    pub fn to_csv(&self) -> PipelineResult<Vec<u8>> {
        let channels = self.channels();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.header())?;
        for row in &self.rows {
            let mut record = vec![
                row.row_number.as_str(),
                row.column_number.as_str(),
                row.well.as_str(),
                row.field_index.as_str(),
            ];
            record.extend(
                channels
                    .iter()
                    .map(|channel| row.channel_url(channel).unwrap_or("")),
            );
            writer.write_record(&record)?;
        }
        writer
            .into_inner()
            .map_err(|e| PipelineError::Internal(format!("CSV 写入失败: {e}")))
    }
}

#[derive(Debug, Default)]
struct ImageBuilder {
    filename: String,
    well: Option<String>,
    row_number: Option<String>,
    column_number: Option<String>,
    field_index: Option<String>,
    channel: Option<String>,
}

impl ImageBuilder {
    fn build(self) -> PipelineResult<ImageRecord> {
        let missing = |what: &str| {
            PipelineError::metadata_parse(format!("图像 {} 缺少 {what}", self.filename))
        };
        Ok(ImageRecord {
            well: self.well.clone().ok_or_else(|| missing("Well label"))?,
            row_number: self.row_number.clone().ok_or_else(|| missing("Row number"))?,
            column_number: self
                .column_number
                .clone()
                .ok_or_else(|| missing("Column number"))?,
            field_index: self
                .field_index
                .clone()
                .ok_or_else(|| missing("Identifier field_index"))?,
            channel: self
                .channel
                .clone()
                .ok_or_else(|| missing("EmissionFilter name"))?,
            filename: self.filename,
        })
    }
}

fn required_attribute(element: &BytesStart<'_>, name: &str) -> PipelineResult<String> {
    let element_name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
    let attribute = element
        .try_get_attribute(name)
        .map_err(|e| PipelineError::metadata_parse(format!("{element_name} 属性无效: {e}")))?
        .ok_or_else(|| {
            PipelineError::metadata_parse(format!("{element_name} 缺少属性 {name}"))
        })?;
    let value = attribute
        .unescape_value()
        .map_err(|e| PipelineError::metadata_parse(format!("{element_name}.{name} 无法解码: {e}")))?;
    Ok(value.into_owned())
}

#[derive(Debug, Clone)]
pub struct MetadataSplitter {
    image_mount_dir: String,
}

impl MetadataSplitter {
    pub fn new(image_mount_dir: impl AsRef<str>) -> Self {
        Self {
            image_mount_dir: ensure_trailing_slash(image_mount_dir.as_ref()),
        }
    }

    /// 按文档顺序读出所有 `Image` 元素
    pub fn parse_images(&self, document: &str) -> PipelineResult<Vec<ImageRecord>> {
        let mut reader = Reader::from_str(document);
        reader.config_mut().trim_text(true);

        let mut images = Vec::new();
        let mut current: Option<ImageBuilder> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                PipelineError::metadata_parse(format!(
                    "XML 解析失败 (位置 {}): {e}",
                    reader.buffer_position()
                ))
            })?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    match e.local_name().as_ref() {
                        b"Image" => {
                            let builder = ImageBuilder {
                                filename: required_attribute(e, "filename")?,
                                ..Default::default()
                            };
                            if is_empty {
                                images.push(builder.build()?);
                            } else {
                                current = Some(builder);
                            }
                        }
                        name => {
                            if let Some(builder) = current.as_mut() {
                                match name {
                                    b"Well" => builder.well = Some(required_attribute(e, "label")?),
                                    b"Row" => {
                                        builder.row_number = Some(required_attribute(e, "number")?)
                                    }
                                    b"Column" => {
                                        builder.column_number =
                                            Some(required_attribute(e, "number")?)
                                    }
                                    b"Identifier" => {
                                        builder.field_index =
                                            Some(required_attribute(e, "field_index")?)
                                    }
                                    b"EmissionFilter" => {
                                        builder.channel = Some(required_attribute(e, "name")?)
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
                Event::End(ref e) if e.local_name().as_ref() == b"Image" => {
                    if let Some(builder) = current.take() {
                        images.push(builder.build()?);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        debug!("元数据中共有 {} 个图像", images.len());
        Ok(images)
    }

    /// 按 (孔, 视野) 分组，行顺序为分组首次出现的顺序
    pub fn group_rows(&self, images: &[ImageRecord], image_prefix: &str) -> Vec<ImageRow> {
        let base = format!(
            "file:{}{}",
            self.image_mount_dir,
            ensure_trailing_slash(image_prefix)
        );
        let mut rows: Vec<ImageRow> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for image in images {
            let url = format!("{base}{}", image.filename);
            match index.get(&image.group_key()) {
                Some(&position) => rows[position].set_channel(&image.channel, url),
                None => {
                    index.insert(image.group_key(), rows.len());
                    rows.push(ImageRow::from_record(image, url));
                }
            }
        }
        rows
    }

    /// 按孔切分，分区按孔首次出现的顺序排列，分区内保持行顺序
    pub fn partition(rows: Vec<ImageRow>) -> Vec<WellPartition> {
        let mut partitions: Vec<WellPartition> = Vec::new();
        for row in rows {
            match partitions.iter_mut().find(|p| p.well == row.well) {
                Some(partition) => partition.rows.push(row),
                None => partitions.push(WellPartition {
                    well: row.well.clone(),
                    rows: vec![row],
                }),
            }
        }
        partitions
    }

    #[instrument(skip(self, document))]
    pub fn split(&self, document: &str, image_prefix: &str) -> PipelineResult<Vec<WellPartition>> {
        let images = self.parse_images(document)?;
        let rows = self.group_rows(&images, image_prefix);
        let partitions = Self::partition(rows);
        debug!("拆分为 {} 个孔", partitions.len());
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ImageStack>
  <Images>
    <Image filename="A1_f1_dapi.tif">
      <Well label="A - 1"><Row number="1"/><Column number="1"/></Well>
      <Identifier field_index="1"/>
      <EmissionFilter name="DAPI"/>
    </Image>
    <Image filename="A1_f1_fitc.tif">
      <Well label="A - 1"><Row number="1"/><Column number="1"/></Well>
      <Identifier field_index="1"/>
      <EmissionFilter name="FITC"/>
    </Image>
    <Image filename="B2_f1_dapi.tif">
      <Well label="B - 2"><Row number="2"/><Column number="2"/></Well>
      <Identifier field_index="1"/>
      <EmissionFilter name="DAPI"/>
    </Image>
    <Image filename="A1_f2_dapi.tif">
      <Well label="A - 1"><Row number="1"/><Column number="1"/></Well>
      <Identifier field_index="2"/>
      <EmissionFilter name="DAPI"/>
    </Image>
  </Images>
</ImageStack>"#;

    fn splitter() -> MetadataSplitter {
        MetadataSplitter::new("/mnt/bucket")
    }

    #[test]
    fn test_parse_images() {
        let images = splitter().parse_images(DOC).unwrap();
        assert_eq!(images.len(), 4);
        assert_eq!(images[0].filename, "A1_f1_dapi.tif");
        assert_eq!(images[0].well, "A - 1");
        assert_eq!(images[1].channel, "FITC");
        assert_eq!(images[3].group_key(), "A - 1@2");
    }

    #[test]
    fn test_group_rows_merges_channels() {
        let s = splitter();
        let images = s.parse_images(DOC).unwrap();
        let rows = s.group_rows(&images, "plate1");

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].channels.len(), 2);
        assert_eq!(
            rows[0].channel_url("FITC"),
            Some("file:/mnt/bucket/plate1/A1_f1_fitc.tif")
        );
        assert_eq!(rows[1].well, "B - 2");
        assert_eq!(rows[2].field_index, "2");
    }

    #[test]
    fn test_later_image_overwrites_channel() {
        let s = splitter();
        let mut images = s.parse_images(DOC).unwrap();
        let mut again = images[0].clone();
        again.filename = "retake.tif".to_string();
        images.push(again);

        let rows = s.group_rows(&images, "plate1/");
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0].channel_url("DAPI"),
            Some("file:/mnt/bucket/plate1/retake.tif")
        );
    }

    #[test]
    fn test_partition_by_well() {
        let partitions = splitter().split(DOC, "plate1").unwrap();
        let wells: Vec<&str> = partitions.iter().map(|p| p.well.as_str()).collect();
        assert_eq!(wells, vec!["A - 1", "B - 2"]);
        assert_eq!(partitions[0].rows.len(), 2);
        assert_eq!(partitions[0].rows[0].field_index, "1");
        assert_eq!(partitions[0].rows[1].field_index, "2");
    }

    #[test]
    fn test_to_csv_fills_missing_cells() {
        let partitions = splitter().split(DOC, "plate1").unwrap();
        let csv = String::from_utf8(partitions[0].to_csv().unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "Row_Number,Column_Number,Well_Location,Field_Index,URL_DAPI,URL_FITC"
        );
        assert_eq!(
            lines[1],
            "1,1,A - 1,1,file:/mnt/bucket/plate1/A1_f1_dapi.tif,file:/mnt/bucket/plate1/A1_f1_fitc.tif"
        );
        assert_eq!(lines[2], "1,1,A - 1,2,file:/mnt/bucket/plate1/A1_f2_dapi.tif,");
    }

    #[test]
    fn test_missing_attribute_is_parse_error() {
        let doc = r#"<Images><Image filename="x.tif"><Well label="A - 1"><Row number="1"/></Well></Image></Images>"#;
        let err = splitter().parse_images(doc).unwrap_err();
        assert!(matches!(err, PipelineError::MetadataParse(_)));

        let doc = r#"<Images><Image><Well label="A - 1"/></Image></Images>"#;
        assert!(matches!(
            splitter().parse_images(doc).unwrap_err(),
            PipelineError::MetadataParse(_)
        ));
    }

    #[test]
    fn test_malformed_xml() {
        let err = splitter()
            .parse_images("<Images><Image filename=\"a\"></Images>")
            .unwrap_err();
        assert!(matches!(err, PipelineError::MetadataParse(_)));
    }

    #[test]
    fn test_empty_document() {
        let partitions = splitter().split("<Images/>", "p").unwrap();
        assert!(partitions.is_empty());
    }
}
