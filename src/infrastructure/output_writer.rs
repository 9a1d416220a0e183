//! 列式批量输出 - 基础设施层
//!
//! 每张表一个 writer：内存缓冲，达到批大小后整批写成一个新的 Parquet 文件。
//! 文件名 = `{table}_run_{run}_w{worker}_{UTC 时间戳}_{uuid}.parquet`，并发 worker 之间不会冲突。

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, ListBuilder, StringArray, StringBuilder, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::models::{AttributeRecord, FileRecord, GuaranteeRecord};

/// 可写入列式文件的记录类型
pub trait ColumnarRecord: Sized {
    /// 表名（也是文件名前缀）
    const TABLE: &'static str;

    fn schema() -> Arc<Schema>;

    fn to_batch(rows: &[Self]) -> Result<RecordBatch>;
}

/// 批量 Parquet 写入器
pub struct ParquetBatchWriter<R: ColumnarRecord> {
    output_dir: PathBuf,
    prefix: String,
    batch_size: usize,
    buffer: Vec<R>,
}

impl<R: ColumnarRecord> ParquetBatchWriter<R> {
    pub fn new(output_dir: impl Into<PathBuf>, run_id: u64, worker_id: usize, batch_size: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            prefix: format!("{}_run_{}_w{}", R::TABLE, run_id, worker_id),
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 追加记录，缓冲达到批大小时落盘
    pub fn add(&mut self, records: impl IntoIterator<Item = R>) -> Result<Option<PathBuf>> {
        self.buffer.extend(records);
        if self.buffer.len() >= self.batch_size {
            self.flush()
        } else {
            Ok(None)
        }
    }

    /// 把整个缓冲写成一个文件；缓冲为空时不写文件
    ///
    /// 写入失败时缓冲保留，下次 flush 会重试。
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("无法创建目录: {}", self.output_dir.display()))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let file_name = format!("{}_{}_{}.parquet", self.prefix, stamp, uuid::Uuid::new_v4().simple());
        let path = self.output_dir.join(file_name);

        let batch = R::to_batch(&self.buffer)?;
        write_parquet(&path, &batch)?;

        debug!("写入 {} 行到 {}", self.buffer.len(), path.display());
        self.buffer.clear();
        Ok(Some(path))
    }
}

/// 先写 `.tmp` 再改名，目录里只会出现完整文件
fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let tmp = path.with_extension("parquet.tmp");
    let file = File::create(&tmp).with_context(|| format!("无法创建: {}", tmp.display()))?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    fs::rename(&tmp, path).with_context(|| format!("无法替换: {}", path.display()))?;
    Ok(())
}

fn utf8<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values))
}

fn u64s(values: impl Iterator<Item = u64>) -> ArrayRef {
    Arc::new(UInt64Array::from_iter_values(values))
}

fn u32s(values: impl Iterator<Item = u32>) -> ArrayRef {
    Arc::new(UInt32Array::from_iter_values(values))
}

// ========== 表结构 ==========

impl ColumnarRecord for GuaranteeRecord {
    const TABLE: &'static str = "guarantees";

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("run_id", DataType::UInt64, false),
            Field::new("id", DataType::UInt64, false),
            Field::new("status", DataType::Utf8, false),
            Field::new("general_url", DataType::Utf8, false),
            Field::new("documents_url", DataType::Utf8, false),
            Field::new("fetched_at", DataType::Utf8, false),
            Field::new(
                "warnings",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
                false,
            ),
            Field::new("error", DataType::Utf8, false),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let mut warnings = ListBuilder::new(StringBuilder::new());
        for row in rows {
            for warning in &row.warnings {
                warnings.values().append_value(warning);
            }
            warnings.append(true);
        }
        let fetched_at: Vec<String> = rows.iter().map(|r| r.fetched_at.to_rfc3339()).collect();

        let columns: Vec<ArrayRef> = vec![
            u64s(rows.iter().map(|r| r.run_id)),
            u64s(rows.iter().map(|r| r.id)),
            utf8(rows.iter().map(|r| r.status.as_str())),
            utf8(rows.iter().map(|r| r.general_url.as_str())),
            utf8(rows.iter().map(|r| r.documents_url.as_str())),
            utf8(fetched_at.iter().map(String::as_str)),
            Arc::new(warnings.finish()),
            utf8(rows.iter().map(|r| r.error.as_str())),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }
}

impl ColumnarRecord for AttributeRecord {
    const TABLE: &'static str = "attributes";

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("run_id", DataType::UInt64, false),
            Field::new("id", DataType::UInt64, false),
            Field::new("section", DataType::Utf8, false),
            Field::new("field_name", DataType::Utf8, false),
            Field::new("field_value", DataType::Utf8, false),
            Field::new("document_index", DataType::UInt32, true),
            Field::new("document_number", DataType::Utf8, true),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let document_index: UInt32Array = rows.iter().map(|r| r.document_index).collect();
        let document_number: StringArray =
            rows.iter().map(|r| r.document_number.as_deref()).collect();

        let columns: Vec<ArrayRef> = vec![
            u64s(rows.iter().map(|r| r.run_id)),
            u64s(rows.iter().map(|r| r.id)),
            utf8(rows.iter().map(|r| r.section.as_str())),
            utf8(rows.iter().map(|r| r.field_name.as_str())),
            utf8(rows.iter().map(|r| r.field_value.as_str())),
            Arc::new(document_index),
            Arc::new(document_number),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }
}

impl ColumnarRecord for FileRecord {
    const TABLE: &'static str = "files";

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("run_id", DataType::UInt64, false),
            Field::new("id", DataType::UInt64, false),
            Field::new("file_index", DataType::UInt32, false),
            Field::new("stored_filename", DataType::Utf8, false),
            Field::new("stored_path", DataType::Utf8, false),
            Field::new("original_filename", DataType::Utf8, false),
            Field::new("download_url", DataType::Utf8, false),
            Field::new("document_index", DataType::UInt32, false),
            Field::new("document_number", DataType::Utf8, false),
            Field::new("page_count", DataType::UInt32, false),
            Field::new("mime_type", DataType::Utf8, false),
            Field::new("download_status", DataType::Utf8, false),
            Field::new("sha256", DataType::Utf8, false),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            u64s(rows.iter().map(|r| r.run_id)),
            u64s(rows.iter().map(|r| r.id)),
            u32s(rows.iter().map(|r| r.file_index)),
            utf8(rows.iter().map(|r| r.stored_filename.as_str())),
            utf8(rows.iter().map(|r| r.stored_path.as_str())),
            utf8(rows.iter().map(|r| r.original_filename.as_str())),
            utf8(rows.iter().map(|r| r.download_url.as_str())),
            u32s(rows.iter().map(|r| r.document_index)),
            utf8(rows.iter().map(|r| r.document_number.as_str())),
            u32s(rows.iter().map(|r| r.page_count)),
            utf8(rows.iter().map(|r| r.mime_type.as_str())),
            utf8(rows.iter().map(|r| r.download_status.as_str())),
            utf8(rows.iter().map(|r| r.sha256.as_str())),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }
}

/// 一个 worker 的三张表输出
pub struct TableWriters {
    pub guarantees: ParquetBatchWriter<GuaranteeRecord>,
    pub attributes: ParquetBatchWriter<AttributeRecord>,
    pub files: ParquetBatchWriter<FileRecord>,
}

impl TableWriters {
    pub fn new(processed_dir: &Path, run_id: u64, worker_id: usize, batch_size: usize) -> Self {
        Self {
            guarantees: ParquetBatchWriter::new(processed_dir.join("guarantees"), run_id, worker_id, batch_size),
            attributes: ParquetBatchWriter::new(processed_dir.join("attributes"), run_id, worker_id, batch_size),
            files: ParquetBatchWriter::new(processed_dir.join("files"), run_id, worker_id, batch_size),
        }
    }

    /// 写入一个 ID 的全部记录
    pub fn add(
        &mut self,
        guarantee: GuaranteeRecord,
        attributes: Vec<AttributeRecord>,
        files: Vec<FileRecord>,
    ) -> Result<()> {
        // 三张表都先入缓冲，再报告第一个写入错误
        let guarantees = self.guarantees.add([guarantee]);
        let attributes = self.attributes.add(attributes);
        let files = self.files.add(files);
        guarantees?;
        attributes?;
        files?;
        Ok(())
    }

    /// 三张表的缓冲都已写出
    pub fn is_drained(&self) -> bool {
        self.guarantees.buffered() == 0 && self.attributes.buffered() == 0 && self.files.buffered() == 0
    }

    /// 收尾：写出所有剩余缓冲
    pub fn flush_all(&mut self) -> Result<()> {
        self.guarantees.flush()?;
        self.attributes.flush()?;
        self.files.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    fn guarantee(id: u64, warnings: &[&str]) -> GuaranteeRecord {
        GuaranteeRecord {
            run_id: 3,
            id,
            status: Status::Partial,
            general_url: format!("http://g/{}", id),
            documents_url: format!("http://d/{}", id),
            fetched_at: Utc::now(),
            warnings: warnings.iter().map(|w| w.to_string()).collect(),
            error: String::new(),
        }
    }

    fn read_rows(path: &Path) -> Vec<RecordBatch> {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|b| b.unwrap())
            .collect()
    }

    #[test]
    fn test_flush_on_empty_buffer_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut writer = ParquetBatchWriter::<GuaranteeRecord>::new(dir.path(), 1, 1, 10);
        assert!(writer.flush().unwrap().is_none());
        assert!(writer.flush().unwrap().is_none());
        assert!(!dir.path().join("anything").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_batch_threshold_triggers_flush() {
        let dir = tempdir().unwrap();
        let mut writer = ParquetBatchWriter::<GuaranteeRecord>::new(dir.path(), 3, 2, 2);
        assert!(writer.add([guarantee(1, &[])]).unwrap().is_none());
        let path = writer.add([guarantee(2, &["a", "b"])]).unwrap().unwrap();
        assert_eq!(writer.buffered(), 0);

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("guarantees_run_3_w2_"));
        assert!(name.ends_with(".parquet"));

        let batches = read_rows(&path);
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        let warnings = batches[0].column_by_name("warnings").unwrap();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_file_names_never_collide() {
        let dir = tempdir().unwrap();
        let mut writer = ParquetBatchWriter::<GuaranteeRecord>::new(dir.path(), 1, 1, 1);
        let a = writer.add([guarantee(1, &[])]).unwrap().unwrap();
        let b = writer.add([guarantee(2, &[])]).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_failed_flush_keeps_rows_buffered() {
        let dir = tempdir().unwrap();
        // 目录位置被普通文件占用
        fs::write(dir.path().join("guarantees"), b"").unwrap();
        let mut writers = TableWriters::new(dir.path(), 1, 1, 10);
        writers.add(guarantee(1, &[]), Vec::new(), Vec::new()).unwrap();
        assert!(!writers.is_drained());

        assert!(writers.flush_all().is_err());
        assert_eq!(writers.guarantees.buffered(), 1);

        fs::remove_file(dir.path().join("guarantees")).unwrap();
        writers.flush_all().unwrap();
        assert!(writers.is_drained());
    }

    #[test]
    fn test_attribute_nullable_columns() {
        let rows = vec![
            AttributeRecord {
                run_id: 1,
                id: 5,
                section: "S".to_string(),
                field_name: "f".to_string(),
                field_value: "v".to_string(),
                document_index: None,
                document_number: None,
            },
            AttributeRecord {
                run_id: 1,
                id: 5,
                section: "S".to_string(),
                field_name: "f".to_string(),
                field_value: "v2".to_string(),
                document_index: Some(2),
                document_number: Some("N-1".to_string()),
            },
        ];
        let batch = AttributeRecord::to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let index = batch.column_by_name("document_index").unwrap();
        assert!(index.is_null(0));
        assert!(!index.is_null(1));
    }
}
