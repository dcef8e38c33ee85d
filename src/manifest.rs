//! 分片清单
//!
//! 清单是 `ManifestRecord` 的 JSON 数组，字段顺序固定，同样的输入总会得到逐字节相同的输出。

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Serializer;
use serde_json::ser::PrettyFormatter;

use crate::error::{PrepError, Result};
use crate::packer::ShardBoundary;
use crate::prepare::PreparedImage;
use crate::table::{FileInfo, ImageRecord, MetadataTable, RATING_BUCKETS};

/// 清单中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestRecord {
    pub index: u64,
    pub image_id: u64,
    /// 未找到文件时为空字符串
    pub file_hash: String,
    /// 未找到文件时为空字符串
    pub file_name: String,
    pub score_count: u32,
    pub score_dictionary: BTreeMap<u8, u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_tags: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<u32>,
}

impl From<&ImageRecord> for ManifestRecord {
    fn from(record: &ImageRecord) -> Self {
        let (file_hash, file_name) = match &record.file {
            Some(info) => (info.hash.clone(), info.name.clone()),
            None => (String::new(), String::new()),
        };
        Self {
            index: record.index,
            image_id: record.id,
            file_hash,
            file_name,
            score_count: record.score_count,
            score_dictionary: record.score_dictionary(),
            semantic_tags: record.semantic_tags.clone(),
            challenge_id: record.challenge_id,
        }
    }
}

impl ManifestRecord {
    /// 哈希与文件名都非空时返回文件信息
    pub fn file_info(&self) -> Option<FileInfo> {
        if self.file_hash.is_empty() || self.file_name.is_empty() {
            return None;
        }
        Some(FileInfo { hash: self.file_hash.clone(), name: self.file_name.clone() })
    }

    pub fn to_image_record(&self) -> ImageRecord {
        let mut counts = [0; RATING_BUCKETS];
        for (bucket, count) in &self.score_dictionary {
            if (1..=RATING_BUCKETS as u8).contains(bucket) {
                counts[*bucket as usize - 1] = *count;
            }
        }
        let mut record = ImageRecord::new(self.index, self.image_id, counts);
        record.semantic_tags = self.semantic_tags.clone();
        record.challenge_id = self.challenge_id;
        record.file = self.file_info();
        record
    }
}

/// 确定性的 JSON 输出
#[derive(Debug, Clone, Copy)]
pub struct JsonWriter {
    /// 缩进空格数，0 表示输出单行
    pub indent: usize,
}

impl Default for JsonWriter {
    fn default() -> Self {
        Self { indent: 1 }
    }
}

impl JsonWriter {
    pub fn new(indent: usize) -> Self {
        Self { indent }
    }

    pub fn to_vec<T: Serialize + ?Sized>(&self, value: &T) -> serde_json::Result<Vec<u8>> {
        if self.indent == 0 {
            return serde_json::to_vec(value);
        }
        let indent = vec![b' '; self.indent];
        let mut buf = vec![];
        let mut ser = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(&indent));
        value.serialize(&mut ser)?;
        Ok(buf)
    }

    /// 写入文件，失败时返回 `OutputWrite`
    pub fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let data = self.to_vec(value).map_err(|e| PrepError::output(path, io::Error::other(e)))?;
        fs::write(path, data).map_err(|e| PrepError::output(path, e))
    }
}

pub fn read_manifest(data: &[u8]) -> Result<Vec<ManifestRecord>> {
    serde_json::from_slice(data).map_err(|e| PrepError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// 将分片结果合并进评分表并生成清单
pub struct ManifestMerger<'t> {
    table: &'t mut MetadataTable,
}

impl<'t> ManifestMerger<'t> {
    pub fn new(table: &'t mut MetadataTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MetadataTable {
        self.table
    }

    /// 记录分片内图片的文件信息，返回该分片的清单
    ///
    /// `images` 只应包含已成功写入分片的图片，读取或校验失败的图片不会出现在清单中
    pub fn merge_shard(&mut self, boundary: &ShardBoundary, images: &[PreparedImage]) -> Vec<ManifestRecord> {
        let records = self.shard_records(boundary, images);
        self.apply_existing(&records);
        records
    }

    /// 生成分片清单但不修改评分表
    ///
    /// 清单落盘之后再用 `apply_existing` 提交，写入失败的分片不会在汇总清单中留下记录
    pub fn shard_records(&self, boundary: &ShardBoundary, images: &[PreparedImage]) -> Vec<ManifestRecord> {
        let mut files = BTreeMap::new();
        for image in images {
            if !self.table.contains(image.id) {
                warn!("{}: {}", image.file_name, PrepError::UnknownId(image.id));
                continue;
            }
            files.entry(image.id).or_insert(image);
        }
        self.table
            .slice_range(boundary.first_id, boundary.last_id)
            .into_iter()
            .filter_map(|row| {
                let image = files.get(&row.id)?;
                if row.has_file_info() {
                    warn!("{}: {}", image.file_name, PrepError::DuplicateId(row.id));
                    return None;
                }
                let mut record = ManifestRecord::from(row);
                record.file_hash = image.hash.clone();
                record.file_name = image.file_name.clone();
                Some(record)
            })
            .collect()
    }

    /// 将已存在的清单重新写回评分表，用于跳过已完成的分片，返回成功写回的行数
    pub fn apply_existing(&mut self, records: &[ManifestRecord]) -> usize {
        let mut applied = 0;
        for record in records {
            let Some(info) = record.file_info() else {
                warn!("清单中的 ID {} 缺少文件信息", record.image_id);
                continue;
            };
            match self.table.set_file_info(record.image_id, info.hash, info.name) {
                Ok(()) => applied += 1,
                Err(e) => warn!("{}: {}", record.file_name, e),
            }
        }
        applied
    }

    /// 所有已找到文件的行
    pub fn consolidated(&self) -> Vec<ManifestRecord> {
        self.table.matched_rows().into_iter().map(ManifestRecord::from).collect()
    }

    pub fn error_report(&self) -> String {
        error_report(&self.table.rows_missing_file_info())
    }
}

/// 生成 `Index ImageId` 两列的错误报告
pub fn error_report(rows: &[&ImageRecord]) -> String {
    const H1: &str = "Index";
    const H2: &str = "ImageId";
    let w1 = rows.iter().map(|r| r.index.to_string().len()).max().unwrap_or(0).max(H1.len());
    let w2 = rows.iter().map(|r| r.id.to_string().len()).max().unwrap_or(0).max(H2.len());

    let mut report = String::new();
    let _ = writeln!(report, "{:>w1$} {:>w2$}", H1, H2);
    for row in rows {
        let _ = writeln!(report, "{:>w1$} {:>w2$}", row.index, row.id);
    }
    report
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn table(ids: &[u64]) -> MetadataTable {
        MetadataTable::from_records(ids.iter().enumerate().map(|(i, &id)| {
            let mut counts = [0; RATING_BUCKETS];
            counts[i % RATING_BUCKETS] = id as u32;
            ImageRecord::new(i as u64 + 1, id, counts)
        }))
    }

    fn image(id: u64) -> PreparedImage {
        PreparedImage {
            id,
            path: PathBuf::from(format!("in/{}.jpg", id)),
            file_name: format!("{}.jpg", id),
            size: 10,
            hash: format!("{:064x}", id),
        }
    }

    fn boundary(index: usize, images: &[PreparedImage]) -> ShardBoundary {
        ShardBoundary {
            index,
            first_id: images[0].id,
            last_id: images[images.len() - 1].id,
            start: 0,
            end: images.len(),
            byte_total: images.iter().map(|i| i.size).sum(),
        }
    }

    #[test]
    fn test_unmatched_rows_are_reported() {
        let mut table = table(&[1, 2, 3]);
        let mut merger = ManifestMerger::new(&mut table);
        let images = [image(1), image(3)];
        let records = merger.merge_shard(&boundary(0, &images), &images);

        assert_eq!(records.iter().map(|r| r.image_id).collect::<Vec<_>>(), vec![1, 3]);
        let missing = merger.table().rows_missing_file_info();
        assert_eq!(missing.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(merger.error_report(), "Index ImageId\n    2       2\n");
    }

    #[test]
    fn test_every_row_has_hash_and_name() {
        let mut table = table(&[10, 11, 12, 13, 14]);
        let mut merger = ManifestMerger::new(&mut table);
        let first = [image(10), image(12)];
        let second = [image(13), image(14), image(99)];
        let mut all = merger.merge_shard(&boundary(0, &first), &first);
        all.extend(merger.merge_shard(&boundary(1, &second), &second));

        for record in all.iter().chain(merger.consolidated().iter()) {
            assert_eq!(record.file_hash.is_empty(), record.file_name.is_empty());
            assert!(record.file_info().is_some());
        }
        assert_eq!(merger.consolidated().len(), 4);
    }

    #[test]
    fn test_round_trip() {
        let mut table = table(&[5, 6, 7]);
        let mut merger = ManifestMerger::new(&mut table);
        let images = [image(5), image(6), image(7)];
        let records = merger.merge_shard(&boundary(0, &images), &images);

        let writer = JsonWriter::new(1);
        let data = writer.to_vec(&records).unwrap();
        let parsed = read_manifest(&data).unwrap();
        assert_eq!(parsed, records);

        let triples = |rs: &[ManifestRecord]| {
            rs.iter().map(|r| (r.image_id, r.file_hash.clone(), r.file_name.clone())).collect::<Vec<_>>()
        };
        assert_eq!(triples(&parsed), triples(&records));
        assert_eq!(parsed[1].to_image_record(), *merger.table().lookup(6).unwrap());
    }

    #[test]
    fn test_serialization_is_stable() {
        let mut record = ImageRecord::new(3, 42, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        record.semantic_tags = vec![1, 22];
        record.challenge_id = Some(1396);
        record.file = Some(FileInfo { hash: "ab".into(), name: "42.jpg".into() });
        let records = vec![ManifestRecord::from(&record)];

        let compact = String::from_utf8(JsonWriter::new(0).to_vec(&records).unwrap()).unwrap();
        assert_eq!(
            compact,
            r#"[{"Index":3,"ImageId":42,"FileHash":"ab","FileName":"42.jpg","ScoreCount":55,"#.to_owned()
                + r#""ScoreDictionary":{"1":1,"2":2,"3":3,"4":4,"5":5,"6":6,"7":7,"8":8,"9":9,"10":10},"#
                + r#""SemanticTags":[1,22],"ChallengeId":1396}]"#
        );
        let pretty = JsonWriter::new(4).to_vec(&records).unwrap();
        assert_eq!(pretty, JsonWriter::new(4).to_vec(&records).unwrap());
        assert!(String::from_utf8(pretty).unwrap().contains("\n        \"Index\": 3"));
    }

    #[test]
    fn test_shard_records_leave_table_untouched() {
        let mut table = table(&[1, 2, 3]);
        let mut merger = ManifestMerger::new(&mut table);
        let images = [image(1), image(3)];
        let records = merger.shard_records(&boundary(0, &images), &images);

        assert_eq!(records.iter().map(|r| r.image_id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(records[1].file_name, "3.jpg");
        assert!(merger.consolidated().is_empty());
        assert_eq!(merger.table().rows_missing_file_info().len(), 3);

        assert_eq!(merger.apply_existing(&records), 2);
        assert_eq!(merger.consolidated(), records);
    }

    #[test]
    fn test_apply_existing() {
        let mut source = table(&[1, 2]);
        let mut merger = ManifestMerger::new(&mut source);
        let images = [image(1), image(2)];
        let records = merger.merge_shard(&boundary(0, &images), &images);

        let mut fresh = table(&[1, 2]);
        let mut merger = ManifestMerger::new(&mut fresh);
        assert_eq!(merger.apply_existing(&records), 2);
        assert_eq!(merger.consolidated(), records);
        assert!(merger.table().rows_missing_file_info().is_empty());
    }
}
