//! AVA 评分表
//!
//! 每行格式为 `序号 图片ID 评分1 ... 评分10 [语义标签1 语义标签2 挑战ID]`，
//! 字段之间以空白或逗号分隔。

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use log::{info, warn};

use crate::error::{PrepError, Result};

/// 评分档位数量
pub const RATING_BUCKETS: usize = 10;

/// 图片文件信息，哈希与文件名总是同时存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub hash: String,
    pub name: String,
}

/// 评分表中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// 原始序号
    pub index: u64,
    /// 图片 ID
    pub id: u64,
    /// 1~10 分的评分人数
    pub rating_counts: [u32; RATING_BUCKETS],
    /// 评分总人数
    pub score_count: u32,
    pub semantic_tags: Vec<u32>,
    pub challenge_id: Option<u32>,
    /// 找到对应文件后填入
    pub file: Option<FileInfo>,
}

impl ImageRecord {
    pub fn new(index: u64, id: u64, rating_counts: [u32; RATING_BUCKETS]) -> Self {
        Self {
            index,
            id,
            rating_counts,
            score_count: rating_counts.iter().fold(0u32, |acc, &n| acc.saturating_add(n)),
            semantic_tags: vec![],
            challenge_id: None,
            file: None,
        }
    }

    /// 以 `档位 -> 人数` 的形式返回评分
    pub fn score_dictionary(&self) -> BTreeMap<u8, u32> {
        (1..=RATING_BUCKETS as u8).zip(self.rating_counts).collect()
    }

    pub fn has_file_info(&self) -> bool {
        self.file.is_some()
    }

    fn parse(line: &str, lineno: usize) -> Result<Option<Self>> {
        let fields = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if fields.is_empty() {
            return Ok(None);
        }
        if fields.len() < 2 + RATING_BUCKETS {
            return Err(PrepError::Table {
                line: lineno,
                reason: format!("字段数量不足: {}", fields.len()),
            });
        }

        let err = |reason: String| PrepError::Table { line: lineno, reason };
        let id_field = |s: &str| s.parse::<u64>().map_err(|e| err(format!("无法解析 {:?}: {}", s, e)));
        let count_field = |s: &str| s.parse::<u32>().map_err(|e| err(format!("无法解析 {:?}: {}", s, e)));

        let index = id_field(fields[0])?;
        let id = id_field(fields[1])?;
        let mut counts = [0; RATING_BUCKETS];
        for (slot, s) in counts.iter_mut().zip(&fields[2..2 + RATING_BUCKETS]) {
            *slot = count_field(*s)?;
        }
        if counts.iter().try_fold(0u32, |acc, &n| acc.checked_add(n)).is_none() {
            return Err(err("评分总人数溢出".to_owned()));
        }

        let mut record = Self::new(index, id, counts);
        let rest = &fields[2 + RATING_BUCKETS..];
        match rest.len() {
            0 => {}
            // AVA.txt 的最后一列是挑战 ID，之前的都是语义标签
            n => {
                record.semantic_tags = rest[..n - 1].iter().map(|s| count_field(*s)).collect::<Result<_>>()?;
                record.challenge_id = Some(count_field(rest[n - 1])?);
            }
        }
        Ok(Some(record))
    }
}

/// 以图片 ID 为键的评分表
///
/// 键集合在加载时就已经确定，之后只会填入文件信息，不会增删行
#[derive(Debug, Default)]
pub struct MetadataTable {
    rows: BTreeMap<u64, ImageRecord>,
}

impl MetadataTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PrepError::Config(format!("评分表不存在: {}", path.display())));
        }
        info!("加载评分表: {}", path.display());
        let table = Self::parse(File::open(path)?)?;
        info!("评分表共 {} 行", table.len());
        Ok(table)
    }

    pub fn parse(reader: impl Read) -> Result<Self> {
        let mut rows = BTreeMap::new();
        for (i, line) in BufReader::new(reader).lines().enumerate() {
            let Some(record) = ImageRecord::parse(&line?, i + 1)? else {
                continue;
            };
            match rows.entry(record.id) {
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
                Entry::Occupied(_) => warn!("评分表第 {} 行 ID {} 重复，已忽略", i + 1, record.id),
            }
        }
        Ok(Self { rows })
    }

    pub fn from_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let mut rows = BTreeMap::new();
        for record in records {
            rows.entry(record.id).or_insert(record);
        }
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn lookup(&self, id: u64) -> Result<&ImageRecord> {
        self.rows.get(&id).ok_or(PrepError::UnknownId(id))
    }

    /// 填入文件哈希与文件名，每一行只能填入一次
    pub fn set_file_info(&mut self, id: u64, hash: impl Into<String>, name: impl Into<String>) -> Result<()> {
        let record = self.rows.get_mut(&id).ok_or(PrepError::UnknownId(id))?;
        if record.file.is_some() {
            return Err(PrepError::DuplicateId(id));
        }
        record.file = Some(FileInfo { hash: hash.into(), name: name.into() });
        Ok(())
    }

    /// 返回 `[first, last]` 范围内的行，按 ID 升序
    pub fn slice_range(&self, first: u64, last: u64) -> Vec<&ImageRecord> {
        if first > last {
            return vec![];
        }
        self.rows.range(first..=last).map(|(_, r)| r).collect()
    }

    pub fn matched_rows(&self) -> Vec<&ImageRecord> {
        self.rows.values().filter(|r| r.has_file_info()).collect()
    }

    pub fn rows_missing_file_info(&self) -> Vec<&ImageRecord> {
        self.rows.values().filter(|r| !r.has_file_info()).collect()
    }
}
