//! 按累计字节数将有序的图片序列切分为连续的分片
//!
//! 每读入一个文件就把它的大小累加到当前分片，累计值第一次达到阈值时立刻切分，
//! 触发切分的文件属于它所填满的分片。单个文件不会被拆开，所以超过阈值的文件会独占一个分片。

use std::num::NonZeroU64;

/// 一个分片的边界
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardBoundary {
    /// 分片序号，从 0 开始连续递增
    pub index: usize,
    /// 分片内第一个文件的 ID
    pub first_id: u64,
    /// 分片内最后一个文件的 ID
    pub last_id: u64,
    /// 分片在输入序列中的起始位置
    pub start: usize,
    /// 分片在输入序列中的结束位置（不含）
    pub end: usize,
    /// 分片内文件大小之和，总是大于 0
    pub byte_total: u64,
}

impl ShardBoundary {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// 流式分片器，所有状态都保存在实例内
#[derive(Debug, Clone)]
pub struct ShardPacker {
    threshold: u64,
    next_index: usize,
    position: usize,
    pending: Option<Pending>,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    first_id: u64,
    last_id: u64,
    start: usize,
    bytes: u64,
}

impl ShardPacker {
    pub fn new(threshold: NonZeroU64) -> Self {
        Self { threshold: threshold.get(), next_index: 0, position: 0, pending: None }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// 加入一个文件，若该文件使当前分片达到阈值则返回切分出的分片
    pub fn push(&mut self, id: u64, size: u64) -> Option<ShardBoundary> {
        let position = self.position;
        self.position += 1;

        let pending = self.pending.get_or_insert(Pending {
            first_id: id,
            last_id: id,
            start: position,
            bytes: 0,
        });
        pending.last_id = id;
        pending.bytes = pending.bytes.saturating_add(size);

        if pending.bytes >= self.threshold { self.cut() } else { None }
    }

    /// 输入结束，剩余的文件组成最后一个分片
    ///
    /// 剩余文件的大小之和为 0 时不产生分片，每个分片的 `byte_total` 总是大于 0
    pub fn finish(mut self) -> Option<ShardBoundary> {
        self.cut().filter(|boundary| boundary.byte_total > 0)
    }

    fn cut(&mut self) -> Option<ShardBoundary> {
        let pending = self.pending.take()?;
        let boundary = ShardBoundary {
            index: self.next_index,
            first_id: pending.first_id,
            last_id: pending.last_id,
            start: pending.start,
            end: self.position,
            byte_total: pending.bytes,
        };
        self.next_index += 1;
        Some(boundary)
    }
}

/// 对 `(id, 文件大小)` 序列进行分片
///
/// 调用方需要预先按 ID 升序排列输入
pub fn pack<I>(files: I, threshold: NonZeroU64) -> Vec<ShardBoundary>
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let mut packer = ShardPacker::new(threshold);
    let mut shards = files
        .into_iter()
        .filter_map(|(id, size)| packer.push(id, size))
        .collect::<Vec<_>>();
    shards.extend(packer.finish());
    shards
}
