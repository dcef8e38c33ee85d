use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use log::{info, warn};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, OutputOptions, ScanOptions, ShardOptions};
use crate::dataset::{PackJob, run_pack};
use crate::shard::Action;
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct PackCommand {
    /// 原始图片所在目录，文件名必须为数字 ID
    pub input: PathBuf,
    /// AVA 评分表，即 AVA.txt
    #[arg(long)]
    pub table: PathBuf,
    #[command(flatten)]
    pub scan: ScanOptions,
    #[command(flatten)]
    pub shard: ShardOptions,
    #[command(flatten)]
    pub output: OutputOptions,
    /// 图片放入分片目录的方式，写为归档时总是读取原文件
    #[arg(short, long, value_enum, default_value_t = Action::Copy)]
    pub action: Action,
    /// 去除 EXIF 等元数据后再写入，哈希基于处理后的数据计算
    #[arg(long)]
    pub strip_metadata: bool,
    /// 将每个分片直接写为 zip 归档
    #[arg(long)]
    pub archive: bool,
}

impl SubCommandExtend for PackCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        if self.archive && self.action == Action::Move {
            warn!("归档模式下不会移动原文件");
        }
        let job = PackJob {
            input: self.input.clone(),
            table: self.table.clone(),
            output: self.output.config(),
            threshold: self.shard.threshold,
            prefix: self.shard.prefix.clone(),
            filter: self.scan.filter()?,
            hash: self.scan.hash,
            strip: self.strip_metadata,
            action: self.action,
            archive: self.archive,
        };

        let pb = ProgressBar::no_length().with_style(pb_style());
        let summary = block_in_place(|| run_pack(&job, &pb))?;

        info!(
            "新写入 {} 个分片，跳过 {} 个，{} 行已匹配，{} 行缺失",
            summary.shards.len(),
            summary.skipped,
            summary.matched,
            summary.missing
        );
        if summary.failed > 0 {
            bail!("{} 个分片写入失败", summary.failed);
        }
        Ok(())
    }
}
