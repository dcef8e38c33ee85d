use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, ScanOptions, parse_batch_size};
use crate::embed::{EmbedJob, load_embedder, run_embed};
use crate::manifest::JsonWriter;
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct EmbedCommand {
    /// zip/tar 归档，或包含归档与图片目录的目录
    pub input: PathBuf,
    /// 输出目录，每个归档或目录对应一个 JSON 文档
    #[arg(short, long)]
    pub output: PathBuf,
    #[command(flatten)]
    pub scan: ScanOptions,
    /// 嵌入模型
    #[arg(short, long, default_value = "thumbnail-16")]
    pub model: String,
    /// 每次送入模型的图片数量，只影响速度，不影响结果
    #[arg(short, long, value_name = "SIZE", default_value = "32", value_parser = parse_batch_size)]
    pub batch_size: NonZeroUsize,
    /// JSON 缩进空格数，0 表示输出单行
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub indent: usize,
}

impl SubCommandExtend for EmbedCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let embedder = load_embedder(&self.model)?;
        let job = EmbedJob {
            input: self.input.clone(),
            output: self.output.clone(),
            json: JsonWriter::new(self.indent),
            filter: self.scan.filter()?,
            hash: self.scan.hash,
            batch_size: self.batch_size,
        };

        let pb = ProgressBar::no_length().with_style(pb_style());
        let summary = run_embed(&job, embedder, &pb).await?;

        info!(
            "共 {} 个单元，跳过 {} 个，{} 条记录，{} 张图片失败",
            summary.units, summary.skipped, summary.records, summary.errors
        );
        if summary.failed > 0 {
            bail!("{} 个单元处理失败", summary.failed);
        }
        Ok(())
    }
}
