use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use log::info;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, OutputOptions, ScanOptions};
use crate::dataset::{ManifestJob, run_manifest};
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct ManifestCommand {
    /// 已分片的目录，每个子目录是一个分片，清单写入各自目录
    pub root: PathBuf,
    /// AVA 评分表，即 AVA.txt
    #[arg(long)]
    pub table: PathBuf,
    #[command(flatten)]
    pub scan: ScanOptions,
    #[command(flatten)]
    pub output: OutputOptions,
}

impl SubCommandExtend for ManifestCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let job = ManifestJob {
            root: self.root.clone(),
            table: self.table.clone(),
            output: self.output.config(),
            filter: self.scan.filter()?,
            hash: self.scan.hash,
        };

        let pb = ProgressBar::no_length().with_style(pb_style());
        let summary = block_in_place(|| run_manifest(&job, &pb))?;

        info!("{} 行已匹配，{} 行缺失", summary.matched, summary.missing);
        if summary.failed > 0 {
            bail!("{} 个分片处理失败", summary.failed);
        }
        Ok(())
    }
}
