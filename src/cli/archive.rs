use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::dataset::run_zip;
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct ZipCommand {
    /// 已分片的目录，每个子目录打包为一个 zip
    pub root: PathBuf,
    /// zip 输出目录
    #[arg(short, long)]
    pub output: PathBuf,
}

impl SubCommandExtend for ZipCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let pb = ProgressBar::no_length().with_style(pb_style());
        let summary = block_in_place(|| run_zip(&self.root, &self.output, &pb))?;
        if summary.failed > 0 {
            bail!("{} 个目录打包失败", summary.failed);
        }
        Ok(())
    }
}
