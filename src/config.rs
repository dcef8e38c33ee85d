use std::num::{NonZeroU64, NonZeroUsize};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::*;
use crate::dataset::OutputConfig;
use crate::manifest::JsonWriter;
use crate::utils::{ImageFilter, ImageHash};

#[derive(Parser, Debug, Clone)]
pub struct ScanOptions {
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,png")]
    pub suffix: String,
    /// 计算文件哈希使用的算法，同一个数据集必须始终使用同一种
    #[arg(short = 'H', long, value_enum, default_value_t = ImageHash::Sha256)]
    pub hash: ImageHash,
}

impl ScanOptions {
    pub fn filter(&self) -> anyhow::Result<ImageFilter> {
        Ok(ImageFilter::new(&self.suffix)?)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ShardOptions {
    /// 单个分片的字节数阈值，累计大小达到该值时开始新的分片
    #[arg(short, long, value_name = "BYTES", default_value = "500000000", value_parser = parse_threshold)]
    pub threshold: NonZeroU64,
    /// 分片名前缀，分片名为前缀加三位序号
    #[arg(short, long, default_value = "dataset-ava-")]
    pub prefix: String,
}

#[derive(Parser, Debug, Clone)]
pub struct OutputOptions {
    /// 输出目录
    #[arg(short, long)]
    pub output: PathBuf,
    /// JSON 缩进空格数，0 表示输出单行
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub indent: usize,
    /// 汇总清单的文件名（不含后缀）
    #[arg(long, value_name = "NAME", default_value = "AVA")]
    pub dataset_name: String,
}

impl OutputOptions {
    pub fn json(&self) -> JsonWriter {
        JsonWriter::new(self.indent)
    }

    pub fn config(&self) -> OutputConfig {
        OutputConfig { dir: self.output.clone(), dataset_name: self.dataset_name.clone(), json: self.json() }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "avaprep", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 校验图片、按大小分片并生成清单
    Pack(PackCommand),
    /// 为已经分好的目录生成清单
    Manifest(ManifestCommand),
    /// 将分片目录打包为 zip 归档
    Zip(ZipCommand),
    /// 为归档或目录中的图片计算嵌入向量
    Embed(EmbedCommand),
}

fn parse_threshold(s: &str) -> Result<NonZeroU64, String> {
    let value = s.replace('_', "").parse::<u64>().map_err(|e| format!("无效的阈值 {}: {}", s, e))?;
    NonZeroU64::new(value).ok_or_else(|| "阈值必须大于 0".to_owned())
}

pub(crate) fn parse_batch_size(s: &str) -> Result<NonZeroUsize, String> {
    let value = s.parse::<usize>().map_err(|e| format!("无效的批次大小 {}: {}", s, e))?;
    NonZeroUsize::new(value).ok_or_else(|| "批次大小必须大于 0".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert_eq!(parse_threshold("1_000").unwrap().get(), 1000);
        assert!(parse_threshold("0").is_err());
        assert!(parse_threshold("-5").is_err());
    }

    #[test]
    fn test_defaults() {
        let opts = Opts::try_parse_from(["avaprep", "pack", "in", "--table", "AVA.txt", "-o", "out"]).unwrap();
        let SubCommand::Pack(cmd) = opts.subcmd else {
            panic!("expected pack");
        };
        assert_eq!(cmd.shard.threshold.get(), 500_000_000);
        assert_eq!(cmd.shard.prefix, "dataset-ava-");
        assert_eq!(cmd.scan.suffix, "jpg,png");
        assert_eq!(cmd.scan.hash, ImageHash::Sha256);
        assert_eq!(cmd.output.indent, 1);
        assert_eq!(cmd.output.dataset_name, "AVA");
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let result = Opts::try_parse_from(["avaprep", "pack", "in", "--table", "t", "-o", "o", "-t", "0"]);
        assert!(result.is_err());
    }
}
