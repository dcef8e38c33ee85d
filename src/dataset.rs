//! 数据集整理流程
//!
//! 分片与清单生成都是严格顺序执行的，只有分片前的校验与哈希会并行。

use std::collections::BTreeSet;
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use log::{debug, error, info, warn};

use crate::error::{PrepError, Result};
use crate::manifest::{JsonWriter, ManifestMerger, read_manifest};
use crate::packer::{ShardBoundary, pack};
use crate::prepare::{PreparedImage, prepare_images};
use crate::scan::{ImageFile, entry_name, list_shard_dirs, scan_images};
use crate::shard::{Action, ShardWriter, list_shard_outputs, manifest_name, read_existing_manifest};
use crate::table::MetadataTable;
use crate::utils::{ImageFilter, ImageHash, shard_name};

/// 错误报告文件名
pub const ERROR_REPORT: &str = "errors.txt";

/// 汇总清单与错误报告的输出位置
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// 汇总清单的文件名（不含后缀）
    pub dataset_name: String,
    pub json: JsonWriter,
}

impl OutputConfig {
    pub fn consolidated_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.dataset_name))
    }

    pub fn error_report_path(&self) -> PathBuf {
        self.dir.join(ERROR_REPORT)
    }
}

#[derive(Debug, Clone)]
pub struct PackJob {
    pub input: PathBuf,
    pub table: PathBuf,
    pub output: OutputConfig,
    pub threshold: NonZeroU64,
    pub prefix: String,
    pub filter: ImageFilter,
    pub hash: ImageHash,
    pub strip: bool,
    pub action: Action,
    pub archive: bool,
}

#[derive(Debug, Default)]
pub struct Summary {
    /// 本次新写入的分片
    pub shards: Vec<ShardBoundary>,
    /// 已存在而被跳过的分片数
    pub skipped: usize,
    /// 写入失败的分片数
    pub failed: usize,
    pub matched: usize,
    pub missing: usize,
}

/// 扫描、校验、分片并输出清单
///
/// 输出目录中已完成的分片不会被改写，其清单先写回评分表，剩余的图片再依次
/// 填入尚未占用的序号。移动模式下中断后重新运行时，输入目录中只剩下未完成的图片。
pub fn run_pack(job: &PackJob, pb: &ProgressBar) -> Result<Summary> {
    if !job.input.is_dir() {
        return Err(PrepError::Config(format!("输入目录不存在: {}", job.input.display())));
    }
    let mut table = MetadataTable::load(&job.table)?;
    let scan = scan_images(&job.input, &job.filter)?;
    let files = known_files(&table, scan.files);

    let out = &job.output.dir;
    fs::create_dir_all(out).map_err(|e| PrepError::output(out, e))?;

    let mut summary = Summary::default();
    let mut merger = ManifestMerger::new(&mut table);
    let occupied = resume_shards(job, &mut merger, &mut summary)?;

    // 已经记录在完成分片中的图片不再重复分片
    let files = files
        .into_iter()
        .filter(|file| !merger.table().lookup(file.id).is_ok_and(|r| r.has_file_info()))
        .collect::<Vec<_>>();

    info!("校验图片并计算哈希");
    let prepared = prepare_images(&files, job.hash, job.strip, pb);
    let images = prepared.images;

    let free = (0usize..).filter(|i| !occupied.contains(i));
    let shards = pack(images.iter().map(|i| (i.id, i.size)), job.threshold)
        .into_iter()
        .zip(free)
        .map(|(boundary, index)| ShardBoundary { index, ..boundary })
        .collect::<Vec<_>>();
    info!("共 {} 张待分片的图片，分为 {} 个新分片", images.len(), shards.len());

    pb.set_length(images.len() as u64);
    pb.set_position(0);

    for boundary in &shards {
        let name = shard_name(&job.prefix, boundary.index);
        pb.set_message(name.clone());

        match write_shard(job, &mut merger, boundary, &name, &images[boundary.range()], pb) {
            Ok(n) => info!("分片 {} 写入完成: {} 张图片, {} 字节", name, n, boundary.byte_total),
            Err(e) => {
                error!("分片 {} 写入失败: {}", name, e);
                summary.failed += 1;
            }
        }
    }

    finish_outputs(&merger, &job.output, &mut summary)?;
    summary.shards = shards;
    pb.finish_with_message("分片完成");
    Ok(summary)
}

/// 将输出目录中已完成分片的清单写回评分表，返回不可再写入的分片序号
///
/// 输出无法读取的分片同样视为已占用，它不会被覆盖
fn resume_shards(job: &PackJob, merger: &mut ManifestMerger<'_>, summary: &mut Summary) -> Result<BTreeSet<usize>> {
    let out = &job.output.dir;
    let mut occupied = BTreeSet::new();
    for (index, name) in list_shard_outputs(out, &job.prefix, job.archive)? {
        match read_existing_manifest(out, &name, job.archive) {
            Ok(Some(existing)) => {
                let applied = merger.apply_existing(&existing);
                info!("分片 {} 已存在，跳过（{} 条记录）", name, applied);
                summary.skipped += 1;
                occupied.insert(index);
            }
            // 没有清单的分片尚未完成，会被重新写入
            Ok(None) => debug!("分片 {} 未完成", name),
            Err(e) => {
                error!("分片 {} 的已有输出无法读取: {}", name, e);
                summary.failed += 1;
                occupied.insert(index);
            }
        }
    }
    Ok(occupied)
}

fn write_shard(
    job: &PackJob,
    merger: &mut ManifestMerger<'_>,
    boundary: &ShardBoundary,
    name: &str,
    images: &[PreparedImage],
    pb: &ProgressBar,
) -> Result<usize> {
    let out = &job.output.dir;
    let mut writer = if job.archive {
        ShardWriter::archive(out, name, job.strip)?
    } else {
        ShardWriter::directory(out, name, job.action, job.strip)?
    };

    let mut placed = Vec::with_capacity(images.len());
    for image in images {
        match writer.add_image(image) {
            Ok(()) => placed.push(image.clone()),
            Err(e) => warn!("{}: {}", image.path.display(), e),
        }
        pb.inc(1);
    }

    let records = merger.shard_records(boundary, &placed);
    let manifest = manifest_name(name);
    let data = job
        .output
        .json
        .to_vec(&records)
        .map_err(|e| PrepError::output(out.join(&manifest), std::io::Error::other(e)))?;
    writer.finish(Some((manifest.as_str(), data.as_slice())))?;
    // 清单落盘后才提交，写入失败的分片中的行会出现在错误报告里
    merger.apply_existing(&records);
    Ok(records.len())
}

/// 评分表中不存在的文件不参与分片
fn known_files(table: &MetadataTable, files: Vec<ImageFile>) -> Vec<ImageFile> {
    files
        .into_iter()
        .filter(|file| {
            let known = table.contains(file.id);
            if !known {
                warn!("{}: {}", file.path.display(), PrepError::UnknownId(file.id));
            }
            known
        })
        .collect()
}

fn finish_outputs(merger: &ManifestMerger<'_>, output: &OutputConfig, summary: &mut Summary) -> Result<()> {
    fs::create_dir_all(&output.dir).map_err(|e| PrepError::output(&output.dir, e))?;

    let consolidated = merger.consolidated();
    output.json.write(&output.consolidated_path(), &consolidated)?;

    let missing = merger.table().rows_missing_file_info().len();
    let path = output.error_report_path();
    fs::write(&path, merger.error_report()).map_err(|e| PrepError::output(&path, e))?;

    info!("共 {} 行找到文件，{} 行未找到，已写入 {}", consolidated.len(), missing, path.display());
    summary.matched = consolidated.len();
    summary.missing = missing;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ManifestJob {
    /// 已分片的目录，每个子目录是一个分片
    pub root: PathBuf,
    pub table: PathBuf,
    pub output: OutputConfig,
    pub filter: ImageFilter,
    pub hash: ImageHash,
}

/// 为已经分好的目录生成清单
pub fn run_manifest(job: &ManifestJob, pb: &ProgressBar) -> Result<Summary> {
    let dirs = list_shard_dirs(&job.root)?;
    let mut table = MetadataTable::load(&job.table)?;
    let mut merger = ManifestMerger::new(&mut table);
    let mut summary = Summary::default();
    info!("共 {} 个分片目录", dirs.len());

    for (index, dir) in dirs.iter().enumerate() {
        let name = entry_name(dir);
        info!("处理分片目录: {}", name);
        let manifest = dir.join(manifest_name(&name));
        if manifest.is_file() {
            match fs::read(&manifest).map_err(PrepError::from).and_then(|data| read_manifest(&data)) {
                Ok(existing) => {
                    let applied = merger.apply_existing(&existing);
                    info!("分片 {} 已有清单，跳过（{} 条记录）", name, applied);
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!("分片 {} 的已有清单无法读取: {}", name, e);
                    summary.failed += 1;
                }
            }
            continue;
        }

        let files = match scan_images(dir, &job.filter) {
            Ok(scan) => known_files(merger.table(), scan.files),
            Err(e) => {
                error!("{}: {}", dir.display(), e);
                summary.failed += 1;
                continue;
            }
        };
        let images = prepare_images(&files, job.hash, false, pb).images;
        let boundary = spanning(index, &images);
        let records = match &boundary {
            Some(boundary) => merger.shard_records(boundary, &images),
            None => vec![],
        };
        if let Err(e) = job.output.json.write(&manifest, &records) {
            error!("分片 {} 写入失败: {}", name, e);
            summary.failed += 1;
            continue;
        }
        merger.apply_existing(&records);
        summary.shards.extend(boundary);
    }

    finish_outputs(&merger, &job.output, &mut summary)?;
    pb.finish_with_message("清单生成完成");
    Ok(summary)
}

/// 由已有的一组图片构造分片边界
fn spanning(index: usize, images: &[PreparedImage]) -> Option<ShardBoundary> {
    let (first, last) = (images.first()?, images.last()?);
    Some(ShardBoundary {
        index,
        first_id: first.id,
        last_id: last.id,
        start: 0,
        end: images.len(),
        byte_total: images.iter().map(|i| i.size).sum(),
    })
}

/// 将每个分片目录打包为 `<out>/<目录名>.zip`，已存在的归档会被跳过
pub fn run_zip(root: &Path, out: &Path, pb: &ProgressBar) -> Result<Summary> {
    let dirs = list_shard_dirs(root)?;
    fs::create_dir_all(out).map_err(|e| PrepError::output(out, e))?;
    let mut summary = Summary::default();
    pb.set_length(dirs.len() as u64);

    for dir in &dirs {
        let name = entry_name(dir);
        pb.set_message(name.clone());
        if out.join(format!("{}.zip", name)).exists() {
            info!("归档 {}.zip 已存在，跳过", name);
            summary.skipped += 1;
            pb.inc(1);
            continue;
        }
        if let Err(e) = zip_dir(dir, out, &name) {
            error!("打包 {} 失败: {}", dir.display(), e);
            summary.failed += 1;
        }
        pb.inc(1);
    }
    pb.finish_with_message("打包完成");
    Ok(summary)
}

fn zip_dir(dir: &Path, out: &Path, name: &str) -> Result<()> {
    let mut entries = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    entries.sort();

    let mut writer = ShardWriter::archive(out, name, false)?;
    for path in &entries {
        writer.add_file(path, &entry_name(path))?;
    }
    writer.finish(None)?;
    info!("{} 打包完成，共 {} 个文件", name, entries.len());
    Ok(())
}
