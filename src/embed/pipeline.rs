use std::fmt::Write as _;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use indicatif::ProgressBar;
use log::{error, info, warn};
use rayon::prelude::*;
use tokio::task::spawn_blocking;

use super::{EmbeddingRecord, ImageEmbedder, LoadedUnit, Member, discover_units, task_load};
use crate::codec::decode_rgb;
use crate::error::{PrepError, Result};
use crate::manifest::JsonWriter;
use crate::utils::{ImageFilter, ImageHash};

/// 单张图片的处理结果
#[derive(Debug)]
pub enum ItemOutcome {
    Embedded(EmbeddingRecord),
    Failed { member: String, error: PrepError },
}

/// 已解码、等待送入模型的图片
struct Decoded {
    /// 在单元中的位置
    slot: usize,
    hash: String,
    image: RgbImage,
}

/// 对单元中的所有图片计算嵌入向量，结果与 `unit.members` 一一对应
///
/// 解码失败的图片在组批之前就被剔除，每个批次都带着图片在单元中的位置，
/// 因此批次大小不会影响输出的内容与顺序
pub fn embed_unit(
    unit: &LoadedUnit,
    embedder: &dyn ImageEmbedder,
    batch_size: NonZeroUsize,
    hash: ImageHash,
) -> Vec<ItemOutcome> {
    let batch_size = batch_size.get();
    let mut outcomes: Vec<Option<ItemOutcome>> = Vec::with_capacity(unit.members.len());
    outcomes.resize_with(unit.members.len(), || None);

    let mut pending: Vec<Decoded> = Vec::with_capacity(batch_size * 2);
    for (window, members) in unit.members.chunks(batch_size).enumerate() {
        let decoded = members
            .par_iter()
            .enumerate()
            .map(|(i, member)| {
                let slot = window * batch_size + i;
                match decode_rgb(&member.data) {
                    Ok(image) => Ok(Decoded { slot, hash: hash.hash_bytes(&member.data), image }),
                    Err(error) => Err((slot, error)),
                }
            })
            .collect::<Vec<_>>();

        for item in decoded {
            match item {
                Ok(d) => pending.push(d),
                Err((slot, error)) => {
                    outcomes[slot] = Some(failed(&unit.members[slot], error));
                }
            }
        }
        while pending.len() >= batch_size {
            let batch = pending.drain(..batch_size).collect();
            run_batch(unit, embedder, batch, &mut outcomes);
        }
    }
    if !pending.is_empty() {
        run_batch(unit, embedder, pending, &mut outcomes);
    }

    outcomes.into_iter().flatten().collect()
}

fn failed(member: &Member, error: PrepError) -> ItemOutcome {
    warn!("{}: {}", member.path, error);
    ItemOutcome::Failed { member: member.path.clone(), error }
}

fn run_batch(unit: &LoadedUnit, embedder: &dyn ImageEmbedder, batch: Vec<Decoded>, outcomes: &mut [Option<ItemOutcome>]) {
    let (ids, images): (Vec<_>, Vec<_>) = batch.into_iter().map(|d| ((d.slot, d.hash), d.image)).unzip();

    let vectors = match embedder.embed(&images) {
        Ok(vectors) if vectors.len() == images.len() => vectors,
        Ok(vectors) => {
            let reason = format!("模型返回了 {} 个向量，输入为 {} 张图片", vectors.len(), images.len());
            return fail_batch(unit, &ids, &reason, outcomes);
        }
        Err(PrepError::ModelInvocation(reason)) => return fail_batch(unit, &ids, &reason, outcomes),
        Err(e) => return fail_batch(unit, &ids, &e.to_string(), outcomes),
    };

    for ((slot, hash), vector) in ids.into_iter().zip(vectors) {
        let member = &unit.members[slot];
        outcomes[slot] = Some(ItemOutcome::Embedded(EmbeddingRecord {
            file_archive: unit.archive.clone(),
            file_name: member.file_name().to_owned(),
            file_path: Some(member.path.clone()),
            file_hash: hash,
            model_id: embedder.model_id().to_owned(),
            vector,
            tag: member.tag().map(str::to_owned),
        }));
    }
}

/// 整个批次都记为失败，不做重试
fn fail_batch(unit: &LoadedUnit, ids: &[(usize, String)], reason: &str, outcomes: &mut [Option<ItemOutcome>]) {
    for (slot, _) in ids {
        outcomes[*slot] = Some(failed(&unit.members[*slot], PrepError::ModelInvocation(reason.to_owned())));
    }
}

/// 一个单元的输出
#[derive(Debug, Default)]
pub struct EmbedReport {
    pub records: Vec<EmbeddingRecord>,
    pub errors: Vec<(String, PrepError)>,
}

impl From<Vec<ItemOutcome>> for EmbedReport {
    fn from(outcomes: Vec<ItemOutcome>) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Embedded(record) => report.records.push(record),
                ItemOutcome::Failed { member, error } => report.errors.push((member, error)),
            }
        }
        report
    }
}

impl EmbedReport {
    /// 每行一个 `<成员>: <错误>`
    pub fn error_lines(&self) -> String {
        let mut lines = String::new();
        for (member, error) in &self.errors {
            let _ = writeln!(lines, "{}: {}", member, error);
        }
        lines
    }
}

pub fn document_path(out: &Path, unit: &str) -> PathBuf {
    out.join(format!("{}.json", unit))
}

pub fn error_path(out: &Path, unit: &str) -> PathBuf {
    out.join(format!("{}-errors.txt", unit))
}

/// 写入单元的输出，错误列表先于文档写入，文档存在即说明单元已完成
pub fn write_report(out: &Path, unit: &str, report: &EmbedReport, json: &JsonWriter) -> Result<()> {
    if !report.errors.is_empty() {
        let path = error_path(out, unit);
        fs::write(&path, report.error_lines()).map_err(|e| PrepError::output(&path, e))?;
    }
    let path = document_path(out, unit);
    let tmp = out.join(format!("{}.json.tmp", unit));
    json.write(&tmp, &report.records)?;
    fs::rename(&tmp, &path).map_err(|e| PrepError::output(&path, e))
}

#[derive(Debug, Clone)]
pub struct EmbedJob {
    /// 归档文件，或包含归档与图片目录的目录
    pub input: PathBuf,
    pub output: PathBuf,
    pub json: JsonWriter,
    pub filter: ImageFilter,
    pub hash: ImageHash,
    pub batch_size: NonZeroUsize,
}

#[derive(Debug, Default)]
pub struct EmbedSummary {
    pub units: usize,
    /// 已有输出而被跳过的单元
    pub skipped: usize,
    /// 读取或写入失败的单元
    pub failed: usize,
    pub records: usize,
    pub errors: usize,
}

/// 对所有单元计算嵌入向量
///
/// 加载任务与计算交替进行：计算第 N 个单元时，第 N+1 个单元已经在读入内存
pub async fn run_embed(job: &EmbedJob, embedder: Arc<dyn ImageEmbedder>, pb: &ProgressBar) -> Result<EmbedSummary> {
    let units = discover_units(&job.input, &job.filter)?;
    fs::create_dir_all(&job.output).map_err(|e| PrepError::output(&job.output, e))?;

    let mut summary = EmbedSummary { units: units.len(), ..Default::default() };
    let units = units
        .into_iter()
        .filter(|unit| {
            let done = document_path(&job.output, &unit.name()).is_file();
            if done {
                info!("{} 已有输出，跳过", unit.name());
            }
            !done
        })
        .collect::<Vec<_>>();
    summary.skipped = summary.units - units.len();
    pb.set_length(summary.units as u64);
    pb.set_position(summary.skipped as u64);

    let (loader, mut rx) = task_load(units, job.filter.clone());
    while let Some(loaded) = rx.recv().await {
        let unit = match loaded {
            Ok(unit) => unit,
            Err(e) => {
                error!("{}", e);
                summary.failed += 1;
                pb.inc(1);
                continue;
            }
        };
        pb.set_message(unit.name.clone());

        let (embedder, batch_size, hash) = (embedder.clone(), job.batch_size, job.hash);
        let (name, report) = spawn_blocking(move || {
            let outcomes = embed_unit(&unit, &*embedder, batch_size, hash);
            (unit.name, EmbedReport::from(outcomes))
        })
        .await
        .map_err(std::io::Error::other)?;

        match write_report(&job.output, &name, &report, &job.json) {
            Ok(()) => info!("{} 完成: {} 条记录, {} 个错误", name, report.records.len(), report.errors.len()),
            Err(e) => {
                error!("{} 写入失败: {}", name, e);
                summary.failed += 1;
            }
        }
        summary.records += report.records.len();
        summary.errors += report.errors.len();
        pb.inc(1);
    }
    loader.await.map_err(std::io::Error::other)?;

    pb.finish_with_message("嵌入计算完成");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::*;
    use tempfile::TempDir;

    use super::*;
    use crate::codec::tests::png_bytes;
    use crate::embed::{ThumbnailEmbedder, read_embeddings};

    /// 以第一个像素作为向量，并记录每次调用的批次大小
    #[derive(Default)]
    struct MockEmbedder {
        calls: Mutex<Vec<usize>>,
        fail_on_call: Option<usize>,
        drop_one: bool,
    }

    impl ImageEmbedder for MockEmbedder {
        fn model_id(&self) -> &str {
            "mock"
        }

        fn embed(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(images.len());
            if self.fail_on_call == Some(calls.len()) {
                return Err(PrepError::ModelInvocation("out of memory".into()));
            }
            let mut vectors: Vec<Vec<f32>> =
                images.iter().map(|img| img.get_pixel(0, 0).0.iter().map(|&c| c as f32).collect()).collect();
            if self.drop_one {
                vectors.pop();
            }
            Ok(vectors)
        }
    }

    fn unit(members: Vec<(&str, Vec<u8>)>) -> LoadedUnit {
        LoadedUnit {
            name: "s".into(),
            archive: Some("s.zip".into()),
            members: members.into_iter().map(|(path, data)| Member { path: path.into(), data }).collect(),
        }
    }

    fn four_with_corrupt_third() -> LoadedUnit {
        unit(vec![
            ("0.png", png_bytes(10, 4)),
            ("1.png", png_bytes(11, 4)),
            ("2.png", b"corrupt".to_vec()),
            ("3.png", png_bytes(13, 4)),
        ])
    }

    #[test]
    fn test_batch_alignment() {
        let embedder = MockEmbedder::default();
        let unit = four_with_corrupt_third();
        let report =
            EmbedReport::from(embed_unit(&unit, &embedder, NonZeroUsize::new(4).unwrap(), ImageHash::Sha256));

        assert_eq!(report.records.len(), 3);
        let names = report.records.iter().map(|r| r.file_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["0.png", "1.png", "3.png"]);
        for (record, seed) in report.records.iter().zip([10.0, 11.0, 13.0]) {
            assert_eq!(record.vector[0], seed);
        }
        assert_eq!(report.records[2].file_hash, ImageHash::Sha256.hash_bytes(&unit.members[3].data));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "2.png");
        assert!(matches!(report.errors[0].1, PrepError::Decode(_)));
        assert_eq!(*embedder.calls.lock().unwrap(), vec![3]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(64)]
    fn test_batch_size_invariance(#[case] batch: usize) {
        let embedder = ThumbnailEmbedder::new(2);
        let unit = four_with_corrupt_third();
        let expected = EmbedReport::from(embed_unit(&unit, &embedder, NonZeroUsize::MIN, ImageHash::Sha256));
        let report =
            EmbedReport::from(embed_unit(&unit, &embedder, NonZeroUsize::new(batch).unwrap(), ImageHash::Sha256));
        assert_eq!(report.records, expected.records);
        assert_eq!(report.error_lines(), expected.error_lines());
    }

    #[test]
    fn test_full_batches_are_flushed() {
        let embedder = MockEmbedder::default();
        let unit = unit((0..5).map(|i| ("x.png", png_bytes(i, 2))).collect());
        embed_unit(&unit, &embedder, NonZeroUsize::new(2).unwrap(), ImageHash::Sha256);
        assert_eq!(*embedder.calls.lock().unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn test_model_failure_is_attributed_to_batch() {
        let embedder = MockEmbedder { fail_on_call: Some(2), ..Default::default() };
        let unit = unit((0..5).map(|i| ("tag/x.png", png_bytes(i, 2))).collect());
        let report =
            EmbedReport::from(embed_unit(&unit, &embedder, NonZeroUsize::new(2).unwrap(), ImageHash::Sha256));

        assert_eq!(report.records.len(), 3);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|(_, e)| matches!(e, PrepError::ModelInvocation(r) if r == "out of memory")));
        assert_eq!(report.records[0].tag.as_deref(), Some("tag"));
        assert_eq!(report.records[0].file_archive.as_deref(), Some("s.zip"));
    }

    #[test]
    fn test_length_mismatch_fails_batch() {
        let embedder = MockEmbedder { drop_one: true, ..Default::default() };
        let unit = unit(vec![("1.png", png_bytes(1, 2)), ("2.png", png_bytes(2, 2))]);
        let report =
            EmbedReport::from(embed_unit(&unit, &embedder, NonZeroUsize::new(8).unwrap(), ImageHash::Sha256));
        assert!(report.records.is_empty());
        assert_eq!(report.errors.len(), 2);
        assert!(report.error_lines().starts_with("1.png: "));
    }

    #[test]
    fn test_write_report() {
        let dir = TempDir::new().unwrap();
        let embedder = MockEmbedder::default();
        let report = EmbedReport::from(embed_unit(
            &four_with_corrupt_third(),
            &embedder,
            NonZeroUsize::new(2).unwrap(),
            ImageHash::Sha256,
        ));
        write_report(dir.path(), "s", &report, &JsonWriter::default()).unwrap();

        let records = read_embeddings(&fs::read(document_path(dir.path(), "s")).unwrap()).unwrap();
        assert_eq!(records, report.records);
        let errors = fs::read_to_string(error_path(dir.path(), "s")).unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.starts_with("2.png: "));
        assert!(!dir.path().join("s.json.tmp").exists());
    }
}
