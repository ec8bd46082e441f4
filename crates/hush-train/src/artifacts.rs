//! 运行产物输出.
//!
//! 输出目录布局:
//!
//! ```text
//! <out>/perturbation.bin          噪声仓库
//! <out>/run_summary.json          配置、结果与每轮记录
//! <out>/first_noise.wav           样本 0 的噪声掩码
//! <out>/sample_clean/clean_<i>.wav
//! <out>/sample_noise/noise_<i>.wav
//! <out>/sample_noise/profile_<i>.json
//! ```
//!
//! 写出只读取内存中的数据, 失败不会影响噪声仓库本身.

use std::fs;
use std::path::{Path, PathBuf};

use hush_attack::SegmentPlan;
use hush_core::{HushError, HushResult, Placement, SampleId, write_wav_file};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::dataset::AudioDataset;
use crate::noise_store::{NoiseStore, StorageMode};
use crate::trainer::{RoundReport, RunOutcome};

pub const NOISE_FILE: &str = "perturbation.bin";
pub const SUMMARY_FILE: &str = "run_summary.json";
pub const FIRST_NOISE_FILE: &str = "first_noise.wav";
pub const CLEAN_DIR: &str = "sample_clean";
pub const NOISE_DIR: &str = "sample_noise";

/// `run_summary.json` 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub config: GeneratorConfig,
    pub outcome: RunOutcome,
    pub history: Vec<RoundReport>,
    pub samples: usize,
    pub noise_version: u64,
    pub max_noise: f32,
    pub noise_file: String,
}

impl RunSummary {
    pub fn new(
        config: &GeneratorConfig,
        outcome: &RunOutcome,
        history: &[RoundReport],
        store: &NoiseStore,
    ) -> Self {
        Self {
            config: config.clone(),
            outcome: outcome.clone(),
            history: history.to_vec(),
            samples: store.len(),
            noise_version: store.version(),
            max_noise: store.max_abs(),
            noise_file: NOISE_FILE.to_string(),
        }
    }

    pub fn write(&self, path: &Path) -> HushResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| HushError::InvalidData(format!("运行摘要序列化失败: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    pub fn read(path: &Path) -> HushResult<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| HushError::InvalidData(format!("运行摘要解析失败: {e}")))
    }
}

/// 单个分段的噪声概况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentProfile {
    pub start: usize,
    pub end: usize,
    pub mean_amplitude: f32,
    pub epsilon: f32,
    pub step_size: f32,
    /// 该段噪声实际达到的最大绝对值
    pub max_abs_noise: f32,
}

/// `profile_<i>.json` 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseProfile {
    pub sample_id: SampleId,
    pub label: String,
    pub placement: (usize, usize),
    pub segments: Vec<SegmentProfile>,
}

impl NoiseProfile {
    pub fn new(
        sample_id: SampleId,
        label: String,
        placement: Placement,
        mask: &[f32],
        plan: &SegmentPlan,
    ) -> Self {
        let segments = plan
            .segments()
            .iter()
            .map(|seg| SegmentProfile {
                start: seg.start,
                end: seg.end,
                mean_amplitude: seg.mean_amplitude,
                epsilon: seg.epsilon,
                step_size: seg.step_size,
                max_abs_noise: mask[seg.range()]
                    .iter()
                    .fold(0.0f32, |acc, v| acc.max(v.abs())),
            })
            .collect();
        Self {
            sample_id,
            label,
            placement: (placement.start, placement.end),
            segments,
        }
    }
}

/// 一次运行需要输出的全部内容
pub struct RunArtifacts<'a> {
    pub config: &'a GeneratorConfig,
    pub dataset: &'a AudioDataset,
    pub store: &'a NoiseStore,
    pub plans: &'a [SegmentPlan],
    pub outcome: &'a RunOutcome,
    pub history: &'a [RoundReport],
}

impl RunArtifacts<'_> {
    /// 写出全部产物, 返回噪声文件路径
    ///
    /// 噪声文件与摘要写失败时返回错误; 单个示例写失败只记录警告.
    pub fn write_all(&self, out_dir: &Path, mode: StorageMode) -> HushResult<PathBuf> {
        fs::create_dir_all(out_dir)?;
        let noise_path = out_dir.join(NOISE_FILE);
        self.store.save(&noise_path, mode)?;
        RunSummary::new(self.config, self.outcome, self.history, self.store)
            .write(&out_dir.join(SUMMARY_FILE))?;

        if !self.store.is_empty() {
            let first = self.store.mask(0)?;
            write_wav_file(
                &out_dir.join(FIRST_NOISE_FILE),
                &first,
                self.config.sample_rate,
            )?;
        }

        let mut written = 0;
        for &id in &self.config.example_indices {
            if id >= self.dataset.len() {
                warn!("示例样本 {id} 超出数据集大小 {}, 已跳过", self.dataset.len());
                continue;
            }
            match self.write_example(out_dir, id) {
                Ok(()) => written += 1,
                Err(e) => warn!("示例样本 {id} 写出失败: {e}"),
            }
        }
        info!("产物已写出到 {} ({written} 个示例)", out_dir.display());
        Ok(noise_path)
    }

    fn write_example(&self, out_dir: &Path, id: SampleId) -> HushResult<()> {
        let clean = self
            .dataset
            .waveform(id)
            .ok_or_else(|| HushError::InvalidArgument(format!("样本编号 {id} 不存在")))?;
        let rate = self.config.sample_rate;
        write_wav_file(
            &out_dir.join(CLEAN_DIR).join(format!("clean_{id}.wav")),
            clean,
            rate,
        )?;
        let noisy = self.store.apply(id, clean)?;
        write_wav_file(
            &out_dir.join(NOISE_DIR).join(format!("noise_{id}.wav")),
            &noisy,
            rate,
        )?;

        let label = self
            .dataset
            .label(id)
            .and_then(|l| self.dataset.label_names().get(l).cloned())
            .unwrap_or_default();
        let plan = self
            .plans
            .get(id)
            .ok_or_else(|| HushError::InvalidArgument(format!("样本 {id} 没有分段信息")))?;
        let mask = self.store.mask(id)?;
        let profile = NoiseProfile::new(id, label, self.store.placement(id)?, &mask, plan);
        let text = serde_json::to_string_pretty(&profile)
            .map_err(|e| HushError::InvalidData(format!("噪声概况序列化失败: {e}")))?;
        fs::write(out_dir.join(NOISE_DIR).join(format!("profile_{id}.json")), text)?;
        Ok(())
    }
}

/// 把噪声仓库加到数据集上, 按原目录结构写出加噪后的 WAV
///
/// 返回写出的文件数.
pub fn write_noisy_dataset(
    dataset: &AudioDataset,
    store: &NoiseStore,
    out_dir: &Path,
    sample_rate: u32,
) -> HushResult<usize> {
    if store.len() != dataset.len() {
        return Err(HushError::ShapeMismatch(format!(
            "噪声仓库有 {} 个样本, 数据集有 {} 个",
            store.len(),
            dataset.len()
        )));
    }
    for id in 0..dataset.len() {
        let clean = dataset
            .waveform(id)
            .ok_or_else(|| HushError::InvalidArgument(format!("样本编号 {id} 不存在")))?;
        let noisy = store.apply(id, clean)?;
        let relative = dataset
            .source(id)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(format!("clip_{id}.wav")));
        write_wav_file(&out_dir.join(relative), &noisy, sample_rate)?;
    }
    info!("已写出 {} 个加噪片段到 {}", dataset.len(), out_dir.display());
    Ok(dataset.len())
}
