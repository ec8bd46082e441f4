//! 音频数据集与批次迭代.
//!
//! 数据集目录布局为 `root/<label>/*.wav`, 标签按目录名排序编号.
//! 文件列表只按种子打乱一次, 之后样本编号 (即 [`SampleId`]) 固定不变,
//! 所有批次都携带样本编号.

use std::fs;
use std::path::{Path, PathBuf};

use hush_core::{HushError, HushResult, SampleId, read_wav_file};
use log::{debug, info, trace, warn};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// 加载时跳过的背景噪声目录
pub const BACKGROUND_NOISE_DIR: &str = "_background_noise_";

/// 截断或补零到指定长度, 并把幅度限制在 `[-1, 1]`
pub fn fit_length(samples: &[f32], len: usize) -> Vec<f32> {
    let mut out: Vec<f32> = samples
        .iter()
        .take(len)
        .map(|v| v.clamp(-1.0, 1.0))
        .collect();
    out.resize(len, 0.0);
    out
}

/// 定长单声道音频数据集
#[derive(Debug, Clone)]
pub struct AudioDataset {
    waveforms: Vec<Vec<f32>>,
    labels: Vec<usize>,
    label_names: Vec<String>,
    /// 相对数据集根目录的路径, 用于输出时还原目录结构
    sources: Vec<PathBuf>,
    waveform_len: usize,
}

impl AudioDataset {
    /// 从内存中的 `(波形, 标签)` 构造, 波形会被截断或补零
    pub fn from_clips(
        clips: Vec<(Vec<f32>, usize)>,
        label_names: Vec<String>,
        waveform_len: usize,
    ) -> HushResult<Self> {
        if waveform_len == 0 {
            return Err(HushError::InvalidArgument("waveform_len 不能为 0".into()));
        }
        let mut waveforms = Vec::with_capacity(clips.len());
        let mut labels = Vec::with_capacity(clips.len());
        let mut sources = Vec::with_capacity(clips.len());
        for (id, (samples, label)) in clips.into_iter().enumerate() {
            let name = label_names.get(label).ok_or_else(|| {
                HushError::InvalidArgument(format!(
                    "样本 {id} 的标签 {label} 超出标签数 {}",
                    label_names.len()
                ))
            })?;
            sources.push(Path::new(name).join(format!("clip_{id}.wav")));
            waveforms.push(fit_length(&samples, waveform_len));
            labels.push(label);
        }
        Ok(Self {
            waveforms,
            labels,
            label_names,
            sources,
            waveform_len,
        })
    }

    /// 扫描 `root/<label>/*.wav` 加载数据集
    pub fn load_dir(root: &Path, waveform_len: usize, seed: u64) -> HushResult<Self> {
        let mut label_names = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_dir() || name == BACKGROUND_NOISE_DIR || name.starts_with('.')
            {
                continue;
            }
            label_names.push(name);
        }
        label_names.sort();
        if label_names.is_empty() {
            return Err(HushError::InvalidData(format!(
                "{} 下没有标签目录",
                root.display()
            )));
        }

        let mut files: Vec<(PathBuf, usize)> = Vec::new();
        for (label, name) in label_names.iter().enumerate() {
            let mut clips: Vec<PathBuf> = fs::read_dir(root.join(name))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
                })
                .collect();
            clips.sort();
            debug!("标签 {label} ({name}): {} 个文件", clips.len());
            files.extend(clips.into_iter().map(|p| (p, label)));
        }
        if files.is_empty() {
            return Err(HushError::InvalidData(format!(
                "{} 下没有 WAV 文件",
                root.display()
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        files.shuffle(&mut rng);

        let mut waveforms = Vec::with_capacity(files.len());
        let mut labels = Vec::with_capacity(files.len());
        let mut sources = Vec::with_capacity(files.len());
        let mut resized = 0usize;
        for (path, label) in files {
            let clip = read_wav_file(&path).map_err(|e| match e {
                HushError::Io(_) => e,
                other => HushError::InvalidData(format!("{}: {other}", path.display())),
            })?;
            if clip.samples.len() != waveform_len {
                resized += 1;
            }
            waveforms.push(fit_length(&clip.samples, waveform_len));
            labels.push(label);
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            sources.push(relative);
        }
        if resized > 0 {
            warn!("{resized} 个片段长度不是 {waveform_len}, 已截断或补零");
        }
        info!(
            "数据集加载完成: {} 个样本, {} 个标签, 长度 {waveform_len}",
            waveforms.len(),
            label_names.len()
        );
        Ok(Self {
            waveforms,
            labels,
            label_names,
            sources,
            waveform_len,
        })
    }

    /// 样本数
    pub fn len(&self) -> usize {
        self.waveforms.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }

    /// 波形长度
    pub fn waveform_len(&self) -> usize {
        self.waveform_len
    }

    /// 类别数
    pub fn num_classes(&self) -> usize {
        self.label_names.len()
    }

    /// 标签名
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// 全部波形, 按样本编号排列
    pub fn waveforms(&self) -> &[Vec<f32>] {
        &self.waveforms
    }

    pub fn waveform(&self, id: SampleId) -> Option<&[f32]> {
        self.waveforms.get(id).map(Vec::as_slice)
    }

    pub fn label(&self, id: SampleId) -> Option<usize> {
        self.labels.get(id).copied()
    }

    /// 样本相对数据集根目录的路径
    pub fn source(&self, id: SampleId) -> Option<&Path> {
        self.sources.get(id).map(PathBuf::as_path)
    }

    /// 按给定编号组装批次
    pub fn batch(&self, ids: &[SampleId]) -> HushResult<Batch> {
        let mut audio = Array2::zeros((ids.len(), self.waveform_len));
        let mut labels = Vec::with_capacity(ids.len());
        for (row, &id) in ids.iter().enumerate() {
            let waveform = self.waveform(id).ok_or_else(|| {
                HushError::InvalidArgument(format!("样本编号 {id} 超出数据集大小 {}", self.len()))
            })?;
            audio
                .row_mut(row)
                .iter_mut()
                .zip(waveform)
                .for_each(|(dst, &src)| *dst = src);
            labels.push(self.labels[id]);
        }
        Ok(Batch {
            ids: ids.to_vec(),
            audio,
            labels,
        })
    }

    /// 固定顺序的批次编号划分, 最后一批可能不满
    pub fn batch_ids(&self, batch_size: usize) -> Vec<Vec<SampleId>> {
        let ids: Vec<SampleId> = (0..self.len()).collect();
        ids.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
    }

    /// 按固定顺序遍历一次全部样本
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = HushResult<Batch>> + '_ {
        self.batch_ids(batch_size)
            .into_iter()
            .map(move |ids| self.batch(&ids))
    }
}

/// 一个批次, 每行对应 `ids` 中的一个样本
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<SampleId>,
    /// 波形 `[B, L]`
    pub audio: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// 循环批次迭代器, 遍历完一轮后从头开始
#[derive(Debug)]
pub struct CyclicBatches<'a> {
    dataset: &'a AudioDataset,
    batch_size: usize,
    cursor: usize,
    wraps: usize,
}

impl<'a> CyclicBatches<'a> {
    pub fn new(dataset: &'a AudioDataset, batch_size: usize) -> HushResult<Self> {
        if batch_size == 0 {
            return Err(HushError::InvalidArgument("batch_size 不能为 0".into()));
        }
        if dataset.is_empty() {
            return Err(HushError::InvalidArgument("数据集为空, 无法循环取批".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            cursor: 0,
            wraps: 0,
        })
    }

    /// 已经从头重新开始的次数
    pub fn wraps(&self) -> usize {
        self.wraps
    }

    /// 取下一批, 到达末尾时回绕
    pub fn next_batch(&mut self) -> HushResult<Batch> {
        if self.cursor >= self.dataset.len() {
            self.cursor = 0;
            self.wraps += 1;
            trace!("批次迭代器回绕 (第 {} 次)", self.wraps);
        }
        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let ids: Vec<SampleId> = (self.cursor..end).collect();
        self.cursor = end;
        self.dataset.batch(&ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hush_core::write_wav_file;

    fn toy(n: usize) -> AudioDataset {
        let clips = (0..n).map(|i| (vec![i as f32 * 0.1; 4], i % 2)).collect();
        AudioDataset::from_clips(clips, vec!["no".into(), "yes".into()], 6).unwrap()
    }

    #[test]
    fn test_截断补零与限幅() {
        assert_eq!(fit_length(&[0.5, 2.0, -3.0], 5), vec![0.5, 1.0, -1.0, 0.0, 0.0]);
        assert_eq!(fit_length(&[0.1, 0.2, 0.3], 2), vec![0.1, 0.2]);
    }

    #[test]
    fn test_批次携带编号() {
        let ds = toy(5);
        let batches: Vec<Batch> = ds.batches(2).collect::<HushResult<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].ids, vec![0, 1]);
        assert_eq!(batches[2].ids, vec![4]);
        assert_eq!(batches[1].labels, vec![0, 1]);
        assert_eq!(batches[1].audio.dim(), (2, 6));
        assert!((batches[1].audio[[0, 0]] - 0.2).abs() < 1e-6);
        assert_eq!(batches[1].audio[[0, 5]], 0.0);
    }

    #[test]
    fn test_循环迭代器回绕() {
        let ds = toy(5);
        let mut it = CyclicBatches::new(&ds, 2).unwrap();
        let ids: Vec<Vec<SampleId>> = (0..5).map(|_| it.next_batch().unwrap().ids).collect();
        assert_eq!(ids, vec![vec![0, 1], vec![2, 3], vec![4], vec![0, 1], vec![2, 3]]);
        assert_eq!(it.wraps(), 1);
        assert!(CyclicBatches::new(&ds, 0).is_err());
    }

    #[test]
    fn test_标签越界() {
        let result = AudioDataset::from_clips(vec![(vec![0.0], 3)], vec!["a".into()], 4);
        assert!(matches!(result, Err(HushError::InvalidArgument(_))));
    }

    #[test]
    fn test_从目录加载() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (label, count) in [("up", 3), ("down", 2)] {
            for i in 0..count {
                let path = root.join(label).join(format!("{i}.wav"));
                write_wav_file(&path, &vec![0.25; 8 + i], 16000).unwrap();
            }
        }
        write_wav_file(&root.join(BACKGROUND_NOISE_DIR).join("bg.wav"), &[0.5; 8], 16000)
            .unwrap();
        std::fs::write(root.join("up").join("notes.txt"), "x").unwrap();

        let ds = AudioDataset::load_dir(root, 10, 8).unwrap();
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.label_names(), &["down".to_string(), "up".to_string()]);
        assert_eq!(ds.waveform_len(), 10);
        for id in 0..ds.len() {
            let w = ds.waveform(id).unwrap();
            assert_eq!(w.len(), 10);
            assert!((w[0] - 0.25).abs() < 1e-4);
            let source = ds.source(id).unwrap();
            let label_dir = source.components().next().unwrap().as_os_str();
            assert_eq!(label_dir, ds.label_names()[ds.label(id).unwrap()].as_str());
        }

        // 同一种子得到同一顺序
        let again = AudioDataset::load_dir(root, 10, 8).unwrap();
        for id in 0..ds.len() {
            assert_eq!(ds.source(id), again.source(id));
        }
    }

    #[test]
    fn test_空目录() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AudioDataset::load_dir(dir.path(), 10, 0),
            Err(HushError::InvalidData(_))
        ));
    }
}
