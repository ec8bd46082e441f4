//! 按样本编号存储的版本化噪声仓库.
//!
//! 每个样本只保存放置区间内的噪声值, 区间外恒为零.
//! 一轮精炼通过 [`RoundBuilder`] 收集全部样本的新噪声, 提交时整体替换
//! 并把版本号加一; 仓库不提供在已有噪声上累加的接口.
//!
//! # 文件格式
//!
//! 所有整数与浮点均为小端序:
//!
//! ```text
//! magic "HUSH" | format u16 | mode u8 | reserved u8 | version u64
//! | count u32 | waveform_len u32
//! | count × ( start u32 | end u32 | values f32 × n )
//! ```
//!
//! `mode = 0` (full) 时 `n = waveform_len`, 区间外写零;
//! `mode = 1` (compact) 时 `n = end - start`.
//! 路径以 `.gz` 结尾时整体经过 gzip 压缩.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hush_core::{HushError, HushResult, Placement, SampleId};
use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use rand::Rng;

const MAGIC: &[u8; 4] = b"HUSH";
const FORMAT_VERSION: u16 = 1;

/// 噪声文件的存储方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// 每个样本写出整段掩码
    Full,
    /// 只写出放置区间内的值
    #[default]
    Compact,
}

impl StorageMode {
    fn to_byte(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Compact => 1,
        }
    }

    fn from_byte(b: u8) -> HushResult<Self> {
        match b {
            0 => Ok(Self::Full),
            1 => Ok(Self::Compact),
            other => Err(HushError::InvalidData(format!("未知的噪声存储方式: {other}"))),
        }
    }
}

/// 版本化噪声仓库
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseStore {
    waveform_len: usize,
    placements: Vec<Placement>,
    /// 每个样本放置区间内的噪声
    noise: Vec<Vec<f32>>,
    version: u64,
}

impl NoiseStore {
    /// 全零噪声
    pub fn zeros(placements: Vec<Placement>, waveform_len: usize) -> HushResult<Self> {
        check_placements(&placements, waveform_len)?;
        let noise = placements.iter().map(|p| vec![0.0; p.len()]).collect();
        Ok(Self {
            waveform_len,
            placements,
            noise,
            version: 0,
        })
    }

    /// `[-bound, bound]` 均匀分布的初始噪声, `bound` 为 0 时等价于 [`Self::zeros`]
    pub fn uniform<R: Rng + ?Sized>(
        placements: Vec<Placement>,
        waveform_len: usize,
        bound: f32,
        rng: &mut R,
    ) -> HushResult<Self> {
        if !(bound.is_finite() && bound >= 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "初始噪声上界必须为非负有限值, 实际 {bound}"
            )));
        }
        let mut store = Self::zeros(placements, waveform_len)?;
        if bound > 0.0 {
            for values in &mut store.noise {
                values
                    .iter_mut()
                    .for_each(|v| *v = rng.gen_range(-bound..=bound));
            }
        }
        Ok(store)
    }

    /// 样本数
    pub fn len(&self) -> usize {
        self.noise.len()
    }

    pub fn is_empty(&self) -> bool {
        self.noise.is_empty()
    }

    /// 已提交的轮数
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn waveform_len(&self) -> usize {
        self.waveform_len
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn placement(&self, id: SampleId) -> HushResult<Placement> {
        self.placements.get(id).copied().ok_or_else(|| self.unknown(id))
    }

    /// 放置区间内的噪声值
    pub fn noise(&self, id: SampleId) -> HushResult<&[f32]> {
        self.noise.get(id).map(Vec::as_slice).ok_or_else(|| self.unknown(id))
    }

    /// 把样本的整段掩码写入 `row`, 区间外置零
    pub fn write_mask_into(&self, id: SampleId, mut row: ArrayViewMut1<'_, f32>) -> HushResult<()> {
        if row.len() != self.waveform_len {
            return Err(HushError::ShapeMismatch(format!(
                "掩码长度 {} 与波形长度 {} 不一致",
                row.len(),
                self.waveform_len
            )));
        }
        let placement = self.placement(id)?;
        row.fill(0.0);
        for (i, &v) in placement.range().zip(&self.noise[id]) {
            row[i] = v;
        }
        Ok(())
    }

    /// 样本的整段掩码
    pub fn mask(&self, id: SampleId) -> HushResult<Vec<f32>> {
        let mut mask = ndarray::Array1::zeros(self.waveform_len);
        self.write_mask_into(id, mask.view_mut())?;
        Ok(mask.to_vec())
    }

    /// 一组样本的掩码 `[B, L]`
    pub fn masks(&self, ids: &[SampleId]) -> HushResult<Array2<f32>> {
        let mut out = Array2::zeros((ids.len(), self.waveform_len));
        for (row, &id) in out.rows_mut().into_iter().zip(ids) {
            self.write_mask_into(id, row)?;
        }
        Ok(out)
    }

    /// 把噪声加到波形上, 结果限制在 `[-1, 1]`
    pub fn apply(&self, id: SampleId, waveform: &[f32]) -> HushResult<Vec<f32>> {
        if waveform.len() != self.waveform_len {
            return Err(HushError::ShapeMismatch(format!(
                "波形长度 {} 与噪声长度 {} 不一致",
                waveform.len(),
                self.waveform_len
            )));
        }
        let placement = self.placement(id)?;
        let mut out = waveform.to_vec();
        for (i, &v) in placement.range().zip(&self.noise[id]) {
            out[i] += v;
        }
        out.iter_mut().for_each(|v| *v = v.clamp(-1.0, 1.0));
        Ok(out)
    }

    /// 所有样本噪声的最大绝对值
    pub fn max_abs(&self) -> f32 {
        self.noise
            .iter()
            .flatten()
            .fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    /// 开始新一轮
    pub fn begin_round(&self) -> RoundBuilder {
        RoundBuilder {
            base_version: self.version,
            waveform_len: self.waveform_len,
            placements: self.placements.clone(),
            slots: vec![None; self.len()],
            filled: 0,
        }
    }

    /// 提交一轮, 整体替换全部噪声
    ///
    /// 每个样本都必须写入过, 且该轮必须基于当前版本开始.
    pub fn commit(&mut self, round: RoundBuilder) -> HushResult<()> {
        if round.base_version != self.version {
            return Err(HushError::InvalidArgument(format!(
                "该轮基于版本 {}, 仓库当前版本为 {}",
                round.base_version, self.version
            )));
        }
        if round.placements != self.placements {
            return Err(HushError::ShapeMismatch("该轮的放置区间与仓库不一致".into()));
        }
        let missing = round.missing();
        if missing > 0 {
            return Err(HushError::InvalidArgument(format!(
                "还有 {missing} 个样本没有写入本轮噪声"
            )));
        }
        self.noise = round.slots.into_iter().flatten().collect();
        self.version += 1;
        debug!("噪声仓库提交第 {} 版", self.version);
        Ok(())
    }

    /// 保存到文件, 先写临时文件再重命名
    pub fn save(&self, path: &Path, mode: StorageMode) -> HushResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(path);
        let result = (|| -> HushResult<()> {
            let writer = BufWriter::new(File::create(&tmp)?);
            if is_gzip(path) {
                let mut encoder = GzEncoder::new(writer, Compression::default());
                self.write_to(&mut encoder, mode)?;
                encoder.finish()?.flush()?;
            } else {
                let mut writer = writer;
                self.write_to(&mut writer, mode)?;
                writer.flush()?;
            }
            std::fs::rename(&tmp, path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result?;
        info!(
            "噪声已保存: {} ({} 个样本, 版本 {}, {:?})",
            path.display(),
            self.len(),
            self.version,
            mode
        );
        Ok(())
    }

    /// 从文件读取
    pub fn load(path: &Path) -> HushResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        if is_gzip(path) {
            Self::read_from(GzDecoder::new(reader))
        } else {
            Self::read_from(reader)
        }
    }

    /// 按文件格式写出
    pub fn write_to<W: Write>(&self, writer: &mut W, mode: StorageMode) -> HushResult<()> {
        let count = u32::try_from(self.len())
            .map_err(|_| HushError::InvalidArgument("样本数超出文件格式上限".into()))?;
        let len = u32::try_from(self.waveform_len)
            .map_err(|_| HushError::InvalidArgument("波形长度超出文件格式上限".into()))?;
        writer.write_all(MAGIC)?;
        writer.write_u16::<LittleEndian>(FORMAT_VERSION)?;
        writer.write_u8(mode.to_byte())?;
        writer.write_u8(0)?;
        writer.write_u64::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(count)?;
        writer.write_u32::<LittleEndian>(len)?;
        for (placement, values) in self.placements.iter().zip(&self.noise) {
            writer.write_u32::<LittleEndian>(placement.start as u32)?;
            writer.write_u32::<LittleEndian>(placement.end as u32)?;
            match mode {
                StorageMode::Compact => {
                    for &v in values {
                        writer.write_f32::<LittleEndian>(v)?;
                    }
                }
                StorageMode::Full => {
                    for i in 0..self.waveform_len {
                        let v = if placement.contains(i) {
                            values[i - placement.start]
                        } else {
                            0.0
                        };
                        writer.write_f32::<LittleEndian>(v)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// 按文件格式读取
    pub fn read_from<R: Read>(mut reader: R) -> HushResult<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HushError::InvalidData("不是 hush 噪声文件".into()));
        }
        let format = reader.read_u16::<LittleEndian>()?;
        if format != FORMAT_VERSION {
            return Err(HushError::Unsupported(format!("噪声文件格式版本 {format}")));
        }
        let mode = StorageMode::from_byte(reader.read_u8()?)?;
        let _reserved = reader.read_u8()?;
        let version = reader.read_u64::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()? as usize;
        let waveform_len = reader.read_u32::<LittleEndian>()? as usize;

        let mut placements = Vec::with_capacity(count.min(1 << 16));
        let mut noise = Vec::with_capacity(count.min(1 << 16));
        for id in 0..count {
            let start = reader.read_u32::<LittleEndian>()? as usize;
            let end = reader.read_u32::<LittleEndian>()? as usize;
            if start > end || end > waveform_len {
                return Err(HushError::InvalidData(format!(
                    "样本 {id} 的放置区间 [{start}, {end}) 非法"
                )));
            }
            let placement = Placement::new(start, end);
            let values = match mode {
                StorageMode::Compact => read_f32s(&mut reader, placement.len())?,
                StorageMode::Full => {
                    let full = read_f32s(&mut reader, waveform_len)?;
                    let outside = full
                        .iter()
                        .enumerate()
                        .any(|(i, &v)| v != 0.0 && !placement.contains(i));
                    if outside {
                        return Err(HushError::InvalidData(format!(
                            "样本 {id} 的噪声超出放置区间"
                        )));
                    }
                    full[placement.range()].to_vec()
                }
            };
            placements.push(placement);
            noise.push(values);
        }
        Ok(Self {
            waveform_len,
            placements,
            noise,
            version,
        })
    }

    fn unknown(&self, id: SampleId) -> HushError {
        HushError::InvalidArgument(format!("样本编号 {id} 超出噪声仓库大小 {}", self.len()))
    }
}

/// 一轮精炼的新噪声, 提交前与仓库互不影响
#[derive(Debug, Clone)]
pub struct RoundBuilder {
    base_version: u64,
    waveform_len: usize,
    placements: Vec<Placement>,
    slots: Vec<Option<Vec<f32>>>,
    filled: usize,
}

impl RoundBuilder {
    /// 写入一个样本的扰动量 (整段长度), 只保留放置区间内的值
    ///
    /// 同一轮内每个样本只能写入一次.
    pub fn set_eta(&mut self, id: SampleId, eta: ArrayView1<'_, f32>) -> HushResult<()> {
        if eta.len() != self.waveform_len {
            return Err(HushError::ShapeMismatch(format!(
                "样本 {id} 的扰动长度 {} 与波形长度 {} 不一致",
                eta.len(),
                self.waveform_len
            )));
        }
        let placement = *self.placements.get(id).ok_or_else(|| {
            HushError::InvalidArgument(format!("样本编号 {id} 超出本轮大小 {}", self.slots.len()))
        })?;
        let slot = &mut self.slots[id];
        if slot.is_some() {
            return Err(HushError::InvalidArgument(format!(
                "样本 {id} 在本轮已写入过噪声"
            )));
        }
        *slot = Some(placement.range().map(|i| eta[i]).collect());
        self.filled += 1;
        Ok(())
    }

    /// 尚未写入的样本数
    pub fn missing(&self) -> usize {
        self.slots.len() - self.filled
    }

    /// 该轮基于的仓库版本
    pub fn base_version(&self) -> u64 {
        self.base_version
    }
}

fn check_placements(placements: &[Placement], waveform_len: usize) -> HushResult<()> {
    if let Some((id, p)) = placements
        .iter()
        .enumerate()
        .find(|(_, p)| p.end > waveform_len)
    {
        return Err(HushError::ShapeMismatch(format!(
            "样本 {id} 的放置区间 {p} 超出波形长度 {waveform_len}"
        )));
    }
    Ok(())
}

fn read_f32s<R: Read>(reader: &mut R, n: usize) -> HushResult<Vec<f32>> {
    let mut values = vec![0.0f32; n];
    reader.read_f32_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn placements() -> Vec<Placement> {
        vec![Placement::new(2, 6), Placement::new(0, 8), Placement::new(4, 5)]
    }

    fn filled_round(store: &NoiseStore, value: f32) -> RoundBuilder {
        let mut round = store.begin_round();
        for id in 0..store.len() {
            round
                .set_eta(id, Array1::from_elem(8, value).view())
                .unwrap();
        }
        round
    }

    #[test]
    fn test_掩码只在放置区间内非零() {
        let mut store = NoiseStore::zeros(placements(), 8).unwrap();
        let round = filled_round(&store, 0.1);
        store.commit(round).unwrap();
        let mask = store.mask(0).unwrap();
        assert_eq!(mask, vec![0.0, 0.0, 0.1, 0.1, 0.1, 0.1, 0.0, 0.0]);
        assert_eq!(store.noise(2).unwrap(), &[0.1]);
        let masks = store.masks(&[2, 0]).unwrap();
        assert_eq!(masks.dim(), (2, 8));
        assert_eq!(masks[[0, 4]], 0.1);
        assert_eq!(masks[[0, 3]], 0.0);
    }

    #[test]
    fn test_提交是覆盖而不是累加() {
        let mut store = NoiseStore::zeros(placements(), 8).unwrap();
        store.commit(filled_round(&store, 0.1)).unwrap();
        store.commit(filled_round(&store, 0.05)).unwrap();
        assert_eq!(store.version(), 2);
        assert!(store.noise(1).unwrap().iter().all(|&v| v == 0.05));
        assert_eq!(store.placements(), placements().as_slice());
    }

    #[test]
    fn test_缺少样本时拒绝提交() {
        let mut store = NoiseStore::zeros(placements(), 8).unwrap();
        let mut round = store.begin_round();
        round.set_eta(0, Array1::zeros(8).view()).unwrap();
        assert_eq!(round.missing(), 2);
        assert!(store.commit(round).is_err());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_重复写入与过期轮次() {
        let mut store = NoiseStore::zeros(placements(), 8).unwrap();
        let mut round = store.begin_round();
        round.set_eta(1, Array1::zeros(8).view()).unwrap();
        assert!(round.set_eta(1, Array1::zeros(8).view()).is_err());
        assert!(matches!(
            round.set_eta(0, Array1::zeros(7).view()),
            Err(HushError::ShapeMismatch(_))
        ));

        let stale = filled_round(&store, 0.2);
        store.commit(filled_round(&store, 0.1)).unwrap();
        assert!(store.commit(stale).is_err());
        assert!(store.noise(0).unwrap().iter().all(|&v| v == 0.1));
    }

    #[test]
    fn test_叠加后限幅() {
        let mut store = NoiseStore::zeros(placements(), 8).unwrap();
        store.commit(filled_round(&store, 0.5)).unwrap();
        let noisy = store.apply(0, &[0.8; 8]).unwrap();
        assert_eq!(noisy[0], 0.8);
        assert_eq!(noisy[2], 1.0);
        assert!(store.apply(0, &[0.0; 7]).is_err());
        assert!(store.apply(9, &[0.0; 8]).is_err());
    }

    #[test]
    fn test_均匀初始化在界内() {
        let mut rng = StdRng::seed_from_u64(8);
        let store = NoiseStore::uniform(placements(), 8, 0.01, &mut rng).unwrap();
        assert!(store.max_abs() <= 0.01);
        assert!(store.max_abs() > 0.0);
        assert_eq!(store.mask(2).unwrap()[0], 0.0);
    }

    #[test]
    fn test_文件读写两种模式() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = NoiseStore::zeros(placements(), 8).unwrap();
        let mut round = store.begin_round();
        for id in 0..3 {
            let eta = Array1::from_shape_fn(8, |i| (i + id) as f32 * 0.01);
            round.set_eta(id, eta.view()).unwrap();
        }
        store.commit(round).unwrap();

        for (name, mode) in [
            ("noise.bin", StorageMode::Compact),
            ("noise.bin.gz", StorageMode::Full),
        ] {
            let path = dir.path().join("out").join(name);
            store.save(&path, mode).unwrap();
            let loaded = NoiseStore::load(&path).unwrap();
            assert_eq!(loaded, store);
        }
        assert!(!dir.path().join("out").join("noise.bin.tmp").exists());
    }

    #[test]
    fn test_损坏文件() {
        assert!(matches!(
            NoiseStore::read_from(&b"NOPE\x01\x00"[..]),
            Err(HushError::InvalidData(_))
        ));
        let mut bytes = Vec::new();
        let store = NoiseStore::zeros(placements(), 8).unwrap();
        store.write_to(&mut bytes, StorageMode::Compact).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            NoiseStore::read_from(bytes.as_slice()),
            Err(HushError::Io(_))
        ));
    }

    #[test]
    fn test_放置区间越界() {
        assert!(NoiseStore::zeros(vec![Placement::new(0, 9)], 8).is_err());
    }
}
