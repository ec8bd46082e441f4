//! WAV (RIFF WAVE) 读写.
//!
//! 只处理生成噪声所需的最小子集:
//! - 读取: PCM 8/16/24/32 位整数与 32 位 IEEE 浮点, 多声道取平均混为单声道
//! - 写入: 单声道 PCM S16LE
//!
//! WAV 文件结构:
//! ```text
//! RIFF header:  "RIFF" + file_size-8 + "WAVE"
//! fmt  chunk:   "fmt " + chunk_size + audio_format + channels + sample_rate
//!              + byte_rate + block_align + bits_per_sample
//! data chunk:   "data" + data_size + PCM samples...
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::error::{HushError, HushResult};

/// WAV 音频格式码: PCM 整数
const WAV_FORMAT_PCM: u16 = 0x0001;
/// WAV 音频格式码: IEEE 浮点
const WAV_FORMAT_IEEE_FLOAT: u16 = 0x0003;
/// WAV 音频格式码: WAVE_FORMAT_EXTENSIBLE, 真实格式在子格式 GUID 中
const WAV_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// 样本编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// 无符号 8 位
    U8,
    /// 有符号 16 位小端
    S16,
    /// 有符号 24 位小端
    S24,
    /// 有符号 32 位小端
    S32,
    /// 32 位浮点小端
    F32,
}

impl SampleEncoding {
    /// 根据 WAV 格式码和位深确定编码
    fn resolve(audio_format: u16, bits_per_sample: u16) -> HushResult<Self> {
        match audio_format {
            WAV_FORMAT_PCM => match bits_per_sample {
                8 => Ok(Self::U8),
                16 => Ok(Self::S16),
                24 => Ok(Self::S24),
                32 => Ok(Self::S32),
                _ => Err(HushError::Unsupported(format!(
                    "不支持的 PCM 位深: {bits_per_sample}"
                ))),
            },
            WAV_FORMAT_IEEE_FLOAT => match bits_per_sample {
                32 => Ok(Self::F32),
                _ => Err(HushError::Unsupported(format!(
                    "不支持的浮点位深: {bits_per_sample}"
                ))),
            },
            _ => Err(HushError::Unsupported(format!(
                "不支持的 WAV 格式码: 0x{audio_format:04X}"
            ))),
        }
    }

    /// 每个样本的字节数
    fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S24 => 3,
            Self::S32 | Self::F32 => 4,
        }
    }

    /// 读取一个样本并归一化到 [-1, 1]
    fn read_sample(self, cursor: &mut Cursor<&[u8]>) -> std::io::Result<f32> {
        let v = match self {
            Self::U8 => (f32::from(cursor.read_u8()?) - 128.0) / 128.0,
            Self::S16 => f32::from(cursor.read_i16::<LittleEndian>()?) / 32768.0,
            Self::S24 => cursor.read_i24::<LittleEndian>()? as f32 / 8_388_608.0,
            Self::S32 => (f64::from(cursor.read_i32::<LittleEndian>()?) / 2_147_483_648.0) as f32,
            Self::F32 => cursor.read_f32::<LittleEndian>()?.clamp(-1.0, 1.0),
        };
        Ok(v)
    }
}

/// 解码后的单声道音频片段
#[derive(Debug, Clone, PartialEq)]
pub struct WavClip {
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 原始声道数 (混音前)
    pub channels: u16,
    /// 原始编码
    pub encoding: SampleEncoding,
    /// 单声道样本, 范围 [-1, 1]
    pub samples: Vec<f32>,
}

/// 从任意字节流读取 WAV
pub fn read_wav<R: Read>(mut reader: R) -> HushResult<WavClip> {
    let mut tag = [0u8; 4];
    reader.read_exact(&mut tag)?;
    if &tag != b"RIFF" {
        return Err(HushError::InvalidData("不是有效的 RIFF 文件".into()));
    }
    let _file_size = reader.read_u32::<LittleEndian>()?;
    reader.read_exact(&mut tag)?;
    if &tag != b"WAVE" {
        return Err(HushError::InvalidData("不是有效的 WAVE 文件".into()));
    }

    let mut fmt: Option<(SampleEncoding, u16, u32)> = None;

    loop {
        match reader.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(HushError::InvalidData("未找到 data 块".into()));
            }
            Err(e) => return Err(e.into()),
        }
        let chunk_size = reader.read_u32::<LittleEndian>()?;

        match &tag {
            b"fmt " => {
                if chunk_size < 16 {
                    return Err(HushError::InvalidData("fmt 块大小不足 16 字节".into()));
                }
                let mut audio_format = reader.read_u16::<LittleEndian>()?;
                let channels = reader.read_u16::<LittleEndian>()?;
                let sample_rate = reader.read_u32::<LittleEndian>()?;
                let _byte_rate = reader.read_u32::<LittleEndian>()?;
                let _block_align = reader.read_u16::<LittleEndian>()?;
                let bits_per_sample = reader.read_u16::<LittleEndian>()?;
                let mut consumed = 16u32;

                if audio_format == WAV_FORMAT_EXTENSIBLE && chunk_size >= 40 {
                    let _cb_size = reader.read_u16::<LittleEndian>()?;
                    let _valid_bits = reader.read_u16::<LittleEndian>()?;
                    let _channel_mask = reader.read_u32::<LittleEndian>()?;
                    // 子格式 GUID 的前两个字节即真实格式码
                    audio_format = reader.read_u16::<LittleEndian>()?;
                    let mut rest = [0u8; 14];
                    reader.read_exact(&mut rest)?;
                    consumed = 40;
                }
                skip(&mut reader, u64::from(chunk_size - consumed))?;

                if channels == 0 {
                    return Err(HushError::InvalidData("声道数为 0".into()));
                }
                let encoding = SampleEncoding::resolve(audio_format, bits_per_sample)?;
                debug!(
                    "fmt: format={:?}, channels={}, rate={}",
                    encoding, channels, sample_rate
                );
                fmt = Some((encoding, channels, sample_rate));
            }
            b"data" => {
                let Some((encoding, channels, sample_rate)) = fmt else {
                    return Err(HushError::InvalidData("data 块出现在 fmt 块之前".into()));
                };
                let mut data = Vec::new();
                // 截断文件或流式写出的 0xFFFFFFFF 大小: 读到流末尾为止
                reader
                    .by_ref()
                    .take(u64::from(chunk_size))
                    .read_to_end(&mut data)?;
                let samples = decode_mono(&data, encoding, usize::from(channels))?;
                debug!("data: {} 字节, {} 个单声道样本", data.len(), samples.len());
                return Ok(WavClip {
                    sample_rate,
                    channels,
                    encoding,
                    samples,
                });
            }
            _ => {
                warn!(
                    "跳过未知块: '{}', 大小={}",
                    String::from_utf8_lossy(&tag),
                    chunk_size
                );
                // 奇数大小的块后有 1 字节填充
                skip(&mut reader, u64::from(chunk_size) + u64::from(chunk_size % 2))?;
            }
        }
    }
}

/// 读取 WAV 文件
pub fn read_wav_file(path: &Path) -> HushResult<WavClip> {
    let file = File::open(path)?;
    read_wav(BufReader::new(file))
}

/// 以单声道 PCM S16LE 写出 WAV
pub fn write_wav<W: Write>(mut writer: W, samples: &[f32], sample_rate: u32) -> HushResult<()> {
    let data_size = u32::try_from(samples.len() * 2)
        .map_err(|_| HushError::InvalidArgument("样本过多, 超出 WAV 大小上限".into()))?;
    let channels: u16 = 1;
    let bits_per_sample: u16 = 16;
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * u32::from(block_align);

    writer.write_all(b"RIFF")?;
    writer.write_u32::<LittleEndian>(36 + data_size)?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_u32::<LittleEndian>(16)?;
    writer.write_u16::<LittleEndian>(WAV_FORMAT_PCM)?;
    writer.write_u16::<LittleEndian>(channels)?;
    writer.write_u32::<LittleEndian>(sample_rate)?;
    writer.write_u32::<LittleEndian>(byte_rate)?;
    writer.write_u16::<LittleEndian>(block_align)?;
    writer.write_u16::<LittleEndian>(bits_per_sample)?;

    writer.write_all(b"data")?;
    writer.write_u32::<LittleEndian>(data_size)?;
    for &s in samples {
        let v = (f64::from(s) * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
        writer.write_i16::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

/// 写出 WAV 文件, 自动创建父目录
pub fn write_wav_file(path: &Path, samples: &[f32], sample_rate: u32) -> HushResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_wav(BufWriter::new(file), samples, sample_rate)
}

/// 将交错多声道数据解码并平均为单声道
fn decode_mono(data: &[u8], encoding: SampleEncoding, channels: usize) -> HushResult<Vec<f32>> {
    let frame_size = encoding.bytes_per_sample() * channels;
    let frames = data.len() / frame_size;
    if data.len() % frame_size != 0 {
        warn!("data 块末尾有 {} 字节不完整帧, 已忽略", data.len() % frame_size);
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(frames);
    for _ in 0..frames {
        let mut acc = 0.0f32;
        for _ in 0..channels {
            acc += encoding.read_sample(&mut cursor)?;
        }
        samples.push(acc / channels as f32);
    }
    Ok(samples)
}

fn skip<R: Read>(reader: &mut R, n: u64) -> HushResult<()> {
    let copied = std::io::copy(&mut reader.by_ref().take(n), &mut std::io::sink())?;
    if copied < n {
        return Err(HushError::InvalidData("块数据被截断".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 构造一个 WAV 文件头 + 数据
    fn build_wav(audio_format: u16, channels: u16, bits: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&(36 + payload.len() as u32 + 12).to_le_bytes());
        buf.extend_from_slice(b"WAVE");
        buf.extend_from_slice(b"fmt ");
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&audio_format.to_le_bytes());
        buf.extend_from_slice(&channels.to_le_bytes());
        buf.extend_from_slice(&16000u32.to_le_bytes());
        let block_align = channels * bits / 8;
        buf.extend_from_slice(&(16000u32 * u32::from(block_align)).to_le_bytes());
        buf.extend_from_slice(&block_align.to_le_bytes());
        buf.extend_from_slice(&bits.to_le_bytes());
        // 一个奇数大小的未知块, 验证填充字节跳过
        buf.extend_from_slice(b"LIST");
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3, 0]);
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_读取_s16_单声道() {
        let mut payload = Vec::new();
        for v in [0i16, 16384, -16384, 32767] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let bytes = build_wav(WAV_FORMAT_PCM, 1, 16, &payload);
        let clip = read_wav(bytes.as_slice()).unwrap();
        assert_eq!(clip.sample_rate, 16000);
        assert_eq!(clip.encoding, SampleEncoding::S16);
        assert_eq!(clip.samples.len(), 4);
        assert!((clip.samples[1] - 0.5).abs() < 1e-6);
        assert!((clip.samples[2] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_立体声混为单声道() {
        let mut payload = Vec::new();
        for v in [0.5f32, -0.5, 1.0, 0.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let bytes = build_wav(WAV_FORMAT_IEEE_FLOAT, 2, 32, &payload);
        let clip = read_wav(bytes.as_slice()).unwrap();
        assert_eq!(clip.channels, 2);
        assert_eq!(clip.samples, vec![0.0, 0.5]);
    }

    #[test]
    fn test_读取_s24_与_u8() {
        let payload = [0x00, 0x00, 0x40]; // 0x400000 = 4194304 -> 0.5
        let bytes = build_wav(WAV_FORMAT_PCM, 1, 24, &payload);
        let clip = read_wav(bytes.as_slice()).unwrap();
        assert!((clip.samples[0] - 0.5).abs() < 1e-6);

        let bytes = build_wav(WAV_FORMAT_PCM, 1, 8, &[128, 0]);
        let clip = read_wav(bytes.as_slice()).unwrap();
        assert_eq!(clip.samples, vec![0.0, -1.0]);
    }

    #[test]
    fn test_不支持的格式码() {
        let bytes = build_wav(0x0055, 1, 16, &[0, 0]);
        assert!(matches!(
            read_wav(bytes.as_slice()),
            Err(HushError::Unsupported(_))
        ));
    }

    #[test]
    fn test_非_riff_文件() {
        let bytes = b"OggS\0\0\0\0WAVE".to_vec();
        assert!(matches!(
            read_wav(bytes.as_slice()),
            Err(HushError::InvalidData(_))
        ));
    }

    #[test]
    fn test_写出后可读回() {
        let samples = vec![0.0, 0.25, -0.25, 0.999, -1.0];
        let mut buf = Vec::new();
        write_wav(&mut buf, &samples, 8000).unwrap();
        assert_eq!(buf.len(), 44 + samples.len() * 2);

        let clip = read_wav(buf.as_slice()).unwrap();
        assert_eq!(clip.sample_rate, 8000);
        for (a, b) in clip.samples.iter().zip(&samples) {
            assert!((a - b).abs() < 1.0 / 16384.0, "{a} vs {b}");
        }
    }

    #[test]
    fn test_写文件自动创建目录() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("clip.wav");
        write_wav_file(&path, &[0.1, -0.1], 16000).unwrap();
        let clip = read_wav_file(&path).unwrap();
        assert_eq!(clip.samples.len(), 2);
    }
}
