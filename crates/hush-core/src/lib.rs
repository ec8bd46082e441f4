//! # hush-core
//!
//! hush 核心库, 提供各 crate 共享的基础设施:
//! 统一错误类型、样本标识与噪声放置区间、流式统计量以及 WAV 读写.

pub mod error;
pub mod sample;
pub mod stats;
pub mod wav;

// 重导出常用类型
pub use error::{HushError, HushResult};
pub use sample::{Placement, SampleId};
pub use stats::RunningStats;
pub use wav::{WavClip, read_wav_file, write_wav_file};
