//! # hush
//!
//! 纯 Rust 实现的音频误差最小化 (不可学习样本) 噪声生成工具集.
//!
//! 噪声与分类器交替优化: 分类器在加噪数据上训练, 噪声则在冻结的分类器上
//! 沿损失下降方向搜索, 使加噪后的样本"过于容易"被学会. 每个分段的噪声上限
//! 随该段响度变化, 越安静的分段允许的噪声越小.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::path::Path;
//! use hush::train::{AlternatingTrainer, AudioDataset, GeneratorConfig};
//!
//! let config = GeneratorConfig::default();
//! let dataset = AudioDataset::load_dir(Path::new("speech"), config.waveform_len, config.seed)?;
//! let model = hush::default_classifier(&config, dataset.num_classes())?;
//! let mut trainer = AlternatingTrainer::new(config, &dataset, model)?;
//! println!("{:?}", trainer.run()?);
//! # Ok::<(), hush::core::HushError>(())
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `hush-core` | 错误类型、样本标识、流式统计、WAV 读写 |
//! | `hush-model` | 分类器接口、卷积分类器、Adam 优化器 |
//! | `hush-attack` | 分段 epsilon 调度、噪声放置、min-min 搜索 |
//! | `hush-train` | 数据集、噪声仓库、交替优化循环、产物输出 |

/// 核心类型与工具
pub use hush_core as core;

/// 分类器与优化器
pub use hush_model as model;

/// 扰动搜索
pub use hush_attack as attack;

/// 交替优化与持久化
pub use hush_train as train;

/// 获取 hush 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 按配置创建默认的卷积分类器
pub fn default_classifier(
    config: &hush_train::GeneratorConfig,
    num_classes: usize,
) -> hush_core::HushResult<hush_model::ConvClassifier> {
    hush_model::ConvClassifier::new(config.classifier_config(num_classes))
}
