//! # hush-train
//!
//! hush 交替双层优化层: 把数据集、分类器与扰动搜索组合成完整的噪声生成流程.
//!
//! - [`GeneratorConfig`]: 全部可调参数, 可从 JSON 读取
//! - [`AudioDataset`]: `root/<label>/*.wav` 布局的定长数据集, 批次携带样本编号
//! - [`NoiseStore`]: 按样本编号寻址的版本化噪声仓库, 每轮整体替换
//! - [`AlternatingTrainer`]: 训练 → 精炼噪声 → 评估 的循环
//! - [`RunArtifacts`]: 噪声文件、运行摘要与前后对比示例的输出
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use std::path::Path;
//! use hush_model::ConvClassifier;
//! use hush_train::{AlternatingTrainer, AudioDataset, GeneratorConfig};
//!
//! let config = GeneratorConfig::default();
//! let dataset = AudioDataset::load_dir(Path::new("data"), config.waveform_len, config.seed)?;
//! let model = ConvClassifier::new(config.classifier_config(dataset.num_classes()))?;
//! let mut trainer = AlternatingTrainer::new(config, &dataset, model)?;
//! let outcome = trainer.run()?;
//! println!("收敛: {}", outcome.is_converged());
//! # Ok::<(), hush_core::HushError>(())
//! ```

pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod noise_store;
pub mod trainer;

pub use artifacts::{RunArtifacts, RunSummary, write_noisy_dataset};
pub use config::GeneratorConfig;
pub use dataset::{AudioDataset, Batch, CyclicBatches};
pub use noise_store::{NoiseStore, RoundBuilder, StorageMode};
pub use trainer::{AlternatingTrainer, EvalReport, Phase, RefineReport, RoundReport, RunOutcome};
