//! 噪声生成配置.
//!
//! 所有字段都有默认值, JSON 配置文件只需写出要覆盖的键.

use std::path::Path;

use hush_attack::{PlacementMode, SegmentEpsilonScheduler};
use hush_core::{HushError, HushResult};
use hush_model::{Adam, ConvClassifierConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 平均损失低于该值时停止
    #[serde(default = "default_target_error_rate")]
    pub target_error_rate: f64,
    #[serde(default = "default_max_epsilon")]
    pub max_epsilon: f32,
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    #[serde(default = "default_step_size_factor")]
    pub step_size_factor: f32,
    /// 每轮训练的 mini-batch 数
    #[serde(default = "default_steps")]
    pub train_step: usize,
    /// 每次扰动搜索的迭代次数
    #[serde(default = "default_steps")]
    pub num_steps: usize,
    /// `center` 或 `random`
    #[serde(default = "default_placement")]
    pub placement: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_waveform_len")]
    pub waveform_len: usize,
    /// 噪声长度, 缺省与波形等长
    #[serde(default)]
    pub noise_len: Option<usize>,
    /// 初始噪声的均匀分布上界, 0 表示全零
    #[serde(default)]
    pub init_epsilon: f32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// 输出前后对比产物的样本编号
    #[serde(default = "default_example_indices")]
    pub example_indices: Vec<usize>,
    #[serde(default = "default_n_channel")]
    pub n_channel: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
}

fn default_batch_size() -> usize {
    256
}

fn default_target_error_rate() -> f64 {
    0.08
}

fn default_max_epsilon() -> f32 {
    0.13
}

fn default_segment_size() -> usize {
    1000
}

fn default_step_size_factor() -> f32 {
    25.0
}

fn default_steps() -> usize {
    20
}

fn default_placement() -> String {
    PlacementMode::Center.as_str().to_string()
}

fn default_seed() -> u64 {
    8
}

fn default_waveform_len() -> usize {
    16000
}

fn default_max_rounds() -> usize {
    100
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_weight_decay() -> f32 {
    0.0001
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_example_indices() -> Vec<usize> {
    vec![0, 1, 2, 7]
}

fn default_n_channel() -> usize {
    32
}

fn default_kernel_size() -> usize {
    80
}

fn default_stride() -> usize {
    16
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            target_error_rate: default_target_error_rate(),
            max_epsilon: default_max_epsilon(),
            segment_size: default_segment_size(),
            step_size_factor: default_step_size_factor(),
            train_step: default_steps(),
            num_steps: default_steps(),
            placement: default_placement(),
            seed: default_seed(),
            waveform_len: default_waveform_len(),
            noise_len: None,
            init_epsilon: 0.0,
            max_rounds: default_max_rounds(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            sample_rate: default_sample_rate(),
            example_indices: default_example_indices(),
            n_channel: default_n_channel(),
            kernel_size: default_kernel_size(),
            stride: default_stride(),
        }
    }
}

impl GeneratorConfig {
    /// 从 JSON 文本解析, 未出现的键使用默认值
    pub fn from_json_str(text: &str) -> HushResult<Self> {
        serde_json::from_str(text).map_err(|e| HushError::InvalidData(format!("配置解析失败: {e}")))
    }

    /// 从 JSON 文件读取
    pub fn from_json_file(path: &Path) -> HushResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// 解析后的放置模式
    pub fn placement_mode(&self) -> HushResult<PlacementMode> {
        self.placement.parse()
    }

    /// 实际噪声长度
    pub fn effective_noise_len(&self) -> usize {
        self.noise_len.unwrap_or(self.waveform_len)
    }

    /// 检查取值范围
    pub fn validate(&self) -> HushResult<()> {
        self.placement_mode()?;
        let positive = [
            ("batch_size", self.batch_size),
            ("segment_size", self.segment_size),
            ("waveform_len", self.waveform_len),
            ("max_rounds", self.max_rounds),
            ("n_channel", self.n_channel),
            ("kernel_size", self.kernel_size),
            ("stride", self.stride),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(HushError::InvalidArgument(format!("{key} 必须大于 0")));
            }
        }
        if !(self.target_error_rate.is_finite() && self.target_error_rate >= 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "target_error_rate 必须为非负有限值, 实际 {}",
                self.target_error_rate
            )));
        }
        if !(self.init_epsilon.is_finite() && self.init_epsilon >= 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "init_epsilon 必须为非负有限值, 实际 {}",
                self.init_epsilon
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "learning_rate 必须为正有限值, 实际 {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "weight_decay 必须为非负有限值, 实际 {}",
                self.weight_decay
            )));
        }
        if self.sample_rate == 0 {
            return Err(HushError::InvalidArgument("sample_rate 必须大于 0".into()));
        }
        let noise_len = self.effective_noise_len();
        if noise_len == 0 || noise_len > self.waveform_len {
            return Err(HushError::InvalidArgument(format!(
                "noise_len {noise_len} 必须在 1..={} 之间",
                self.waveform_len
            )));
        }
        if self.kernel_size > self.waveform_len {
            return Err(HushError::InvalidArgument(format!(
                "kernel_size {} 超过波形长度 {}",
                self.kernel_size, self.waveform_len
            )));
        }
        self.scheduler()?;
        Ok(())
    }

    /// 按配置创建分段调度器
    pub fn scheduler(&self) -> HushResult<SegmentEpsilonScheduler> {
        SegmentEpsilonScheduler::new(self.max_epsilon, self.step_size_factor, self.segment_size)
    }

    /// 分类器结构参数
    pub fn classifier_config(&self, num_classes: usize) -> ConvClassifierConfig {
        ConvClassifierConfig {
            n_channel: self.n_channel,
            kernel_size: self.kernel_size,
            stride: self.stride,
            num_classes,
            seed: self.seed,
        }
    }

    /// 分类器优化器
    pub fn optimizer(&self) -> Adam {
        Adam::new(self.learning_rate).weight_decay(self.weight_decay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_默认值() {
        let config = GeneratorConfig::default();
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.target_error_rate, 0.08);
        assert_eq!(config.max_epsilon, 0.13);
        assert_eq!(config.segment_size, 1000);
        assert_eq!(config.step_size_factor, 25.0);
        assert_eq!(config.train_step, 20);
        assert_eq!(config.num_steps, 20);
        assert_eq!(config.placement_mode().unwrap(), PlacementMode::Center);
        assert_eq!(config.seed, 8);
        assert_eq!(config.effective_noise_len(), 16000);
        assert_eq!(config.example_indices, vec![0, 1, 2, 7]);
        config.validate().unwrap();
    }

    #[test]
    fn test_部分覆盖() {
        let config = GeneratorConfig::from_json_str(
            r#"{ "batch_size": 8, "placement": "random", "noise_len": 4000 }"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.placement_mode().unwrap(), PlacementMode::Random);
        assert_eq!(config.effective_noise_len(), 4000);
        assert_eq!(config.max_rounds, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_空对象等于默认值() {
        let config = GeneratorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, GeneratorConfig::default());
    }

    #[test]
    fn test_未知键与非法_json() {
        assert!(matches!(
            GeneratorConfig::from_json_str(r#"{ "batch": 8 }"#),
            Err(HushError::InvalidData(_))
        ));
        assert!(matches!(
            GeneratorConfig::from_json_str("{"),
            Err(HushError::InvalidData(_))
        ));
    }

    #[test]
    fn test_校验失败() {
        let mut config = GeneratorConfig {
            placement: "foo".into(),
            ..GeneratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(HushError::InvalidPlacementMode(_))
        ));

        config.placement = "center".into();
        config.noise_len = Some(20000);
        assert!(matches!(config.validate(), Err(HushError::InvalidArgument(_))));

        config.noise_len = None;
        config.batch_size = 0;
        assert!(config.validate().is_err());

        config.batch_size = 4;
        config.max_epsilon = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_序列化往返() {
        let config = GeneratorConfig {
            noise_len: Some(800),
            ..GeneratorConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(GeneratorConfig::from_json_str(&text).unwrap(), config);
    }
}
