//! 一维卷积波形分类器.
//!
//! 结构:
//! ```text
//! [B, L] → Conv1d(1 → C, kernel K, stride S) → ReLU → 全局平均池化 → Linear(C → N) → log-softmax
//! ```
//!
//! 反向传播手工推导, 同时支持对参数求梯度 (训练) 与对输入求梯度 (min-min 攻击).

use hush_core::{HushError, HushResult};
use log::debug;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::Classifier;
use crate::loss::{cross_entropy, cross_entropy_grad, log_softmax};
use crate::optim::Adam;

/// 卷积分类器结构参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvClassifierConfig {
    /// 卷积通道数
    pub n_channel: usize,
    /// 卷积核长度
    pub kernel_size: usize,
    /// 卷积步长
    pub stride: usize,
    /// 类别数
    pub num_classes: usize,
    /// 参数初始化种子
    pub seed: u64,
}

impl Default for ConvClassifierConfig {
    fn default() -> Self {
        Self {
            n_channel: 32,
            kernel_size: 80,
            stride: 16,
            num_classes: 35,
            seed: 8,
        }
    }
}

/// 一维卷积分类器
#[derive(Debug, Clone)]
pub struct ConvClassifier {
    /// 卷积核 [C, K]
    conv_w: Array2<f32>,
    /// 卷积偏置 [C]
    conv_b: Array1<f32>,
    /// 全连接权重 [N, C]
    fc_w: Array2<f32>,
    /// 全连接偏置 [N]
    fc_b: Array1<f32>,
    kernel_size: usize,
    stride: usize,
    /// 参数是否可训练
    requires_grad: bool,
}

/// 前向过程中反向传播需要的中间量
struct ForwardCache {
    /// 卷积输出 (ReLU 之前) [B, C, T]
    pre: Array3<f32>,
    /// 池化后的特征 [B, C]
    pooled: Array2<f32>,
    /// log 概率 [B, N]
    log_probs: Array2<f32>,
}

/// 参数梯度, 布局与参数一致
struct ParamGrads {
    conv_w: Array2<f32>,
    conv_b: Array1<f32>,
    fc_w: Array2<f32>,
    fc_b: Array1<f32>,
}

impl ConvClassifier {
    /// 按配置随机初始化, 权重服从 U(-1/√fan_in, 1/√fan_in)
    pub fn new(config: ConvClassifierConfig) -> HushResult<Self> {
        if config.n_channel == 0 || config.kernel_size == 0 || config.stride == 0 {
            return Err(HushError::InvalidArgument(format!(
                "卷积结构参数必须为正: {config:?}"
            )));
        }
        if config.num_classes < 2 {
            return Err(HushError::InvalidArgument(format!(
                "类别数至少为 2, 实际 {}",
                config.num_classes
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let conv_bound = 1.0 / (config.kernel_size as f32).sqrt();
        let fc_bound = 1.0 / (config.n_channel as f32).sqrt();

        let conv_w = Array2::from_shape_fn((config.n_channel, config.kernel_size), |_| {
            rng.gen_range(-conv_bound..conv_bound)
        });
        let conv_b = Array1::from_shape_fn(config.n_channel, |_| {
            rng.gen_range(-conv_bound..conv_bound)
        });
        let fc_w = Array2::from_shape_fn((config.num_classes, config.n_channel), |_| {
            rng.gen_range(-fc_bound..fc_bound)
        });
        let fc_b = Array1::from_shape_fn(config.num_classes, |_| {
            rng.gen_range(-fc_bound..fc_bound)
        });

        debug!(
            "初始化卷积分类器: C={}, K={}, S={}, N={}",
            config.n_channel, config.kernel_size, config.stride, config.num_classes
        );

        Ok(Self {
            conv_w,
            conv_b,
            fc_w,
            fc_b,
            kernel_size: config.kernel_size,
            stride: config.stride,
            requires_grad: false,
        })
    }

    /// 可训练参数总数
    pub fn parameter_count(&self) -> usize {
        self.conv_w.len() + self.conv_b.len() + self.fc_w.len() + self.fc_b.len()
    }

    /// 给定输入长度时卷积输出的帧数
    fn frames_for(&self, input_len: usize) -> HushResult<usize> {
        if input_len < self.kernel_size {
            return Err(HushError::ShapeMismatch(format!(
                "输入长度 {input_len} 小于卷积核长度 {}",
                self.kernel_size
            )));
        }
        Ok((input_len - self.kernel_size) / self.stride + 1)
    }

    fn forward_cached(&self, input: ArrayView2<'_, f32>) -> HushResult<ForwardCache> {
        let (batch, len) = input.dim();
        let frames = self.frames_for(len)?;
        let channels = self.conv_w.nrows();
        let x = input.as_standard_layout();

        let mut pre = Array3::<f32>::zeros((batch, channels, frames));
        for b in 0..batch {
            let row = x.row(b);
            for c in 0..channels {
                let w = self.conv_w.row(c);
                let bias = self.conv_b[c];
                for t in 0..frames {
                    let offset = t * self.stride;
                    let mut acc = bias;
                    for k in 0..self.kernel_size {
                        acc += w[k] * row[offset + k];
                    }
                    pre[[b, c, t]] = acc;
                }
            }
        }

        let pooled = pre.map_axis(Axis(2), |lane| {
            lane.iter().map(|&v| v.max(0.0)).sum::<f32>() / frames as f32
        });
        let logits = pooled.dot(&self.fc_w.t()) + &self.fc_b;
        let log_probs = log_softmax(logits.view());

        Ok(ForwardCache {
            pre,
            pooled,
            log_probs,
        })
    }

    /// 由 logits 梯度回传到卷积输出 (已乘 ReLU 掩码与池化系数)
    fn hidden_grad(&self, cache: &ForwardCache, d_logits: &Array2<f32>) -> Array3<f32> {
        let frames = cache.pre.len_of(Axis(2));
        let d_pooled = d_logits.dot(&self.fc_w);
        let mut d_pre = cache.pre.mapv(|v| if v > 0.0 { 1.0f32 } else { 0.0 });
        for ((b, c, _), g) in d_pre.indexed_iter_mut() {
            *g *= d_pooled[[b, c]] / frames as f32;
        }
        d_pre
    }

    fn param_grads(
        &self,
        input: ArrayView2<'_, f32>,
        cache: &ForwardCache,
        labels: &[usize],
    ) -> HushResult<ParamGrads> {
        let d_logits = cross_entropy_grad(cache.log_probs.view(), labels)?;
        let fc_w = d_logits.t().dot(&cache.pooled);
        let fc_b = d_logits.sum_axis(Axis(0));

        let d_pre = self.hidden_grad(cache, &d_logits);
        let conv_b = d_pre.sum_axis(Axis(2)).sum_axis(Axis(0));
        let mut conv_w = Array2::<f32>::zeros(self.conv_w.raw_dim());
        let x = input.as_standard_layout();
        let (batch, channels, frames) = d_pre.dim();
        for b in 0..batch {
            let row = x.row(b);
            for c in 0..channels {
                for t in 0..frames {
                    let g = d_pre[[b, c, t]];
                    if g == 0.0 {
                        continue;
                    }
                    let offset = t * self.stride;
                    for k in 0..self.kernel_size {
                        conv_w[[c, k]] += g * row[offset + k];
                    }
                }
            }
        }

        Ok(ParamGrads {
            conv_w,
            conv_b,
            fc_w,
            fc_b,
        })
    }

    fn input_grad(&self, input_len: usize, d_pre: &Array3<f32>) -> Array2<f32> {
        let (batch, channels, frames) = d_pre.dim();
        let mut dx = Array2::<f32>::zeros((batch, input_len));
        for b in 0..batch {
            for c in 0..channels {
                let w = self.conv_w.row(c);
                for t in 0..frames {
                    let g = d_pre[[b, c, t]];
                    if g == 0.0 {
                        continue;
                    }
                    let offset = t * self.stride;
                    for k in 0..self.kernel_size {
                        dx[[b, offset + k]] += g * w[k];
                    }
                }
            }
        }
        dx
    }
}

impl Classifier for ConvClassifier {
    fn num_classes(&self) -> usize {
        self.fc_w.nrows()
    }

    fn forward(&self, input: ArrayView2<'_, f32>) -> HushResult<Array2<f32>> {
        Ok(self.forward_cached(input)?.log_probs)
    }

    fn loss_and_input_grad(
        &self,
        input: ArrayView2<'_, f32>,
        labels: &[usize],
    ) -> HushResult<(f32, Array2<f32>)> {
        let cache = self.forward_cached(input)?;
        let loss = cross_entropy(cache.log_probs.view(), labels)?;
        let d_logits = cross_entropy_grad(cache.log_probs.view(), labels)?;
        let d_pre = self.hidden_grad(&cache, &d_logits);
        Ok((loss, self.input_grad(input.ncols(), &d_pre)))
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    fn set_requires_grad(&mut self, enabled: bool) {
        self.requires_grad = enabled;
    }

    fn train_step(
        &mut self,
        input: ArrayView2<'_, f32>,
        labels: &[usize],
        optimizer: &mut Adam,
    ) -> HushResult<f32> {
        if !self.requires_grad {
            return Err(HushError::ParamsFrozen);
        }
        let cache = self.forward_cached(input)?;
        let loss = cross_entropy(cache.log_probs.view(), labels)?;
        if !loss.is_finite() {
            return Err(HushError::NonFiniteLoss {
                phase: "train",
                value: loss,
            });
        }
        let grads = self.param_grads(input, &cache, labels)?;
        optimizer.step(
            &mut [
                self.conv_w.view_mut().into_dyn(),
                self.conv_b.view_mut().into_dyn(),
                self.fc_w.view_mut().into_dyn(),
                self.fc_b.view_mut().into_dyn(),
            ],
            &[
                grads.conv_w.view().into_dyn(),
                grads.conv_b.view().into_dyn(),
                grads.fc_w.view().into_dyn(),
                grads.fc_b.view().into_dyn(),
            ],
        )?;
        Ok(loss)
    }
}
