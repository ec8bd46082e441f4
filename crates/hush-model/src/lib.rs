//! # hush-model
//!
//! hush 分类器层: 生成噪声时被交替训练和攻击的波形分类器.
//!
//! - [`Classifier`]: 核心循环依赖的分类器接口
//! - [`TrainSession`]: 训练阶段的作用域守卫, 持有期间参数可训练, 释放后自动冻结
//! - [`ConvClassifier`]: 一维卷积分类器实现
//! - [`Adam`]: 带 L2 权重衰减的 Adam 优化器

pub mod conv;
pub mod loss;
pub mod optim;

use hush_core::{HushError, HushResult};
use log::trace;
use ndarray::{Array2, ArrayView2};

pub use conv::{ConvClassifier, ConvClassifierConfig};
pub use optim::Adam;

/// 分类器 trait
///
/// 输入为单声道波形批次 `[B, L]`, 输出为 `[B, num_classes]` 的 log 概率.
/// 参数的可训练状态由 [`TrainSession`] 管理, 在会话之外参数始终冻结.
pub trait Classifier {
    /// 类别数
    fn num_classes(&self) -> usize;

    /// 前向计算, 返回 log 概率
    fn forward(&self, input: ArrayView2<'_, f32>) -> HushResult<Array2<f32>>;

    /// 参数不变, 返回批平均交叉熵及其对输入的梯度 `[B, L]`
    ///
    /// 损失可能是非有限值, 由调用方判断并终止.
    fn loss_and_input_grad(
        &self,
        input: ArrayView2<'_, f32>,
        labels: &[usize],
    ) -> HushResult<(f32, Array2<f32>)>;

    /// 参数当前是否可训练
    fn requires_grad(&self) -> bool;

    /// 切换参数可训练状态, 仅供 [`TrainSession`] 使用
    fn set_requires_grad(&mut self, enabled: bool);

    /// 以交叉熵执行一次参数更新, 返回本批损失
    ///
    /// 参数冻结时返回 [`hush_core::HushError::ParamsFrozen`].
    fn train_step(
        &mut self,
        input: ArrayView2<'_, f32>,
        labels: &[usize],
        optimizer: &mut Adam,
    ) -> HushResult<f32>;
}

/// 训练阶段守卫
///
/// 创建时打开参数梯度, 析构时关闭. 守卫持有分类器的可变借用,
/// 因此在训练阶段内无法同时对同一分类器发起攻击或评估.
pub struct TrainSession<'a, C: Classifier + ?Sized> {
    model: &'a mut C,
    optimizer: &'a mut Adam,
    steps: usize,
}

impl<'a, C: Classifier + ?Sized> TrainSession<'a, C> {
    /// 进入训练阶段
    pub fn begin(model: &'a mut C, optimizer: &'a mut Adam) -> Self {
        model.set_requires_grad(true);
        trace!("进入训练阶段, 参数已解冻");
        Self {
            model,
            optimizer,
            steps: 0,
        }
    }

    /// 对一个批次执行一次更新
    ///
    /// 损失为 NaN/Inf 时返回 [`HushError::NonFiniteLoss`].
    pub fn step(&mut self, input: ArrayView2<'_, f32>, labels: &[usize]) -> HushResult<f32> {
        let loss = self.model.train_step(input, labels, self.optimizer)?;
        if !loss.is_finite() {
            return Err(HushError::NonFiniteLoss {
                phase: "train",
                value: loss,
            });
        }
        self.steps += 1;
        Ok(loss)
    }

    /// 本会话内已执行的更新次数
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// 只读访问分类器
    pub fn model(&self) -> &C {
        &*self.model
    }
}

impl<C: Classifier + ?Sized> Drop for TrainSession<'_, C> {
    fn drop(&mut self) {
        self.model.set_requires_grad(false);
        trace!("离开训练阶段, 参数已冻结 ({} 步)", self.steps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ConvClassifier {
        ConvClassifier::new(ConvClassifierConfig {
            n_channel: 2,
            kernel_size: 3,
            stride: 1,
            num_classes: 2,
            seed: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_会话结束后自动冻结() {
        let mut model = tiny();
        let mut opt = Adam::new(0.01);
        assert!(!model.requires_grad());
        {
            let session = TrainSession::begin(&mut model, &mut opt);
            assert!(session.model().requires_grad());
            assert_eq!(session.steps(), 0);
        }
        assert!(!model.requires_grad());
    }

    #[test]
    fn test_错误提前返回也会冻结() {
        let mut model = tiny();
        let mut opt = Adam::new(0.01);
        let input = Array2::<f32>::zeros((1, 8));
        let result = (|| -> HushResult<f32> {
            let mut session = TrainSession::begin(&mut model, &mut opt);
            // 标签越界, step 返回错误
            session.step(input.view(), &[5])
        })();
        assert!(result.is_err());
        assert!(!model.requires_grad());
    }

    /// 训练步总是返回 NaN 的分类器
    struct NanTrainer {
        inner: ConvClassifier,
    }

    impl Classifier for NanTrainer {
        fn num_classes(&self) -> usize {
            self.inner.num_classes()
        }

        fn forward(&self, input: ArrayView2<'_, f32>) -> HushResult<Array2<f32>> {
            self.inner.forward(input)
        }

        fn loss_and_input_grad(
            &self,
            input: ArrayView2<'_, f32>,
            labels: &[usize],
        ) -> HushResult<(f32, Array2<f32>)> {
            self.inner.loss_and_input_grad(input, labels)
        }

        fn requires_grad(&self) -> bool {
            self.inner.requires_grad()
        }

        fn set_requires_grad(&mut self, enabled: bool) {
            self.inner.set_requires_grad(enabled);
        }

        fn train_step(
            &mut self,
            _input: ArrayView2<'_, f32>,
            _labels: &[usize],
            _optimizer: &mut Adam,
        ) -> HushResult<f32> {
            Ok(f32::NAN)
        }
    }

    #[test]
    fn test_训练损失非有限时报错() {
        let mut model = NanTrainer { inner: tiny() };
        let mut opt = Adam::new(0.01);
        let input = Array2::<f32>::zeros((1, 8));
        {
            let mut session = TrainSession::begin(&mut model, &mut opt);
            assert!(matches!(
                session.step(input.view(), &[0]),
                Err(HushError::NonFiniteLoss { phase: "train", .. })
            ));
            assert_eq!(session.steps(), 0);
        }
        assert!(!model.requires_grad());
    }
}
