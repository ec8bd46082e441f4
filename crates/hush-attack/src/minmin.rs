//! 分段 min-min 扰动搜索.
//!
//! 与对抗攻击方向相反: 沿损失下降方向做符号梯度步, 让扰动后的样本
//! 更容易被分类正确. 每步之后把扰动投影回三重约束:
//! 分段 epsilon 球、噪声放置区间、合法幅度 `[-1, 1]`.

use hush_core::{HushError, HushResult, Placement};
use hush_model::Classifier;
use log::{debug, trace};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

use crate::epsilon::{SegmentPlan, SegmentPrecomputed};

/// 一次攻击的输入
///
/// 按行对齐: 第 `b` 行的波形、标签、初始噪声、分段和放置区间属于同一个样本.
#[derive(Debug, Clone, Copy)]
pub struct AttackBatch<'a> {
    /// 原始波形 `[B, L]`
    pub audio: ArrayView2<'a, f32>,
    /// 标签
    pub labels: &'a [usize],
    /// 初始噪声 `[B, L]`, 已按放置区间展开为整段掩码
    pub init_noise: ArrayView2<'a, f32>,
    /// 每个样本的分段
    pub plans: &'a [&'a SegmentPlan],
    /// 每个样本的噪声放置区间
    pub placements: &'a [Placement],
}

impl AttackBatch<'_> {
    /// 样本数
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// 是否为空批次
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn validate(&self) -> HushResult<()> {
        let (batch, len) = self.audio.dim();
        if self.init_noise.dim() != (batch, len) {
            return Err(HushError::ShapeMismatch(format!(
                "初始噪声形状 {:?} 与波形形状 {:?} 不一致",
                self.init_noise.dim(),
                (batch, len)
            )));
        }
        for (name, count) in [
            ("标签", self.labels.len()),
            ("分段", self.plans.len()),
            ("放置区间", self.placements.len()),
        ] {
            if count != batch {
                return Err(HushError::ShapeMismatch(format!(
                    "{name}数量 {count} 与批大小 {batch} 不一致"
                )));
            }
        }
        for (b, (plan, placement)) in self.plans.iter().zip(self.placements).enumerate() {
            plan.validate(len)
                .map_err(|e| HushError::ShapeMismatch(format!("第 {b} 个样本: {e}")))?;
            if placement.end > len {
                return Err(HushError::ShapeMismatch(format!(
                    "第 {b} 个样本的放置区间 {placement} 超出波形长度 {len}"
                )));
            }
        }
        Ok(())
    }
}

/// 攻击结果
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    /// 扰动后的波形 `[B, L]`
    pub perturbed: Array2<f32>,
    /// 扰动量 `perturbed - audio`
    pub eta: Array2<f32>,
    /// 最后一次计算梯度时的批平均损失, 未迭代时为 `None`
    pub final_loss: Option<f32>,
    /// 因梯度出现非有限值而跳过的分段步数
    pub skipped_segments: usize,
}

/// 分段 min-min 符号梯度搜索
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentedMinMinAttack {
    num_steps: usize,
}

impl SegmentedMinMinAttack {
    /// 创建, `num_steps` 为每批迭代次数
    pub fn new(num_steps: usize) -> Self {
        Self { num_steps }
    }

    /// 每批迭代次数
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// 对一个批次执行搜索
    ///
    /// 分类器参数必须处于冻结状态, 搜索期间不会修改分类器.
    pub fn run<C: Classifier + ?Sized>(
        &self,
        model: &C,
        batch: &AttackBatch<'_>,
    ) -> HushResult<AttackOutcome> {
        if model.requires_grad() {
            return Err(HushError::InvalidArgument(
                "扰动搜索要求分类器参数处于冻结状态".into(),
            ));
        }
        batch.validate()?;

        let original = batch.audio;
        let mut perturbed = &original + &batch.init_noise;
        for (b, row) in perturbed.axis_iter_mut(Axis(0)).enumerate() {
            project_row(
                row,
                original.row(b),
                batch.plans[b].segments(),
                batch.placements[b],
            );
        }

        let mut final_loss = None;
        let mut skipped_segments = 0;
        for step in 0..self.num_steps {
            let (loss, grad) = model.loss_and_input_grad(perturbed.view(), batch.labels)?;
            if !loss.is_finite() {
                return Err(HushError::NonFiniteLoss {
                    phase: "attack",
                    value: loss,
                });
            }
            if grad.dim() != perturbed.dim() {
                return Err(HushError::ShapeMismatch(format!(
                    "输入梯度形状 {:?} 与输入形状 {:?} 不一致",
                    grad.dim(),
                    perturbed.dim()
                )));
            }
            final_loss = Some(loss);
            trace!("扰动搜索 step {step}: loss={loss:.6}");

            for (b, row) in perturbed.axis_iter_mut(Axis(0)).enumerate() {
                skipped_segments += sign_step_row(
                    row,
                    original.row(b),
                    grad.row(b),
                    batch.plans[b].segments(),
                    batch.placements[b],
                );
            }
        }
        if skipped_segments > 0 {
            debug!("扰动搜索跳过了 {skipped_segments} 个梯度非有限的分段步");
        }

        let eta = &perturbed - &original;
        Ok(AttackOutcome {
            perturbed,
            eta,
            final_loss,
            skipped_segments,
        })
    }
}

/// 符号函数, 0 映射为 0
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// 将单个采样投影回约束集合
fn project(value: f32, original: f32, epsilon: f32, active: bool) -> f32 {
    let delta = if active {
        (value - original).clamp(-epsilon, epsilon)
    } else {
        0.0
    };
    (original + delta).clamp(-1.0, 1.0)
}

fn project_row(
    mut row: ArrayViewMut1<'_, f32>,
    original: ArrayView1<'_, f32>,
    segments: &[SegmentPrecomputed],
    placement: Placement,
) {
    for seg in segments {
        for i in seg.range() {
            row[i] = project(row[i], original[i], seg.epsilon, placement.contains(i));
        }
    }
}

/// 对一行做一次分段符号梯度步, 返回跳过的分段数
fn sign_step_row(
    mut row: ArrayViewMut1<'_, f32>,
    original: ArrayView1<'_, f32>,
    grad: ArrayView1<'_, f32>,
    segments: &[SegmentPrecomputed],
    placement: Placement,
) -> usize {
    let mut skipped = 0;
    for seg in segments {
        if seg.range().any(|i| !grad[i].is_finite()) {
            skipped += 1;
            continue;
        }
        for i in seg.range() {
            let stepped = row[i] - seg.step_size * sign(grad[i]);
            row[i] = project(stepped, original[i], seg.epsilon, placement.contains(i));
        }
    }
    skipped
}
