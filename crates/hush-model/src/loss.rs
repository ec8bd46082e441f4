//! 交叉熵损失及其梯度.
//!
//! 分类器输出为 log 概率, 对 log 概率再做一次 log-softmax 结果不变,
//! 因此这里的交叉熵就是对 log 概率取负对数似然.

use hush_core::{HushError, HushResult};
use ndarray::{Array2, ArrayView2, Axis};

/// 按行计算 log-softmax, 减去行最大值保证数值稳定
pub fn log_softmax(logits: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        row.mapv_inplace(|v| (v - max) - log_sum);
    }
    out
}

/// 批平均交叉熵
pub fn cross_entropy(log_probs: ArrayView2<'_, f32>, labels: &[usize]) -> HushResult<f32> {
    check_labels(log_probs, labels)?;
    let batch = labels.len();
    if batch == 0 {
        return Ok(0.0);
    }
    let total: f32 = labels
        .iter()
        .enumerate()
        .map(|(b, &label)| -log_probs[[b, label]])
        .sum();
    Ok(total / batch as f32)
}

/// 批平均交叉熵对 logits 的梯度: `(softmax - onehot) / B`
pub fn cross_entropy_grad(
    log_probs: ArrayView2<'_, f32>,
    labels: &[usize],
) -> HushResult<Array2<f32>> {
    check_labels(log_probs, labels)?;
    let scale = 1.0 / labels.len().max(1) as f32;
    let mut grad = log_probs.mapv(|v| v.exp() * scale);
    for (b, &label) in labels.iter().enumerate() {
        grad[[b, label]] -= scale;
    }
    Ok(grad)
}

/// 统计 argmax 与标签不一致的样本数
pub fn count_errors(log_probs: ArrayView2<'_, f32>, labels: &[usize]) -> HushResult<usize> {
    check_labels(log_probs, labels)?;
    let errors = log_probs
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, label)| argmax(row.iter().copied()) != **label)
        .count();
    Ok(errors)
}

fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

fn check_labels(log_probs: ArrayView2<'_, f32>, labels: &[usize]) -> HushResult<()> {
    let (rows, classes) = log_probs.dim();
    if rows != labels.len() {
        return Err(HushError::ShapeMismatch(format!(
            "输出有 {rows} 行, 标签有 {} 个",
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(HushError::InvalidArgument(format!(
            "标签 {bad} 超出类别数 {classes}"
        )));
    }
    Ok(())
}
