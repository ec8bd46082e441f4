//! Adam 优化器.
//!
//! 更新规则:
//! ```text
//! g   = grad + weight_decay * param          (L2 正则, 加在梯度上)
//! m_t = β₁ * m_{t-1} + (1 - β₁) * g
//! v_t = β₂ * v_{t-1} + (1 - β₂) * g²
//! m̂_t = m_t / (1 - β₁ᵗ)
//! v̂_t = v_t / (1 - β₂ᵗ)
//! param = param - lr * m̂_t / (√v̂_t + ε)
//! ```

use hush_core::{HushError, HushResult};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};

/// Adam 优化器, 按参数顺序维护一阶/二阶矩
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    /// 一阶矩估计
    m: Vec<ArrayD<f32>>,
    /// 二阶矩估计
    v: Vec<ArrayD<f32>>,
    /// 已执行的步数, 用于偏差校正
    t: u32,
}

impl Adam {
    /// 以默认超参数创建 (β₁=0.9, β₂=0.999, ε=1e-8, 无权重衰减)
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// 设置 β 参数
    pub fn betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// 设置 L2 权重衰减
    pub fn weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// 当前学习率
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// 修改学习率
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// 已执行的更新步数
    pub fn steps(&self) -> u32 {
        self.t
    }

    /// 对一组参数执行一次更新
    ///
    /// `params` 与 `grads` 按位置一一对应, 顺序在多次调用之间必须保持一致.
    pub fn step(
        &mut self,
        params: &mut [ArrayViewMutD<'_, f32>],
        grads: &[ArrayViewD<'_, f32>],
    ) -> HushResult<()> {
        if params.len() != grads.len() {
            return Err(HushError::ShapeMismatch(format!(
                "参数 {} 组, 梯度 {} 组",
                params.len(),
                grads.len()
            )));
        }
        for (i, (p, g)) in params.iter().zip(grads).enumerate() {
            if p.shape() != g.shape() {
                return Err(HushError::ShapeMismatch(format!(
                    "第 {i} 组参数形状 {:?} 与梯度形状 {:?} 不一致",
                    p.shape(),
                    g.shape()
                )));
            }
        }

        let layout_changed = self.m.len() != params.len()
            || self.m.iter().zip(params.iter()).any(|(m, p)| m.shape() != p.shape());
        if layout_changed {
            self.m = params.iter().map(|p| ArrayD::zeros(p.raw_dim())).collect();
            self.v = params.iter().map(|p| ArrayD::zeros(p.raw_dim())).collect();
            self.t = 0;
        }

        self.t += 1;
        let t = self.t as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);
        let (lr, beta1, beta2, eps, wd) =
            (self.lr, self.beta1, self.beta2, self.eps, self.weight_decay);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let m = &mut self.m[i];
            let v = &mut self.v[i];
            Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    let g = g + wd * *p;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias_correction1;
                    let v_hat = *v / bias_correction2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    #[test]
    fn test_adam_首步按符号移动_lr() {
        // 偏差校正后第一步的更新量约等于 lr * sign(grad)
        let mut p = array![1.0f32, -1.0, 0.5];
        let g = array![0.3f32, -2.0, 0.0];
        let mut opt = Adam::new(0.1);
        opt.step(&mut [p.view_mut().into_dyn()], &[g.view().into_dyn()])
            .unwrap();
        assert!((p[0] - 0.9).abs() < 1e-4);
        assert!((p[1] - (-0.9)).abs() < 1e-4);
        assert!((p[2] - 0.5).abs() < 1e-6);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_adam_最小化二次函数() {
        // f(x) = (x - 3)^2
        let mut x = Array1::from_elem(1, 0.0f32);
        let mut opt = Adam::new(0.1);
        for _ in 0..500 {
            let g = x.mapv(|v| 2.0 * (v - 3.0));
            opt.step(&mut [x.view_mut().into_dyn()], &[g.view().into_dyn()])
                .unwrap();
        }
        assert!((x[0] - 3.0).abs() < 0.05, "x = {}", x[0]);
    }

    #[test]
    fn test_adam_形状不一致() {
        let mut p = array![1.0f32, 2.0];
        let g = array![1.0f32];
        let mut opt = Adam::new(0.1).weight_decay(1e-4).betas(0.9, 0.99);
        let result = opt.step(&mut [p.view_mut().into_dyn()], &[g.view().into_dyn()]);
        assert!(matches!(result, Err(HushError::ShapeMismatch(_))));
    }
}
