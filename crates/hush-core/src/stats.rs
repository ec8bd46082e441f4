//! 流式加权平均与最大值统计.

/// 跨批次累计某个标量指标的加权平均、当前值与最大值
///
/// 评估阶段分别用于损失和误分类率.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    /// 最近一次更新的值
    val: f64,
    /// 加权和
    sum: f64,
    /// 累计权重
    count: f64,
    /// 加权平均
    avg: f64,
    /// 观测到的最大值 (重置后为 0)
    max: f64,
}

impl RunningStats {
    /// 创建全零统计量
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有字段清零
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 以权重 `weight` 累计一个观测值
    pub fn update(&mut self, value: f64, weight: f64) {
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
        if self.count > 0.0 {
            self.avg = self.sum / self.count;
        }
        self.max = self.max.max(value);
    }

    /// 最近一次的值
    pub fn val(&self) -> f64 {
        self.val
    }

    /// 加权和
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// 累计权重
    pub fn count(&self) -> f64 {
        self.count
    }

    /// 加权平均, 未更新过时为 0
    pub fn avg(&self) -> f64 {
        self.avg
    }

    /// 最大值
    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_加权平均() {
        let mut stats = RunningStats::new();
        stats.update(1.0, 2.0);
        stats.update(4.0, 1.0);
        assert!((stats.avg() - 2.0).abs() < 1e-12);
        assert_eq!(stats.sum(), 6.0);
        assert_eq!(stats.count(), 3.0);
        assert_eq!(stats.val(), 4.0);
        assert_eq!(stats.max(), 4.0);
    }

    #[test]
    fn test_最大值不回退() {
        let mut stats = RunningStats::new();
        stats.update(0.7, 1.0);
        stats.update(0.2, 1.0);
        assert_eq!(stats.max(), 0.7);
        assert_eq!(stats.val(), 0.2);
    }

    #[test]
    fn test_重置() {
        let mut stats = RunningStats::new();
        stats.update(3.0, 5.0);
        stats.reset();
        assert_eq!(stats, RunningStats::new());
        assert_eq!(stats.avg(), 0.0);
    }

    #[test]
    fn test_零权重不产生_nan() {
        let mut stats = RunningStats::new();
        stats.update(1.0, 0.0);
        assert_eq!(stats.avg(), 0.0);
        assert!(!stats.avg().is_nan());
    }
}
