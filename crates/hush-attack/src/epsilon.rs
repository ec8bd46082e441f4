//! 分段 epsilon 调度.
//!
//! 波形按固定长度切分为连续分段 (末段可能较短), 每段根据平均绝对幅度
//! 从固定的分档表中取一个相对最大 epsilon 的比例: 越响的分段允许越大的噪声.

use std::ops::Range;

use hush_core::{HushError, HushResult};
use log::debug;
use rayon::prelude::*;

/// 幅度分档: (平均幅度严格下界, epsilon 比例), 按下界降序排列
pub const EPSILON_BANDS: [(f32, f32); 5] = [
    (0.10, 1.0),
    (0.08, 0.538),
    (0.05, 0.3077),
    (0.03, 0.1538),
    (0.01, 0.0769),
];

/// 平均幅度不超过 0.01 的分段使用的比例
pub const QUIET_FRACTION: f32 = 0.0385;

/// 平均幅度对应的 epsilon 比例
pub fn band_fraction(mean_amplitude: f32) -> f32 {
    EPSILON_BANDS
        .iter()
        .find(|(lower, _)| mean_amplitude > *lower)
        .map_or(QUIET_FRACTION, |&(_, fraction)| fraction)
}

/// 将 `[0, audio_len)` 切成长度为 `segment_size` 的连续区间, 末段截断
pub fn segment_ranges(audio_len: usize, segment_size: usize) -> Vec<Range<usize>> {
    if segment_size == 0 {
        return Vec::new();
    }
    (0..audio_len.div_ceil(segment_size))
        .map(|i| {
            let start = i * segment_size;
            start..(start + segment_size).min(audio_len)
        })
        .collect()
}

/// 单个分段的预计算值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPrecomputed {
    /// 该段允许的最大绝对扰动
    pub epsilon: f32,
    /// 每步符号梯度的步长
    pub step_size: f32,
    /// 起始下标 (含)
    pub start: usize,
    /// 结束下标 (不含)
    pub end: usize,
    /// 原始波形在该段的平均绝对幅度
    pub mean_amplitude: f32,
}

impl SegmentPrecomputed {
    /// 分段长度
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// 是否为空分段
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 分段区间
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// 一个样本的全部分段, 按时间顺序排列
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentPlan {
    segments: Vec<SegmentPrecomputed>,
}

impl SegmentPlan {
    /// 由分段列表构造, 不做校验
    pub fn new(segments: Vec<SegmentPrecomputed>) -> Self {
        Self { segments }
    }

    /// 分段列表
    pub fn segments(&self) -> &[SegmentPrecomputed] {
        &self.segments
    }

    /// 分段数
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// 是否没有分段
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// 校验分段恰好一次、连续地覆盖 `[0, audio_len)`
    pub fn validate(&self, audio_len: usize) -> HushResult<()> {
        let mut cursor = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.start != cursor || seg.end <= seg.start {
                return Err(HushError::ShapeMismatch(format!(
                    "第 {i} 段 [{}, {}) 与预期起点 {cursor} 不连续",
                    seg.start, seg.end
                )));
            }
            cursor = seg.end;
        }
        if cursor != audio_len {
            return Err(HushError::ShapeMismatch(format!(
                "分段覆盖到 {cursor}, 波形长度为 {audio_len}"
            )));
        }
        Ok(())
    }

    /// 下标所在分段的 epsilon
    pub fn epsilon_at(&self, index: usize) -> Option<f32> {
        self.segments
            .iter()
            .find(|s| s.range().contains(&index))
            .map(|s| s.epsilon)
    }
}

/// 分段 epsilon 调度器
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentEpsilonScheduler {
    max_epsilon: f32,
    step_size_factor: f32,
    segment_size: usize,
}

impl SegmentEpsilonScheduler {
    /// 创建调度器
    pub fn new(max_epsilon: f32, step_size_factor: f32, segment_size: usize) -> HushResult<Self> {
        if !(max_epsilon.is_finite() && max_epsilon > 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "max_epsilon 必须为正有限值, 实际 {max_epsilon}"
            )));
        }
        if !(step_size_factor.is_finite() && step_size_factor > 0.0) {
            return Err(HushError::InvalidArgument(format!(
                "step_size_factor 必须为正有限值, 实际 {step_size_factor}"
            )));
        }
        if segment_size == 0 {
            return Err(HushError::InvalidArgument("segment_size 不能为 0".into()));
        }
        Ok(Self {
            max_epsilon,
            step_size_factor,
            segment_size,
        })
    }

    /// 全局最大 epsilon
    pub fn max_epsilon(&self) -> f32 {
        self.max_epsilon
    }

    /// 分段长度
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// 平均幅度对应的 epsilon
    pub fn epsilon_for(&self, mean_amplitude: f32) -> f32 {
        self.max_epsilon * band_fraction(mean_amplitude)
    }

    /// 返回 `(epsilon, step_size, mean_amplitude)`
    pub fn bound_for(&self, segment: &[f32]) -> (f32, f32, f32) {
        let mean_amplitude = if segment.is_empty() {
            0.0
        } else {
            (segment.iter().map(|&v| f64::from(v.abs())).sum::<f64>() / segment.len() as f64)
                as f32
        };
        let epsilon = self.epsilon_for(mean_amplitude);
        (epsilon, epsilon / self.step_size_factor, mean_amplitude)
    }

    /// 为一条波形计算全部分段
    pub fn plan(&self, waveform: &[f32]) -> SegmentPlan {
        let segments = segment_ranges(waveform.len(), self.segment_size)
            .into_iter()
            .map(|range| {
                let (epsilon, step_size, mean_amplitude) = self.bound_for(&waveform[range.clone()]);
                SegmentPrecomputed {
                    epsilon,
                    step_size,
                    start: range.start,
                    end: range.end,
                    mean_amplitude,
                }
            })
            .collect();
        SegmentPlan::new(segments)
    }

    /// 并行为多条波形计算分段, 结果顺序与输入一致
    pub fn plan_all<W>(&self, waveforms: &[W]) -> Vec<SegmentPlan>
    where
        W: AsRef<[f32]> + Sync,
    {
        let plans: Vec<SegmentPlan> = waveforms
            .par_iter()
            .map(|w| self.plan(w.as_ref()))
            .collect();
        debug!(
            "完成 {} 条波形的分段预计算 (segment_size={})",
            plans.len(),
            self.segment_size
        );
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_分档表() {
        let cases = [
            (0.5, 1.0),
            (0.1001, 1.0),
            (0.10, 0.538),
            (0.09, 0.538),
            (0.08, 0.3077),
            (0.06, 0.3077),
            (0.05, 0.1538),
            (0.04, 0.1538),
            (0.03, 0.0769),
            (0.02, 0.0769),
            (0.01, 0.0385),
            (0.0, 0.0385),
        ];
        for (amp, fraction) in cases {
            assert_eq!(band_fraction(amp), fraction, "amp={amp}");
        }
    }

    #[test]
    fn test_epsilon_单调不减() {
        let sched = SegmentEpsilonScheduler::new(0.13, 25.0, 1000).unwrap();
        let mut prev = 0.0;
        for i in 0..=300 {
            let amp = i as f32 * 0.001;
            let eps = sched.epsilon_for(amp);
            assert!(eps >= prev, "amp={amp} eps={eps} prev={prev}");
            // 纯函数: 同样的输入得到同样的输出
            assert_eq!(eps, sched.epsilon_for(amp));
            prev = eps;
        }
    }

    #[test]
    fn test_分段划分_100_40() {
        let ranges = segment_ranges(100, 40);
        assert_eq!(ranges, vec![0..40, 40..80, 80..100]);
    }

    #[test]
    fn test_分段恰好覆盖一次() {
        for (len, size) in [(16000, 1000), (16000, 999), (7, 3), (5, 10), (1, 1)] {
            let ranges = segment_ranges(len, size);
            let count = len.div_ceil(size);
            assert_eq!(ranges.len(), count);
            let mut cursor = 0;
            for r in &ranges {
                assert_eq!(r.start, cursor);
                cursor = r.end;
            }
            assert_eq!(cursor, len);
            let last = ranges.last().unwrap();
            assert_eq!(last.len(), len - size * (count - 1));
        }
        assert!(segment_ranges(0, 10).is_empty());
    }

    #[test]
    fn test_具体场景_第二段幅度_0_02() {
        let mut waveform = vec![0.2f32; 100];
        for v in &mut waveform[40..80] {
            *v = 0.02;
        }
        let sched = SegmentEpsilonScheduler::new(0.1, 25.0, 40).unwrap();
        let plan = sched.plan(&waveform);
        assert_eq!(plan.len(), 3);
        plan.validate(100).unwrap();

        let seg = plan.segments()[1];
        assert_eq!((seg.start, seg.end), (40, 80));
        assert!((seg.mean_amplitude - 0.02).abs() < 1e-6);
        assert!((seg.epsilon - 0.00769).abs() < 1e-7);
        assert!((seg.step_size - 0.00769 / 25.0).abs() < 1e-8);
        assert_eq!(plan.segments()[2].len(), 20);
        assert_eq!(plan.epsilon_at(85), Some(0.1));
        assert_eq!(plan.epsilon_at(100), None);
    }

    #[test]
    fn test_负幅度取绝对值() {
        let sched = SegmentEpsilonScheduler::new(1.0, 10.0, 4).unwrap();
        let (eps, step, amp) = sched.bound_for(&[-0.2, 0.2, -0.2, 0.2]);
        assert!((amp - 0.2).abs() < 1e-6);
        assert_eq!(eps, 1.0);
        assert!((step - 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_非法参数() {
        assert!(SegmentEpsilonScheduler::new(0.0, 25.0, 10).is_err());
        assert!(SegmentEpsilonScheduler::new(0.1, 0.0, 10).is_err());
        assert!(SegmentEpsilonScheduler::new(0.1, 25.0, 0).is_err());
        assert!(SegmentEpsilonScheduler::new(f32::NAN, 25.0, 10).is_err());
    }

    #[test]
    fn test_校验发现缺口与越界() {
        let seg = |start, end| SegmentPrecomputed {
            epsilon: 0.1,
            step_size: 0.01,
            start,
            end,
            mean_amplitude: 0.0,
        };
        assert!(SegmentPlan::new(vec![seg(0, 40), seg(41, 100)]).validate(100).is_err());
        assert!(SegmentPlan::new(vec![seg(0, 40), seg(40, 90)]).validate(100).is_err());
        assert!(SegmentPlan::new(vec![seg(0, 40), seg(40, 100)]).validate(100).is_ok());
    }

    #[test]
    fn test_并行预计算保持顺序() {
        let sched = SegmentEpsilonScheduler::new(0.1, 25.0, 10).unwrap();
        let waveforms: Vec<Vec<f32>> = (0..32).map(|i| vec![i as f32 * 0.005; 25]).collect();
        let plans = sched.plan_all(&waveforms);
        assert_eq!(plans.len(), 32);
        for (w, p) in waveforms.iter().zip(&plans) {
            assert_eq!(*p, sched.plan(w));
        }
    }
}
