//! 样本标识与噪声放置区间.

use std::fmt;
use std::ops::Range;

/// 样本在数据集中的稳定下标
///
/// 加载时分配, 此后在每个批次中显式携带, 噪声仓库按此寻址.
pub type SampleId = usize;

/// 噪声在波形中占据的半开区间 `[start, end)`
///
/// 每个样本在生成开始前计算一次, 之后只有区间内的噪声取值会变化.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    /// 起始下标 (含)
    pub start: usize,
    /// 结束下标 (不含)
    pub end: usize,
}

impl Placement {
    /// 创建放置区间, `end` 小于 `start` 时交换顺序
    pub fn new(start: usize, end: usize) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    /// 覆盖整段波形的区间
    pub fn full(waveform_len: usize) -> Self {
        Self::new(0, waveform_len)
    }

    /// 区间长度 (即噪声长度)
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// 是否为空区间
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 下标是否落在区间内
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    /// 转为标准库区间
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
