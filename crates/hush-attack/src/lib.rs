//! # hush-attack
//!
//! hush 扰动搜索层: 在冻结的分类器上寻找让损失最小的有界噪声.
//!
//! - [`SegmentEpsilonScheduler`]: 按分段平均幅度决定扰动上限与步长
//! - [`PlacementMode`] / [`place_noise`]: 短噪声在长波形中的放置
//! - [`SegmentedMinMinAttack`]: 分段符号梯度下降与三重投影
//!
//! ## 使用示例
//!
//! ```rust
//! use hush_attack::SegmentEpsilonScheduler;
//!
//! let sched = SegmentEpsilonScheduler::new(0.1, 25.0, 40).unwrap();
//! let plan = sched.plan(&[0.2; 100]);
//! assert_eq!(plan.len(), 3);
//! assert_eq!(plan.segments()[0].epsilon, 0.1);
//! ```

pub mod epsilon;
pub mod minmin;
pub mod placement;

pub use epsilon::{
    SegmentEpsilonScheduler, SegmentPlan, SegmentPrecomputed, band_fraction, segment_ranges,
};
pub use minmin::{AttackBatch, AttackOutcome, SegmentedMinMinAttack};
pub use placement::{PlacementMode, place_noise, placement_for};
