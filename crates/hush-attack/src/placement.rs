//! 噪声放置.
//!
//! 噪声向量可能比波形短, 放置决定它落在波形的哪个区间.

use std::fmt;
use std::str::FromStr;

use hush_core::{HushError, HushResult, Placement};
use rand::Rng;

/// 放置模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementMode {
    /// 居中放置
    #[default]
    Center,
    /// 在合法范围内均匀随机
    Random,
}

impl PlacementMode {
    /// 配置文件和命令行使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Center => "center",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementMode {
    type Err = HushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "center" => Ok(Self::Center),
            "random" => Ok(Self::Random),
            other => Err(HushError::InvalidPlacementMode(other.to_string())),
        }
    }
}

/// 计算长度为 `noise_len` 的噪声在长度为 `waveform_len` 的波形中的区间
///
/// 噪声不能长于波形. 长度相等时区间恒为 `[0, L)`, 不消耗随机数.
pub fn placement_for<R: Rng + ?Sized>(
    noise_len: usize,
    waveform_len: usize,
    mode: PlacementMode,
    rng: &mut R,
) -> HushResult<Placement> {
    if noise_len > waveform_len {
        return Err(HushError::ShapeMismatch(format!(
            "噪声长度 {noise_len} 超过波形长度 {waveform_len}"
        )));
    }
    let slack = waveform_len - noise_len;
    let start = match mode {
        _ if slack == 0 => 0,
        PlacementMode::Center => slack / 2,
        PlacementMode::Random => rng.gen_range(0..slack),
    };
    Ok(Placement::new(start, start + noise_len))
}

/// 将噪声放入全零掩码, 返回 `(mask, placement)`, 掩码长度为 `waveform_len`
pub fn place_noise<R: Rng + ?Sized>(
    noise: &[f32],
    waveform_len: usize,
    mode: PlacementMode,
    rng: &mut R,
) -> HushResult<(Vec<f32>, Placement)> {
    let placement = placement_for(noise.len(), waveform_len, mode, rng)?;
    let mut mask = vec![0.0f32; waveform_len];
    mask[placement.range()].copy_from_slice(noise);
    Ok((mask, placement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_居中放置_20_100() {
        let mut rng = StdRng::seed_from_u64(0);
        let noise = vec![0.5f32; 20];
        let (mask, placement) = place_noise(&noise, 100, PlacementMode::Center, &mut rng).unwrap();
        assert_eq!(placement, Placement::new(40, 60));
        assert_eq!(mask.len(), 100);
        assert!(mask[..40].iter().all(|&v| v == 0.0));
        assert!(mask[40..60].iter().all(|&v| v == 0.5));
        assert!(mask[60..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_等长时起点为零() {
        let mut rng = StdRng::seed_from_u64(0);
        for mode in [PlacementMode::Center, PlacementMode::Random] {
            let p = placement_for(64, 64, mode, &mut rng).unwrap();
            assert_eq!(p, Placement::new(0, 64));
        }
    }

    #[test]
    fn test_随机放置在合法范围内() {
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..200 {
            let p = placement_for(30, 100, PlacementMode::Random, &mut rng).unwrap();
            assert!(p.start < 70);
            assert_eq!(p.len(), 30);
            assert!(p.end <= 100);
        }
    }

    #[test]
    fn test_随机放置可复现() {
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..10)
                .map(|_| placement_for(10, 50, PlacementMode::Random, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(8), draw(8));
    }

    #[test]
    fn test_噪声过长() {
        let mut rng = StdRng::seed_from_u64(0);
        let result = placement_for(101, 100, PlacementMode::Center, &mut rng);
        assert!(matches!(result, Err(HushError::ShapeMismatch(_))));
    }

    #[test]
    fn test_解析模式() {
        assert_eq!("center".parse::<PlacementMode>().unwrap(), PlacementMode::Center);
        assert_eq!("random".parse::<PlacementMode>().unwrap(), PlacementMode::Random);
        let err = "foo".parse::<PlacementMode>().unwrap_err();
        assert!(matches!(err, HushError::InvalidPlacementMode(ref m) if m == "foo"));
        assert_eq!(PlacementMode::Random.to_string(), "random");
    }
}
