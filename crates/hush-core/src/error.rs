//! 统一错误类型定义.
//!
//! 所有 hush crate 共用的错误类型, 支持跨模块传播.

use thiserror::Error;

/// hush 统一错误类型
#[derive(Debug, Error)]
pub enum HushError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 无法识别的噪声放置模式
    #[error("无效的噪声放置模式: '{0}' (可选: center, random)")]
    InvalidPlacementMode(String),

    /// 张量/分段形状不一致
    #[error("形状不匹配: {0}")]
    ShapeMismatch(String),

    /// 前向或反向过程中出现 NaN/Inf 损失, 不可恢复
    #[error("{phase} 阶段出现非有限损失: {value}")]
    NonFiniteLoss {
        /// 出错的阶段 (train / attack / eval)
        phase: &'static str,
        /// 损失值
        value: f32,
    },

    /// 在训练会话之外尝试更新参数
    #[error("模型参数已冻结, 必须在训练会话中更新")]
    ParamsFrozen,

    /// 无效数据 (损坏的 WAV / 噪声文件 / 配置)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 不支持的操作或编码
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// hush 统一 Result 类型
pub type HushResult<T> = Result<T, HushError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_非有限损失的错误信息() {
        let err = HushError::NonFiniteLoss {
            phase: "attack",
            value: f32::NAN,
        };
        let msg = err.to_string();
        assert!(msg.contains("attack"));
        assert!(msg.contains("NaN"));
    }

    #[test]
    fn test_io_错误自动转换() {
        fn open_missing() -> HushResult<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here.wav")?)
        }
        assert!(matches!(open_missing(), Err(HushError::Io(_))));
    }
}
