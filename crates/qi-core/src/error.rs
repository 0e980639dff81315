//! 统一错误类型定义.
//!
//! 所有 Qi crate 共用的错误类型, 支持跨模块传播.

use thiserror::Error;

/// Qi 框架统一错误类型
#[derive(Debug, Error)]
pub enum QiError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作或码流特性
    #[error("不支持: {0}")]
    Unsupported(String),

    /// 无效数据 (损坏或不一致的帧参数等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 内存分配失败
    #[error("内存分配失败: {0}")]
    OutOfMemory(String),

    /// 资源暂时不可用, 调用方应稍后重试 (背压信号)
    #[error("资源忙, 请稍后重试")]
    Again,

    /// 解码器实例已进入致命错误状态, 需要外部重新初始化
    #[error("解码器致命错误: {0}")]
    Fatal(String),

    /// 硬件报告的解码错误
    #[error("硬件解码错误: 状态 {0:#x}")]
    Hardware(u32),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// Qi 框架统一 Result 类型
pub type QiResult<T> = Result<T, QiError>;
