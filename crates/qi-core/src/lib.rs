//! # qi-core
//!
//! Qi 硬件解码框架核心库, 提供统一错误类型与 DMA 内存抽象.
//!
//! 本 crate 是 qi 各 crate 的底层基础设施: 解码器 crate 只依赖这里定义的
//! 分配器接口与错误类型, 不直接接触任何平台相关的内存映射细节.

pub mod error;
pub mod mem;

// 重导出常用类型
pub use error::{QiError, QiResult};
pub use mem::{DmaAddr, DmaAllocator, GpBuf};
