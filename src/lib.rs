//! # Qi (器)
//!
//! 纯 Rust 实现的硬件视频解码命令编译与执行框架.
//!
//! Qi 面向无状态 (stateless) 硬件解码器: 码流解析与参数集管理由上层
//! 完成, Qi 把每一帧的结构化参数编译成硬件寄存器程序, 并管理程序在
//! 多阶段解码引擎上的异步执行、缓冲轮转与背压.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use qi::hevc::params::{Sps, validate_sps};
//!
//! let sps = Sps {
//!     pic_width_in_luma_samples: 1920,
//!     pic_height_in_luma_samples: 1080,
//!     chroma_format_idc: 1,
//!     log2_diff_max_min_luma_coding_block_size: 3,
//!     ..Sps::default()
//! };
//! validate_sps(&sps, None).expect("硬件支持 1080p 4:2:0");
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `qi-core` | 核心类型: 错误、DMA 内存工具 |
//! | `qi-hevc` | HEVC 命令编译器与两阶段流水线 |

/// 核心类型与工具
pub use qi_core as core;

/// HEVC 命令编译器与两阶段流水线
pub use qi_hevc as hevc;

/// 获取 Qi 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
