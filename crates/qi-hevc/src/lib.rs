//! # qi-hevc
//!
//! HEVC (H.265) 硬件解码命令编译器与两阶段作业流水线.
//!
//! 本 crate 不做任何像素重建或熵解码: 它把一帧已解析好的流参数与有序的
//! slice 头列表, 编译成驱动定点解码引擎的寄存器程序 (地址/数据对序列),
//! 并管理该程序在两个硬件阶段上的异步执行:
//!
//! - **阶段 1**: 执行命令 FIFO, 完成熵解码与系数/PU 中间数据写出;
//!   scratch 缓冲耗尽时按档位扩容并原样重新提交.
//! - **阶段 2**: 编程输出/参考地址与运动矢量缓冲, 完成目标帧.
//!
//! 编译路径 (几何缓存 → 入口点编译 → slice 命令发射) 是纯 CPU 工作,
//! 在提交线程上同步完成; 硬件执行通过 [`pipeline::HwEngine`] /
//! [`pipeline::DecodeSink`] 接口与外部执行引擎交互.

pub mod auxbuf;
pub mod entry;
pub mod frame;
pub mod geometry;
pub mod job;
pub mod params;
pub mod pipeline;
pub mod probs;
pub mod regs;
pub mod slice;

// 重导出常用类型
pub use geometry::{Geometry, GeometryCache};
pub use job::{DecodeJob, JobId, JobPool};
pub use params::{DecodeParams, Pps, ScalingMatrix, SliceParams, Sps};
pub use pipeline::{CaptureQueue, DecodeSink, HwEngine, HwStatus, Pipeline};
pub use regs::{Cmd, CmdFifo};
