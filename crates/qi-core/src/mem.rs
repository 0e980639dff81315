//! DMA 内存抽象.
//!
//! 解码器只通过 `DmaAllocator` 接口获取硬件可见内存, 具体的平台分配原语
//! (CMA、IOMMU 映射等) 由外部协作层实现. 这里同时提供 scratch 缓冲的
//! 档位取整与"释放后重分配"语义.

use log::warn;

use crate::error::{QiError, QiResult};

/// DMA 总线地址
pub type DmaAddr = u64;

/// 一段硬件可见的 DMA 内存
///
/// 只记录总线地址与长度, 不持有 CPU 侧映射. 归还必须通过同一个分配器.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpBuf {
    /// 总线地址
    pub addr: DmaAddr,
    /// 字节长度
    pub size: usize,
}

/// DMA 分配器接口
///
/// 由外部平台层实现. 分配可能较慢, 调用方不得在持锁状态下调用.
pub trait DmaAllocator: Send + Sync {
    /// 分配一段至少 `size` 字节的 DMA 内存
    fn alloc(&self, size: usize) -> QiResult<GpBuf>;

    /// 归还一段 DMA 内存
    fn free(&self, buf: GpBuf);
}

/// 向上对齐到 `align` 的整数倍 (align 必须为 2 的幂)
pub const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// 向下对齐到 `align` 的整数倍 (align 必须为 2 的幂)
pub const fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// scratch 缓冲允许的最小档位
const MIN_GP_SIZE: usize = 256;

/// 将长度向上取整到允许的缓冲档位
///
/// 档位为 2^n 或 3·2^(n-1), 即 256, 384, 512, 768, 1024, ... 这样每次
/// 扩容最多浪费 1/3 容量, 同时扩容序列保持有界.
pub fn round_up_size(x: usize) -> usize {
    if x <= MIN_GP_SIZE {
        return MIN_GP_SIZE;
    }
    let n = usize::BITS - 1 - x.leading_zeros();
    let p = 1usize << n;
    if x == p {
        p
    } else if x <= p + (p >> 1) {
        p + (p >> 1)
    } else {
        p << 1
    }
}

/// 下一个严格更大的缓冲档位 (scratch 耗尽后的扩容目标)
pub fn next_size(x: usize) -> usize {
    round_up_size(x + 1)
}

/// 释放后按新档位重分配, 不保留内容
///
/// 新分配失败时尝试按原长度恢复; 若恢复也失败, `slot` 置空, 调用方必须
/// 视之为致命错误 (原有数据与容量都已丢失).
pub fn realloc_new(
    alloc: &dyn DmaAllocator,
    slot: &mut Option<GpBuf>,
    size: usize,
) -> QiResult<()> {
    let old_size = match *slot {
        Some(buf) => {
            if buf.size == size {
                return Ok(());
            }
            alloc.free(buf);
            buf.size
        }
        None => 0,
    };
    *slot = None;

    match alloc.alloc(size) {
        Ok(buf) => {
            *slot = Some(buf);
            Ok(())
        }
        Err(_) => {
            if old_size != 0 {
                match alloc.alloc(old_size) {
                    Ok(buf) => *slot = Some(buf),
                    Err(_) => warn!("HEVC: scratch 原档位 {old_size:#x} 恢复失败"),
                }
            }
            Err(QiError::OutOfMemory(format!("scratch 扩容到 {size:#x} 失败")))
        }
    }
}
