//! 时域运动矢量辅助缓冲池.
//!
//! 每个输出缓冲槽位至多对应一个存活的辅助缓冲, 由产出帧的作业与所有把
//! 该帧当作同位参考的后续作业共享. 引用计数在池锁内修改, "减一并可能
//! 归还"是单个原子操作, 避免双重释放; 背后 DMA 内存的分配发生在锁外,
//! 不让慢分配阻塞并发的作业提交.

use std::sync::Mutex;

use log::{error, warn};

use qi_core::mem::{DmaAddr, DmaAllocator, GpBuf, align_up};
use qi_core::{QiError, QiResult};

/// 辅助缓冲池可索引的最大槽位数 (与捕获队列深度上限一致)
pub const AUX_SLOT_COUNT: usize = 32;

/// 无效槽位号
const NO_SLOT: u32 = u32::MAX;

/// 同位运动矢量存储的步距 (64 字节对齐的亮度宽)
pub fn colmv_stride(pic_width: u32) -> usize {
    align_up(pic_width as usize, 64)
}

/// 一帧同位运动矢量存储的字节数
pub fn colmv_picsize(pic_width: u32, pic_height: u32) -> usize {
    colmv_stride(pic_width) * (align_up(pic_height as usize, 64) >> 4)
}

/// 辅助缓冲句柄 (代际校验的竞技场下标)
///
/// 非 `Copy`: 每个句柄对应一份引用计数, 只能通过 [`AuxPool::release`]
/// 归还或通过 [`AuxPool::ref_of`] 复制.
#[derive(Debug, PartialEq, Eq)]
pub struct AuxRef {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct AuxSlot {
    refcount: u32,
    generation: u32,
    q_index: u32,
    col: GpBuf,
}

#[derive(Debug, Default)]
struct AuxInner {
    /// 竞技场: 所有曾分配过的缓冲
    arena: Vec<AuxSlot>,
    /// 空闲竞技场下标
    free: Vec<usize>,
    /// 槽位号 → 竞技场下标
    ents: [Option<usize>; AUX_SLOT_COUNT],
}

impl AuxInner {
    fn check(&self, h: &AuxRef) -> Option<usize> {
        let slot = self.arena.get(h.index)?;
        if slot.generation != h.generation {
            error!("HEVC: 过期的辅助缓冲句柄 (槽位已被回收复用)");
            return None;
        }
        Some(h.index)
    }
}

/// 引用计数的辅助缓冲池
#[derive(Debug, Default)]
pub struct AuxPool {
    inner: Mutex<AuxInner>,
}

impl AuxPool {
    /// 创建空池
    pub fn new() -> Self {
        Self::default()
    }

    /// 按槽位号获取或创建辅助缓冲
    ///
    /// 槽位已有存活缓冲时直接增加引用 (流水线中的复用自会理顺);
    /// 否则优先从空闲链取, 都没有才走分配器 (在锁外).
    pub fn acquire(
        &self,
        q_index: u32,
        picsize: usize,
        alloc: &dyn DmaAllocator,
    ) -> QiResult<AuxRef> {
        debug_assert!((q_index as usize) < AUX_SLOT_COUNT);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(idx) = inner.ents[q_index as usize] {
                let slot = &mut inner.arena[idx];
                slot.refcount += 1;
                return Ok(AuxRef {
                    index: idx,
                    generation: slot.generation,
                });
            }
            if let Some(idx) = inner.free.pop() {
                let slot = &mut inner.arena[idx];
                slot.refcount = 1;
                slot.q_index = q_index;
                let generation = slot.generation;
                inner.ents[q_index as usize] = Some(idx);
                return Ok(AuxRef {
                    index: idx,
                    generation,
                });
            }
        }

        // 锁外分配新的背后内存
        let col = alloc.alloc(picsize)?;

        let mut inner = self.inner.lock().unwrap();
        let idx = inner.arena.len();
        inner.arena.push(AuxSlot {
            refcount: 1,
            generation: 0,
            q_index,
            col,
        });
        inner.ents[q_index as usize] = Some(idx);
        Ok(AuxRef {
            index: idx,
            generation: 0,
        })
    }

    /// 按槽位号取已有缓冲的新引用; 槽位为空时返回 `None`
    pub fn ref_idx(&self, q_index: u32) -> Option<AuxRef> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.ents[q_index as usize]?;
        let slot = &mut inner.arena[idx];
        slot.refcount += 1;
        Some(AuxRef {
            index: idx,
            generation: slot.generation,
        })
    }

    /// 复制一个已持有的引用
    pub fn ref_of(&self, h: &AuxRef) -> Option<AuxRef> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.check(h)?;
        inner.arena[idx].refcount += 1;
        Some(AuxRef {
            index: idx,
            generation: h.generation,
        })
    }

    /// 归还一个引用, 并总是清空调用方的句柄
    ///
    /// 计数归零时清除槽位映射并把缓冲挂回空闲链 (代际加一,
    /// 之后任何残留句柄都会被识别为过期).
    pub fn release(&self, h: &mut Option<AuxRef>) {
        let Some(handle) = h.take() else {
            return;
        };

        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.check(&handle) else {
            return;
        };
        let slot = &mut inner.arena[idx];
        slot.refcount -= 1;
        if slot.refcount == 0 {
            let q = slot.q_index;
            slot.q_index = NO_SLOT;
            slot.generation = slot.generation.wrapping_add(1);
            inner.ents[q as usize] = None;
            inner.free.push(idx);
        }
    }

    /// 已持有缓冲的 DMA 地址
    pub fn addr_of(&self, h: &AuxRef) -> DmaAddr {
        let inner = self.inner.lock().unwrap();
        match inner.check(h) {
            Some(idx) => inner.arena[idx].col.addr,
            None => 0,
        }
    }

    /// 已持有缓冲的容量
    pub fn size_of(&self, h: &AuxRef) -> usize {
        let inner = self.inner.lock().unwrap();
        match inner.check(h) {
            Some(idx) => inner.arena[idx].col.size,
            None => 0,
        }
    }

    /// 释放全部空闲缓冲的背后内存
    ///
    /// 必须在所有作业与 DPB 引用都归还之后调用, 仍被持有的缓冲会被
    /// 告警并泄漏 (而不是悬空).
    pub fn uninit(&self, alloc: &dyn DmaAllocator) -> QiResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let live = inner
            .arena
            .iter()
            .filter(|s| s.q_index != NO_SLOT)
            .count();
        if live != 0 {
            warn!("HEVC: 辅助缓冲池销毁时仍有 {live} 个存活缓冲");
            return Err(QiError::Internal(format!("辅助缓冲池仍有 {live} 个存活缓冲")));
        }
        for slot in inner.arena.drain(..) {
            alloc.free(slot.col);
        }
        inner.free.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 计数分配器
    #[derive(Default)]
    struct CountingAlloc {
        allocs: AtomicUsize,
        frees: AtomicUsize,
    }

    impl DmaAllocator for CountingAlloc {
        fn alloc(&self, size: usize) -> QiResult<GpBuf> {
            let n = self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(GpBuf {
                addr: 0x10000 + (n as DmaAddr) * 0x1000,
                size,
            })
        }

        fn free(&self, _buf: GpBuf) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_colmv_sizing() {
        assert_eq!(colmv_stride(1920), 1920);
        assert_eq!(colmv_stride(1910), 1920);
        // 1088 对齐后 >>4 = 68 行
        assert_eq!(colmv_picsize(1920, 1080), 1920 * 68);
    }

    #[test]
    fn test_refcount_lifecycle() {
        let alloc = CountingAlloc::default();
        let pool = AuxPool::new();

        let a = pool.acquire(3, 4096, &alloc).unwrap();
        assert_eq!(alloc.allocs.load(Ordering::SeqCst), 1);

        // 同槽位再取: 共享同一缓冲, 不再分配
        let b = pool.ref_idx(3).unwrap();
        assert_eq!(pool.addr_of(&a), pool.addr_of(&b));
        assert_eq!(alloc.allocs.load(Ordering::SeqCst), 1);

        let mut a = Some(a);
        pool.release(&mut a);
        assert!(a.is_none(), "释放后调用方句柄必须清空");
        // 仍有引用: 槽位保持存活
        let mut probe = pool.ref_idx(3);
        assert!(probe.is_some());
        pool.release(&mut probe);

        let mut b = Some(b);
        pool.release(&mut b);
        let mut c = pool.ref_idx(3);
        pool.release(&mut c);
        // 计数归零: 槽位清空
        assert!(pool.ref_idx(3).is_none(), "计数归零后槽位应清空");
    }

    #[test]
    fn test_free_list_reuse_without_alloc() {
        let alloc = CountingAlloc::default();
        let pool = AuxPool::new();

        let mut a = Some(pool.acquire(1, 4096, &alloc).unwrap());
        pool.release(&mut a);
        // 换一个槽位: 应复用空闲缓冲而不是再分配
        let _b = pool.acquire(7, 4096, &alloc).unwrap();
        assert_eq!(alloc.allocs.load(Ordering::SeqCst), 1, "应复用空闲缓冲");
    }

    #[test]
    fn test_stale_handle_rejected() {
        let alloc = CountingAlloc::default();
        let pool = AuxPool::new();

        let a = pool.acquire(1, 4096, &alloc).unwrap();
        let stale = AuxRef {
            index: a.index,
            generation: a.generation,
        };
        let mut a = Some(a);
        pool.release(&mut a);

        // 缓冲已回收, 残留句柄必须被代际校验拦下
        let _b = pool.acquire(2, 4096, &alloc).unwrap();
        assert!(pool.ref_of(&stale).is_none(), "过期句柄不应可用");
    }

    #[test]
    fn test_release_is_idempotent_via_none() {
        let pool = AuxPool::new();
        let mut empty: Option<AuxRef> = None;
        pool.release(&mut empty);
        assert!(empty.is_none());
    }

    #[test]
    fn test_uninit_refuses_live_buffers() {
        let alloc = CountingAlloc::default();
        let pool = AuxPool::new();
        let a = pool.acquire(0, 4096, &alloc).unwrap();
        assert!(pool.uninit(&alloc).is_err(), "存活缓冲未归还时不应销毁");
        let mut a = Some(a);
        pool.release(&mut a);
        pool.uninit(&alloc).unwrap();
        assert_eq!(alloc.frees.load(Ordering::SeqCst), 1);
    }
}
