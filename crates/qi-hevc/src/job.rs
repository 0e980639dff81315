//! 解码作业与作业池.
//!
//! 一个 [`DecodeJob`] 是一帧的可变工作单元: 命令 FIFO、slice 消息缓冲、
//! 平坦缩放因子表、入口点尾部状态、参考/输出地址与辅助缓冲引用.
//! 作业从固定大小的池中取出, 仅在两个硬件阶段都结束或作业被中止后归还;
//! 硬件阶段持有期间绝不回收.

use qi_core::mem::DmaAddr;

use crate::auxbuf::AuxRef;
use crate::params::{DstBuffer, MAX_REFS, SrcBuffer};
use crate::probs::NUM_SCALING_FACTORS;
use crate::regs::CmdFifo;

/// 作业池容量
pub const DEC_JOB_COUNT: usize = 3;

/// slice 消息缓冲上限: 2 × 参考数 × 8 条因子消息 + 3 条配置消息
pub const SLICE_MSGS_MAX: usize = 2 * MAX_REFS * 8 + 3;

/// "无需同位参考"哨兵
pub const DPB_NO_COL: u32 = u32::MAX;

/// 作业状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// 编译中 (帧起始)
    SliceStart,
    /// 编译完成, 待/在阶段 1 执行
    Phase1,
    /// 编译或执行失败, 等待错误收尾
    ErrorDone,
    /// 已结束, 在空闲链上
    End,
}

/// 一帧的解码作业 ("解码环境")
#[derive(Debug)]
pub struct DecodeJob {
    /// 当前状态
    pub state: JobState,
    /// 池内序号 (日志用)
    pub decode_order: u32,
    /// 阶段 1 返回的状态位 (决定扩容哪个 scratch 池)
    pub p1_status: u32,

    /// 命令 FIFO
    pub cmds: CmdFifo,

    /// 帧宽 (CTB 单位)
    pub pic_width_in_ctbs_y: u32,
    /// 帧高 (CTB 单位)
    pub pic_height_in_ctbs_y: u32,
    /// 同位参考的 DPB 条目号; [`DPB_NO_COL`] 表示无需
    pub dpbno_col: u32,
    /// SLICESTART 寄存器映像 (依赖性 slice 沿用上一独立 slice 的值)
    pub reg_slicestart: u32,

    /// 最近一个入口点的 CTB 列
    pub entry_ctb_x: u32,
    /// 最近一个入口点的 CTB 行
    pub entry_ctb_y: u32,
    /// 最近一个入口点的瓦片列
    pub entry_tile_x: u32,
    /// 最近一个入口点的瓦片行
    pub entry_tile_y: u32,
    /// 最近一个入口点的 QP (补尾时沿用)
    pub entry_qp: u32,
    /// 最近一个入口点的 slice 常量字
    pub entry_slice: u32,

    /// 帧级配置字 (阶段 2)
    pub cfg_config2: u32,
    /// 帧尺寸字 (阶段 2)
    pub cfg_framesize: u32,
    /// 当前帧 POC (阶段 2)
    pub cfg_currpoc: u32,

    /// 从提交方接管的源缓冲
    pub src_buf: Option<SrcBuffer>,
    /// 从提交方接管的目标缓冲
    pub frame_buf: Option<DstBuffer>,
    /// 外部完成令牌
    pub req_token: Option<u64>,

    /// 输出亮度基地址
    pub frame_luma_addr: DmaAddr,
    /// 输出色度基地址
    pub frame_chroma_addr: DmaAddr,
    /// 亮度步距
    pub luma_stride: u32,
    /// 色度步距
    pub chroma_stride: u32,
    /// 各参考帧的亮度/色度地址
    pub ref_addrs: [[DmaAddr; 2]; MAX_REFS],

    /// 本帧自己的运动矢量缓冲
    pub frame_aux: Option<AuxRef>,
    /// 同位参考的运动矢量缓冲
    pub col_aux: Option<AuxRef>,

    /// PU scratch 基地址 (本次提交使用的)
    pub pu_base: DmaAddr,
    /// PU scratch 步距
    pub pu_stride: u32,
    /// 系数 scratch 基地址
    pub coeff_base: DmaAddr,
    /// 系数 scratch 步距
    pub coeff_stride: u32,

    /// slice 消息缓冲
    pub slice_msgs: [u16; SLICE_MSGS_MAX],
    /// 已写入的 slice 消息数
    pub num_slice_msgs: usize,
    /// 展开后的平坦缩放因子表
    pub scaling_factors: Box<[u8; NUM_SCALING_FACTORS]>,
}

impl DecodeJob {
    fn new(decode_order: u32) -> Self {
        Self {
            state: JobState::End,
            decode_order,
            p1_status: 0,
            cmds: CmdFifo::new(),
            pic_width_in_ctbs_y: 0,
            pic_height_in_ctbs_y: 0,
            dpbno_col: DPB_NO_COL,
            reg_slicestart: 0,
            entry_ctb_x: 0,
            entry_ctb_y: 0,
            entry_tile_x: 0,
            entry_tile_y: 0,
            entry_qp: 0,
            entry_slice: 0,
            cfg_config2: 0,
            cfg_framesize: 0,
            cfg_currpoc: 0,
            src_buf: None,
            frame_buf: None,
            req_token: None,
            frame_luma_addr: 0,
            frame_chroma_addr: 0,
            luma_stride: 0,
            chroma_stride: 0,
            ref_addrs: [[0; 2]; MAX_REFS],
            frame_aux: None,
            col_aux: None,
            pu_base: 0,
            pu_stride: 0,
            coeff_base: 0,
            coeff_stride: 0,
            slice_msgs: [0; SLICE_MSGS_MAX],
            num_slice_msgs: 0,
            scaling_factors: Box::new([0; NUM_SCALING_FACTORS]),
        }
    }

    /// 追加一条 slice 消息; 超限是编程错误而非运行时条件
    pub fn msg_slice(&mut self, msg: u16) {
        self.slice_msgs[self.num_slice_msgs] = msg;
        self.num_slice_msgs += 1;
    }

    /// 复用前重置每帧状态 (保留 FIFO 容量与缩放表存储)
    fn reset(&mut self) {
        self.state = JobState::SliceStart;
        self.p1_status = 0;
        self.cmds.clear();
        self.dpbno_col = DPB_NO_COL;
        self.reg_slicestart = 0;
        self.entry_ctb_x = 0;
        self.entry_ctb_y = 0;
        self.entry_tile_x = 0;
        self.entry_tile_y = 0;
        self.entry_qp = 0;
        self.entry_slice = 0;
        self.num_slice_msgs = 0;
        self.src_buf = None;
        self.frame_buf = None;
        self.req_token = None;
        debug_assert!(self.frame_aux.is_none() && self.col_aux.is_none());
    }
}

/// 作业句柄 (代际校验的池下标)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobId {
    index: usize,
    generation: u32,
}

/// 固定大小的作业池
///
/// 不变式: 空闲链可达的作业集合与已取出的作业集合互斥,
/// 且并集恒等于整个池.
#[derive(Debug)]
pub struct JobPool {
    jobs: Vec<DecodeJob>,
    generations: Vec<u32>,
    free: Vec<usize>,
}

impl Default for JobPool {
    fn default() -> Self {
        Self::new()
    }
}

impl JobPool {
    /// 创建满池
    pub fn new() -> Self {
        let jobs = (0..DEC_JOB_COUNT).map(|i| DecodeJob::new(i as u32)).collect();
        Self {
            jobs,
            generations: vec![0; DEC_JOB_COUNT],
            free: (0..DEC_JOB_COUNT).rev().collect(),
        }
    }

    /// 取出一个空闲作业; 池空即背压信号, 调用方应拒绝本帧
    pub fn acquire(&mut self) -> Option<JobId> {
        let index = self.free.pop()?;
        self.jobs[index].reset();
        Some(JobId {
            index,
            generation: self.generations[index],
        })
    }

    /// 按句柄访问已取出的作业
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut DecodeJob> {
        if self.generations.get(id.index) != Some(&id.generation) {
            return None;
        }
        Some(&mut self.jobs[id.index])
    }

    /// 只读访问
    pub fn get(&self, id: JobId) -> Option<&DecodeJob> {
        if self.generations.get(id.index) != Some(&id.generation) {
            return None;
        }
        Some(&self.jobs[id.index])
    }

    /// 归还作业 (代际加一, 残留句柄随即失效)
    pub fn release(&mut self, id: JobId) {
        if self.generations.get(id.index) != Some(&id.generation) {
            return;
        }
        debug_assert!(!self.free.contains(&id.index), "重复归还");
        self.jobs[id.index].state = JobState::End;
        self.generations[id.index] = self.generations[id.index].wrapping_add(1);
        self.free.push(id.index);
    }

    /// 空闲作业数
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_disjointness() {
        let mut pool = JobPool::new();
        let mut held = Vec::new();
        for _ in 0..DEC_JOB_COUNT {
            held.push(pool.acquire().expect("池未满时必须可取"));
        }
        assert!(pool.acquire().is_none(), "池空时必须返回背压信号");
        assert_eq!(pool.free_count(), 0);

        for id in held {
            pool.release(id);
        }
        assert_eq!(pool.free_count(), DEC_JOB_COUNT, "归还后池应恢复满额");
    }

    #[test]
    fn test_stale_job_id_rejected() {
        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        pool.release(id);
        assert!(pool.get_mut(id).is_none(), "过期句柄必须被代际校验拦下");
        pool.release(id); // 重复归还应被忽略
        assert_eq!(pool.free_count(), DEC_JOB_COUNT);
    }

    #[test]
    fn test_acquire_resets_job() {
        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        {
            let job = pool.get_mut(id).unwrap();
            job.cmds.write(0x100, 1);
            job.msg_slice(7);
            job.dpbno_col = 3;
        }
        pool.release(id);

        // 池只有一个空闲时循环取到同一槽位
        let mut ids = Vec::new();
        for _ in 0..DEC_JOB_COUNT {
            ids.push(pool.acquire().unwrap());
        }
        let reused = ids
            .iter()
            .find_map(|&i| {
                let job = pool.get(i)?;
                (job.cmds.is_empty() && job.num_slice_msgs == 0).then_some(i)
            })
            .unwrap();
        let job = pool.get(reused).unwrap();
        assert_eq!(job.dpbno_col, DPB_NO_COL);
        assert_eq!(job.state, JobState::SliceStart);
    }
}
