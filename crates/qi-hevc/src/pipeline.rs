//! 两阶段解码流水线.
//!
//! 显式状态机串起编译与两个硬件阶段: 编译完的作业经 [`Pipeline::trigger`]
//! 进入阶段 1 队列, 完成事件 ([`Pipeline::on_phase1_done`] /
//! [`Pipeline::on_phase2_done`]) 驱动状态推进. 两个阶段各自严格串行,
//! 但帧 N 的阶段 2 与帧 N+1 的阶段 1 可以并行, scratch 缓冲组按
//! [`P2BUF_COUNT`] 轮转隔离两者.
//!
//! 背压有两层: 作业池 (编译侧, 池空即拒帧) 与 [`P1BUF_COUNT`] 个
//! 阶段 1 名额 (执行侧, 名额满则暂缓向上游要帧).

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::{error, info, warn};

use qi_core::mem::{DmaAddr, DmaAllocator, GpBuf, align_down, next_size, round_up_size};
use qi_core::{QiError, QiResult};

use crate::auxbuf::AuxPool;
use crate::frame::{self, DecodeState, FrameEnv};
use crate::geometry::GeometryCache;
use crate::job::{JobId, JobPool, JobState};
use crate::params::{DstBuffer, DstFormat, FrameRun, MAX_PIC_SAMPLES, MAX_REFS, SrcBuffer};

/// 同时在阶段 1 侧滞留的作业名额
pub const P1BUF_COUNT: usize = 3;

/// 轮转的 PU/系数 scratch 缓冲组数
pub const P2BUF_COUNT: usize = 3;

/// 阶段 1 状态位: 系数 scratch 耗尽
pub const STATUS_COEFF_EXHAUSTED: u32 = 8;

/// 阶段 1 状态位: PU scratch 耗尽
pub const STATUS_PU_EXHAUSTED: u32 = 16;

/// 尺寸未知时的 scratch 预设宽度
const DEFAULT_PIC_WIDTH: u32 = 1920;

/// 尺寸未知时的 scratch 预设高度
const DEFAULT_PIC_HEIGHT: u32 = 1088;

/// 阶段 1 结束时从硬件读回的三个寄存器
#[derive(Debug, Clone, Copy)]
pub struct HwStatus {
    /// 已执行的命令数 (RPI_CFSTATUS)
    pub cfstatus: u32,
    /// 提交的命令数 (RPI_CFNUM)
    pub cfnum: u32,
    /// 状态寄存器 (RPI_STATUS)
    pub status: u32,
}

/// 阶段 1 的三种结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase1Outcome {
    /// 全部命令执行完毕
    Done,
    /// scratch 耗尽, 扩容后可原样重放 (携带耗尽位)
    Exhausted(u32),
    /// 硬件错误, 本帧作废
    Error,
}

impl HwStatus {
    /// 判定结局: 命令执行计数齐平即成功, 否则按耗尽位区分可恢复与致命
    pub fn outcome(&self) -> Phase1Outcome {
        if self.cfstatus == self.cfnum {
            return Phase1Outcome::Done;
        }
        let bits = self.status & (STATUS_COEFF_EXHAUSTED | STATUS_PU_EXHAUSTED);
        if bits != 0 {
            Phase1Outcome::Exhausted(bits)
        } else {
            Phase1Outcome::Error
        }
    }
}

/// 阶段 1 的一次提交: 寄存器程序镜像 + scratch 写出窗口
#[derive(Debug, Clone)]
pub struct Phase1Setup {
    /// PU 写出基地址
    pub pu_base: DmaAddr,
    /// PU 写出步距
    pub pu_stride: u32,
    /// 系数写出基地址
    pub coeff_base: DmaAddr,
    /// 系数写出步距
    pub coeff_stride: u32,
    /// 命令条数
    pub cmd_count: usize,
    /// 命令 FIFO 的 DMA 镜像 (小端 addr/data 对)
    pub cmds: Bytes,
}

/// 阶段 2 的一次提交: 全部帧级寄存器值
#[derive(Debug, Clone)]
pub struct Phase2Setup {
    /// PU 回读基地址
    pub pu_base: DmaAddr,
    /// PU 回读步距
    pub pu_stride: u32,
    /// 系数回读基地址
    pub coeff_base: DmaAddr,
    /// 系数回读步距
    pub coeff_stride: u32,
    /// 输出亮度基地址
    pub luma_addr: DmaAddr,
    /// 输出亮度步距
    pub luma_stride: u32,
    /// 输出色度基地址
    pub chroma_addr: DmaAddr,
    /// 输出色度步距
    pub chroma_stride: u32,
    /// 参考帧亮度/色度地址表
    pub ref_addrs: [[DmaAddr; 2]; MAX_REFS],
    /// 帧级配置字
    pub config2: u32,
    /// 帧尺寸字
    pub framesize: u32,
    /// 当前帧 POC
    pub currpoc: u32,
    /// 本帧运动矢量写出基地址 (0 表示不写出)
    pub mv_base: DmaAddr,
    /// 运动矢量写出步距
    pub mv_stride: u32,
    /// 同位运动矢量回读基地址 (0 表示无同位参考)
    pub col_base: DmaAddr,
    /// 同位运动矢量回读步距
    pub col_stride: u32,
    /// CTB 行数 (写入后启动)
    pub num_rows: u32,
}

/// 硬件执行引擎: 回放阶段 1 程序, 编程并启动阶段 2
///
/// 实现方负责寄存器编址与地址粒度转换; 完成以调用
/// [`Pipeline::on_phase1_done`] / [`Pipeline::on_phase2_done`] 上报.
pub trait HwEngine: Send + Sync {
    /// 启动阶段 1
    fn phase1_start(&self, setup: &Phase1Setup);
    /// 启动阶段 2
    fn phase2_start(&self, setup: &Phase2Setup);
}

/// 解码结果回收方
pub trait DecodeSink: Send + Sync {
    /// 源码流缓冲用毕
    fn src_done(&self, buf: SrcBuffer, ok: bool);
    /// 目标帧缓冲出队
    fn frame_done(&self, buf: DstBuffer, ok: bool);
    /// 一次提交请求完结
    fn request_done(&self, token: u64);
    /// 阶段 1 名额有空余, 上游可以继续送帧
    fn ready_for_more(&self);
}

/// 捕获队列中的一个缓冲
#[derive(Debug, Clone, Copy)]
pub struct CaptureBuffer {
    /// 槽位号
    pub index: u32,
    /// 各平面基地址
    pub plane_addrs: [DmaAddr; 2],
}

/// 捕获队列视图: 按时间戳解析参考帧缓冲
pub trait CaptureQueue: Send + Sync {
    /// 查找持有该时间戳的缓冲
    fn find_buffer(&self, timestamp: u64) -> Option<CaptureBuffer>;
}

/// 两阶段解码流水线
pub struct Pipeline {
    cache: GeometryCache,
    state: DecodeState,
    jobs: JobPool,
    aux: AuxPool,

    alloc: Arc<dyn DmaAllocator>,
    engine: Arc<dyn HwEngine>,
    sink: Arc<dyn DecodeSink>,
    capture: Arc<dyn CaptureQueue>,
    dst_fmt: DstFormat,

    /// 轮转的 PU scratch 组
    pu_bufs: [Option<GpBuf>; P2BUF_COUNT],
    /// 轮转的系数 scratch 组
    coeff_bufs: [Option<GpBuf>; P2BUF_COUNT],
    /// 下一次阶段 1 使用的 scratch 组号
    p2idx: usize,
    /// 被阶段 1/2 占用的 scratch 组数
    scratch_in_use: usize,

    /// 阶段 1 侧滞留的作业数 (触发起到阶段 1 结束)
    p1out: u32,

    /// 编译完成、等待触发的作业
    dec0: Option<JobId>,
    p1_queue: VecDeque<JobId>,
    p1_active: Option<JobId>,
    p2_queue: VecDeque<JobId>,
    p2_active: Option<JobId>,

    /// scratch 扩容双重失败后置位, 实例作废
    fatal_err: bool,
}

impl Pipeline {
    /// 创建流水线并预分配 scratch 缓冲
    ///
    /// `width`/`height` 只用于 scratch 的初始档位, 可传 0 取预设值;
    /// 之后按耗尽反馈扩容.
    pub fn new(
        alloc: Arc<dyn DmaAllocator>,
        engine: Arc<dyn HwEngine>,
        sink: Arc<dyn DecodeSink>,
        capture: Arc<dyn CaptureQueue>,
        dst_fmt: DstFormat,
        width: u32,
        height: u32,
    ) -> QiResult<Self> {
        let w = if width == 0 { DEFAULT_PIC_WIDTH } else { width.min(MAX_PIC_SAMPLES) };
        let h = if height == 0 { DEFAULT_PIC_HEIGHT } else { height.min(MAX_PIC_SAMPLES) };
        let coeff_size = round_up_size((w * h) as usize);
        let pu_size = round_up_size((w * h / 4) as usize);

        let mut pu_bufs: [Option<GpBuf>; P2BUF_COUNT] = [None; P2BUF_COUNT];
        let mut coeff_bufs: [Option<GpBuf>; P2BUF_COUNT] = [None; P2BUF_COUNT];
        let mut failed = None;
        for i in 0..P2BUF_COUNT {
            match alloc.alloc(pu_size) {
                Ok(b) => pu_bufs[i] = Some(b),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
            match alloc.alloc(coeff_size) {
                Ok(b) => coeff_bufs[i] = Some(b),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            for buf in pu_bufs.iter_mut().chain(coeff_bufs.iter_mut()) {
                if let Some(b) = buf.take() {
                    alloc.free(b);
                }
            }
            return Err(e);
        }

        Ok(Self {
            cache: GeometryCache::new(),
            state: DecodeState::default(),
            jobs: JobPool::new(),
            aux: AuxPool::new(),
            alloc,
            engine,
            sink,
            capture,
            dst_fmt,
            pu_bufs,
            coeff_bufs,
            p2idx: 0,
            scratch_in_use: 0,
            p1out: 0,
            dec0: None,
            p1_queue: VecDeque::new(),
            p1_active: None,
            p2_queue: VecDeque::new(),
            p2_active: None,
            fatal_err: false,
        })
    }

    /// 编译一帧, 结果暂存待 [`trigger`](Self::trigger)
    ///
    /// 池空返回 [`QiError::Again`] (背压); 帧级错误同样暂存,
    /// 触发时统一走错误收尾, 保持缓冲归还顺序一致.
    pub fn setup_frame(&mut self, run: &FrameRun) -> QiResult<()> {
        if self.fatal_err {
            return Err(QiError::Fatal("scratch 扩容失败后实例已作废".into()));
        }
        if let Some(id) = self.dec0.take() {
            // 上一帧编译完从未被触发, 协议错乱, 中止它
            warn!("HEVC: 上一帧从未被触发, 先行中止");
            if let Some(job) = self.jobs.get_mut(id) {
                job.state = JobState::ErrorDone;
            }
            self.abort_job(id);
        }

        let mut env = FrameEnv {
            cache: &mut self.cache,
            jobs: &mut self.jobs,
            aux: &self.aux,
            alloc: &*self.alloc,
            capture: &*self.capture,
            dst_fmt: &self.dst_fmt,
            state: &mut self.state,
        };
        let id = frame::setup_frame(&mut env, run)?;
        self.dec0 = Some(id);
        Ok(())
    }

    /// 把暂存的帧送入阶段 1 队列 (对应一次提交请求的放行)
    pub fn trigger(&mut self) {
        let Some(id) = self.dec0.take() else {
            warn!("HEVC: 触发时没有待执行的帧");
            return;
        };

        if self.jobs.get(id).map(|j| j.state) != Some(JobState::Phase1) {
            self.abort_job(id);
            return;
        }

        self.p1out += 1;
        if self.p1out < P1BUF_COUNT as u32 {
            self.sink.ready_for_more();
        }
        self.p1_queue.push_back(id);
        self.pump_phase1();
    }

    /// 阶段 1 完成事件
    pub fn on_phase1_done(&mut self, status: &HwStatus) {
        let Some(id) = self.p1_active.take() else {
            warn!("HEVC: 阶段 1 完成事件没有对应的作业");
            return;
        };
        if let Some(job) = self.jobs.get_mut(id) {
            job.p1_status = status.status;
        }

        match status.outcome() {
            Phase1Outcome::Done => {
                if let Some(job) = self.jobs.get_mut(id) {
                    if let Some(src) = job.src_buf.take() {
                        self.sink.src_done(src, true);
                    }
                }
                self.p2idx = (self.p2idx + 1) % P2BUF_COUNT;
                self.p1out -= 1;
                if self.p1out >= P1BUF_COUNT as u32 - 1 {
                    self.sink.ready_for_more();
                }
                self.p2_queue.push_back(id);
                self.pump_phase2();
                self.pump_phase1();
            }
            Phase1Outcome::Exhausted(bits) => match self.grow_scratch(bits) {
                Ok(()) => {
                    // 扩容后原样重放同一寄存器程序
                    self.p1_active = Some(id);
                    self.phase1_submit(id);
                }
                Err(e) => {
                    error!("HEVC: scratch 扩容失败: {e}");
                    if self.pu_bufs[self.p2idx].is_none() || self.coeff_bufs[self.p2idx].is_none()
                    {
                        // 旧缓冲已释放且新分配失败, 无法继续解码
                        self.fatal_err = true;
                    }
                    self.err_fin(id);
                }
            },
            Phase1Outcome::Error => {
                error!(
                    "HEVC: 阶段 1 硬件错误, 状态 {:#x}, 命令 {}/{}",
                    status.status, status.cfstatus, status.cfnum
                );
                self.err_fin(id);
            }
        }
    }

    /// 阶段 2 完成事件
    pub fn on_phase2_done(&mut self) {
        let Some(id) = self.p2_active.take() else {
            warn!("HEVC: 阶段 2 完成事件没有对应的作业");
            return;
        };
        if let Some(job) = self.jobs.get_mut(id) {
            if let Some(dst) = job.frame_buf.take() {
                self.sink.frame_done(dst, true);
            }
            if let Some(token) = job.req_token.take() {
                self.sink.request_done(token);
            }
        }
        self.release_job(id);
        self.scratch_in_use -= 1;
        self.pump_phase2();
        self.pump_phase1();
    }

    /// 中止全部在途作业并释放所有缓冲
    ///
    /// 必须在硬件已静默 (没有未上报的完成事件) 后调用.
    pub fn stop(&mut self) {
        if let Some(id) = self.dec0.take() {
            self.abort_job(id);
        }
        if let Some(id) = self.p1_active.take() {
            self.abort_job(id);
        }
        while let Some(id) = self.p1_queue.pop_front() {
            self.abort_job(id);
        }
        if let Some(id) = self.p2_active.take() {
            self.abort_job(id);
        }
        while let Some(id) = self.p2_queue.pop_front() {
            self.abort_job(id);
        }
        self.p1out = 0;
        self.scratch_in_use = 0;

        for slot in self.state.ref_aux.iter_mut() {
            self.aux.release(slot);
        }
        self.aux.release(&mut self.state.frame_aux);
        if let Err(e) = self.aux.uninit(&*self.alloc) {
            warn!("HEVC: {e}");
        }

        for slot in self.pu_bufs.iter_mut().chain(self.coeff_bufs.iter_mut()) {
            if let Some(buf) = slot.take() {
                self.alloc.free(buf);
            }
        }
    }

    /// 空闲作业数 (上游可据此预判背压)
    pub fn free_jobs(&self) -> usize {
        self.jobs.free_count()
    }

    fn pump_phase1(&mut self) {
        if self.p1_active.is_some() || self.scratch_in_use >= P2BUF_COUNT {
            return;
        }
        let Some(id) = self.p1_queue.pop_front() else {
            return;
        };
        self.scratch_in_use += 1;
        self.p1_active = Some(id);
        self.phase1_submit(id);
    }

    fn phase1_submit(&mut self, id: JobId) {
        let (Some(pu), Some(coeff)) = (self.pu_bufs[self.p2idx], self.coeff_bufs[self.p2idx])
        else {
            error!("HEVC: scratch 组 {} 不可用", self.p2idx);
            self.err_fin(id);
            return;
        };

        let setup = {
            let Some(job) = self.jobs.get_mut(id) else {
                error!("HEVC: 阶段 1 提交时作业句柄失效");
                return;
            };
            let rows = job.pic_height_in_ctbs_y as usize;
            job.pu_base = pu.addr;
            job.pu_stride = align_down(pu.size / rows, 64) as u32;
            job.coeff_base = coeff.addr;
            job.coeff_stride = align_down(coeff.size / rows, 64) as u32;
            Phase1Setup {
                pu_base: job.pu_base,
                pu_stride: job.pu_stride,
                coeff_base: job.coeff_base,
                coeff_stride: job.coeff_stride,
                cmd_count: job.cmds.len(),
                cmds: job.cmds.to_dma_image(),
            }
        };
        self.engine.phase1_start(&setup);
    }

    fn pump_phase2(&mut self) {
        if self.p2_active.is_some() {
            return;
        }
        let Some(id) = self.p2_queue.pop_front() else {
            return;
        };
        self.p2_active = Some(id);
        self.phase2_submit(id);
    }

    fn phase2_submit(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(id) else {
            error!("HEVC: 阶段 2 提交时作业句柄失效");
            return;
        };
        let mv_base = job.frame_aux.as_ref().map_or(0, |h| self.aux.addr_of(h));
        let col_base = job.col_aux.as_ref().map_or(0, |h| self.aux.addr_of(h));
        let setup = Phase2Setup {
            pu_base: job.pu_base,
            pu_stride: job.pu_stride,
            coeff_base: job.coeff_base,
            coeff_stride: job.coeff_stride,
            luma_addr: job.frame_luma_addr,
            luma_stride: job.luma_stride,
            chroma_addr: job.frame_chroma_addr,
            chroma_stride: job.chroma_stride,
            ref_addrs: job.ref_addrs,
            config2: job.cfg_config2,
            framesize: job.cfg_framesize,
            currpoc: job.cfg_currpoc,
            mv_base,
            mv_stride: self.state.colmv_stride,
            col_base,
            col_stride: self.state.colmv_stride,
            num_rows: job.pic_height_in_ctbs_y,
        };
        self.engine.phase2_start(&setup);
    }

    /// 按耗尽位把对应 scratch 扩到下一档位
    fn grow_scratch(&mut self, bits: u32) -> QiResult<()> {
        if bits & STATUS_PU_EXHAUSTED != 0 {
            let slot = &mut self.pu_bufs[self.p2idx];
            let cur = slot.map_or(0, |b| b.size);
            let want = next_size(cur);
            info!("HEVC: PU scratch 耗尽, 从 {cur} 扩容到 {want}");
            qi_core::mem::realloc_new(&*self.alloc, slot, want)?;
        }
        if bits & STATUS_COEFF_EXHAUSTED != 0 {
            let slot = &mut self.coeff_bufs[self.p2idx];
            let cur = slot.map_or(0, |b| b.size);
            let want = next_size(cur);
            info!("HEVC: 系数 scratch 耗尽, 从 {cur} 扩容到 {want}");
            qi_core::mem::realloc_new(&*self.alloc, slot, want)?;
        }
        Ok(())
    }

    /// 阶段 1 路径上的错误收尾 (额外归还名额与 scratch 组)
    fn err_fin(&mut self, id: JobId) {
        self.abort_job(id);
        self.p1out = self.p1out.saturating_sub(1);
        if self.p1out >= P1BUF_COUNT as u32 - 1 {
            self.sink.ready_for_more();
        }
        self.scratch_in_use = self.scratch_in_use.saturating_sub(1);
        self.pump_phase1();
    }

    /// 以错误状态归还作业的全部缓冲并收回作业
    fn abort_job(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(id) {
            if let Some(src) = job.src_buf.take() {
                self.sink.src_done(src, false);
            }
            if let Some(dst) = job.frame_buf.take() {
                self.sink.frame_done(dst, false);
            }
            if let Some(token) = job.req_token.take() {
                self.sink.request_done(token);
            }
        }
        self.release_job(id);
    }

    fn release_job(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(id) {
            self.aux.release(&mut job.frame_aux);
            self.aux.release(&mut job.col_aux);
        }
        self.jobs.release(id);
    }
}
