//! 帧级编译: 把一帧的参数与 slice 列表变成完整的解码作业.
//!
//! 这里是提交路径的主干: 校验参数集、更新几何缓存、取作业、逐 slice
//! 编译命令流, 最后解析 DPB 参考地址并迁移辅助缓冲引用. 任何失败都把
//! 本帧标记为错误 (码流层面可以继续), 只有在取得作业之前失败才直接返回.

use log::{error, warn};

use qi_core::mem::DmaAllocator;
use qi_core::{QiError, QiResult};

use crate::auxbuf::{AuxPool, AuxRef, colmv_picsize, colmv_stride};
use crate::entry::{decode_slice, wpp_decode_slice};
use crate::geometry::GeometryCache;
use crate::job::{DPB_NO_COL, JobId, JobPool, JobState};
use crate::params::{
    DstFormat, FrameRun, MAX_REFS, PpsFlags, SliceFlags, SliceType, SpsFlags, validate_pps,
    validate_sps,
};
use crate::pipeline::CaptureQueue;
use crate::probs::populate_scaling_factors;
use crate::slice::{L0, L1, SliceCtx};

/// 跨帧保持的解码状态: 辅助缓冲引用与本序列的运动矢量配置
///
/// DPB 的辅助缓冲引用在这里跨帧持有, 使仍被引用的参考帧的运动矢量
/// 存储不被回收.
#[derive(Debug)]
pub struct DecodeState {
    /// 本帧所有 slice 共用的时域 MVP 开关 (7.4.7.1 要求一致)
    pub slice_temporal_mvp: bool,
    /// 序列可能启用时域 MVP, 需要为参考帧保留辅助缓冲
    pub use_aux: bool,
    /// 本帧需要写出自己的运动矢量
    pub mk_aux: bool,
    /// 同位运动矢量存储步距
    pub colmv_stride: u32,
    /// 一帧同位运动矢量存储的字节数
    pub colmv_picsize: usize,
    /// 各 DPB 条目的辅助缓冲引用
    pub ref_aux: [Option<AuxRef>; MAX_REFS],
    /// 上一帧自己的辅助缓冲 (下一帧开始时或进 DPB 或被释放)
    pub frame_aux: Option<AuxRef>,
}

impl Default for DecodeState {
    fn default() -> Self {
        Self {
            slice_temporal_mvp: false,
            use_aux: false,
            mk_aux: false,
            colmv_stride: 0,
            colmv_picsize: 0,
            ref_aux: std::array::from_fn(|_| None),
            frame_aux: None,
        }
    }
}

/// 帧编译所需的全部协作对象
pub struct FrameEnv<'a> {
    /// 几何缓存
    pub cache: &'a mut GeometryCache,
    /// 作业池
    pub jobs: &'a mut JobPool,
    /// 辅助缓冲池
    pub aux: &'a AuxPool,
    /// DMA 分配器
    pub alloc: &'a dyn DmaAllocator,
    /// 捕获队列 (按时间戳解析参考帧)
    pub capture: &'a dyn CaptureQueue,
    /// 协商好的捕获格式
    pub dst_fmt: &'a DstFormat,
    /// 跨帧解码状态
    pub state: &'a mut DecodeState,
}

/// NAL 单元是否为参考类型 (表 7-1: 1, 3, 5, ..., 15 为真)
pub fn is_ref_unit_type(nal_unit_type: u8) -> bool {
    (nal_unit_type & !0xe) != 0
}

/// 预计算阶段 2 的帧级配置字
fn mk_config2(run: &FrameRun, log2_ctb_size: u32, mk_aux: bool, slice_temporal_mvp: bool) -> u32 {
    let sps = run.sps;
    let pps = run.pps;

    let mut c = u32::from(sps.bit_depth_luma_minus8 + 8);
    c |= u32::from(sps.bit_depth_chroma_minus8 + 8) << 4;
    if sps.bit_depth_luma_minus8 != 0 {
        c |= 1 << 8;
    }
    if sps.bit_depth_chroma_minus8 != 0 {
        c |= 1 << 9;
    }
    c |= log2_ctb_size << 10;
    if pps.flags.contains(PpsFlags::CONSTRAINED_INTRA_PRED) {
        c |= 1 << 13;
    }
    if sps.flags.contains(SpsFlags::STRONG_INTRA_SMOOTHING) {
        c |= 1 << 14;
    }
    if mk_aux {
        // 运动矢量写出到外部存储
        c |= 1 << 15;
    }
    c |= u32::from(pps.log2_parallel_merge_level_minus2 + 2) << 16;
    if slice_temporal_mvp {
        c |= 1 << 19;
    }
    if sps.flags.contains(SpsFlags::PCM_LOOP_FILTER_DISABLED) {
        c |= 1 << 20;
    }
    c |= (u32::from(pps.pps_cb_qp_offset as u8) & 31) << 21;
    c |= (u32::from(pps.pps_cr_qp_offset as u8) & 31) << 26;
    c
}

/// 编译一帧
///
/// 成功取得作业之后的任何失败都把作业置为 [`JobState::ErrorDone`] 并
/// 仍然返回其句柄, 统一由触发路径上报错误; 在那之前的失败直接返回.
pub fn setup_frame(env: &mut FrameEnv, run: &FrameRun) -> QiResult<JobId> {
    validate_sps(run.sps, Some(env.dst_fmt))?;
    validate_pps(run.pps)?;
    env.cache.update(run.sps, run.pps)?;

    let Some(id) = env.jobs.acquire() else {
        error!("HEVC: 作业池已空, 拒绝本帧");
        return Err(QiError::Again);
    };

    if let Err(e) = fill_job(env, id, run) {
        warn!("HEVC: 帧编译失败: {e}");
        if let Some(job) = env.jobs.get_mut(id) {
            job.state = JobState::ErrorDone;
        }
    }
    Ok(id)
}

fn fill_job(env: &mut FrameEnv, id: JobId, run: &FrameRun) -> QiResult<()> {
    let Some(sh0) = run.slices.first() else {
        return Err(QiError::InvalidArgument("本帧没有 slice".into()));
    };
    let Some(geom) = env.cache.geometry() else {
        return Err(QiError::Internal("几何缓存无效".into()));
    };
    let state = &mut *env.state;
    let fmt = env.dst_fmt;
    let Some(job) = env.jobs.get_mut(id) else {
        return Err(QiError::Internal("作业句柄失效".into()));
    };

    // 缓冲立即挂到作业上, 编译失败也经由错误收尾路径归还
    job.src_buf = Some(run.src);
    job.frame_buf = Some(run.dst);
    job.req_token = Some(run.src.request_token);

    job.pic_width_in_ctbs_y = geom.ctb_width;
    job.pic_height_in_ctbs_y = geom.ctb_height;

    // 输出布局
    if fmt.pixelformat.is_multiplane() {
        job.luma_stride = fmt.height * 128;
        job.chroma_stride = job.luma_stride / 2;
        job.frame_luma_addr = run.dst.plane_addrs[0];
        job.frame_chroma_addr = run.dst.plane_addrs[1];
        if run.dst.num_planes != 2 {
            return Err(QiError::InvalidArgument(format!(
                "捕获平面数 ({}) != 2",
                run.dst.num_planes
            )));
        }
        if run.dst.plane_lengths[0] < fmt.sizeimage[0]
            || run.dst.plane_lengths[1] < fmt.sizeimage[1]
        {
            return Err(QiError::InvalidArgument("捕获平面长度不足".into()));
        }
    } else {
        job.luma_stride = fmt.bytesperline * 128;
        job.chroma_stride = job.luma_stride;
        job.frame_luma_addr = run.dst.plane_addrs[0];
        job.frame_chroma_addr = job.frame_luma_addr + u64::from(fmt.height) * 128;
        if run.dst.num_planes != 1 {
            return Err(QiError::InvalidArgument(format!(
                "捕获平面数 ({}) != 1",
                run.dst.num_planes
            )));
        }
        if run.dst.plane_lengths[0] < fmt.sizeimage[0] {
            return Err(QiError::InvalidArgument("捕获平面长度不足".into()));
        }
    }

    // 参考地址先填自己的地址, 即使参考解析出错硬件也拿到合法地址
    for r in job.ref_addrs.iter_mut() {
        r[0] = job.frame_luma_addr;
        r[1] = job.frame_chroma_addr;
    }

    // 时域 MVP 开关对帧内所有 slice 一致 (7.4.7.1), 取首个 slice 的
    state.slice_temporal_mvp = sh0.flags.contains(SliceFlags::TEMPORAL_MVP_ENABLED);
    state.use_aux = run.sps.flags.contains(SpsFlags::SPS_TEMPORAL_MVP_ENABLED);
    state.mk_aux = state.use_aux
        && (run.sps.sps_max_sub_layers_minus1 >= sh0.nuh_temporal_id_plus1
            || is_ref_unit_type(sh0.nal_unit_type));

    // 阶段 2 寄存器预计算
    job.cfg_config2 = mk_config2(run, geom.log2_ctb_size, state.mk_aux, state.slice_temporal_mvp);
    job.cfg_framesize =
        (run.sps.pic_height_in_luma_samples << 16) | run.sps.pic_width_in_luma_samples;
    job.cfg_currpoc = sh0.slice_pic_order_cnt as u32;

    if state.use_aux {
        state.colmv_stride = colmv_stride(run.sps.pic_width_in_luma_samples) as u32;
        state.colmv_picsize = colmv_picsize(
            run.sps.pic_width_in_luma_samples,
            run.sps.pic_height_in_luma_samples,
        );
    }

    if sh0.slice_segment_addr != 0 {
        return Err(QiError::InvalidData(format!(
            "新帧但首 slice 段地址为 {}",
            sh0.slice_segment_addr
        )));
    }
    if run.src.addr == 0 {
        return Err(QiError::InvalidArgument("源缓冲没有 DMA 地址".into()));
    }

    // 逐 slice 编译
    for (i, sh) in run.slices.iter().enumerate() {
        let last_slice = i + 1 == run.slices.len();

        if run.src.bytes_used < sh.bit_size.div_ceil(8) {
            return Err(QiError::InvalidData(format!(
                "slice 位长 {} > 源缓冲已用 {}",
                sh.bit_size, run.src.bytes_used
            )));
        }
        if sh.data_byte_offset >= sh.bit_size / 8 {
            return Err(QiError::InvalidData(format!(
                "slice 位长 {} < 数据偏移 {} × 8",
                sh.bit_size, sh.data_byte_offset
            )));
        }
        if sh.slice_segment_addr >= geom.ctb_size {
            return Err(QiError::InvalidData(format!(
                "slice 段地址 {} 越界",
                sh.slice_segment_addr
            )));
        }

        let slice_qp =
            (26 + i32::from(run.pps.init_qp_minus26) + i32::from(sh.slice_qp_delta)) as u32;
        let max_num_merge_cand = if sh.slice_type == SliceType::I {
            0
        } else {
            5 - u32::from(sh.five_minus_max_num_merge_cand)
        };
        let mut nb_refs = [0u32; 2];
        if sh.slice_type != SliceType::I {
            nb_refs[L0] = u32::from(sh.num_ref_idx_l0_active_minus1) + 1;
        }
        if sh.slice_type == SliceType::B {
            nb_refs[L1] = u32::from(sh.num_ref_idx_l1_active_minus1) + 1;
        }

        if run.sps.flags.contains(SpsFlags::SCALING_LIST_ENABLED) {
            populate_scaling_factors(run.scaling_matrix, &mut job.scaling_factors);
        }

        // 预先算好坐标, 避免发射过程反复换算
        let start_ts = geom.rs_to_ts[sh.slice_segment_addr as usize];
        let start_ctb_x = sh.slice_segment_addr % geom.ctb_width;
        let start_ctb_y = sh.slice_segment_addr / geom.ctb_width;
        let prev_rs = if start_ts == 0 {
            0
        } else {
            geom.ts_to_rs[start_ts as usize - 1]
        };

        let ctx = SliceCtx {
            sps: run.sps,
            pps: run.pps,
            dec: run.dec,
            geom,
            sh,
            slice_idx: i as u32,
            slice_qp,
            max_num_merge_cand,
            nb_refs,
            slice_temporal_mvp: state.slice_temporal_mvp,
            dependent_slice_segment: sh.flags.contains(SliceFlags::DEPENDENT_SLICE_SEGMENT),
            start_ts,
            start_ctb_x,
            start_ctb_y,
            prev_ctb_x: prev_rs % geom.ctb_width,
            prev_ctb_y: prev_rs / geom.ctb_width,
            src_addr: run.src.addr,
        };

        if run.pps.flags.contains(PpsFlags::ENTROPY_CODING_SYNC) {
            wpp_decode_slice(job, &ctx, last_slice)?;
        } else {
            decode_slice(job, &ctx, last_slice)?;
        }
    }

    // 帧尾: 解析参考帧地址与辅助缓冲
    let mut dpb_q_aux: [Option<AuxRef>; MAX_REFS] = std::array::from_fn(|_| None);

    for i in 0..run.dec.num_active_dpb_entries as usize {
        let ent = &run.dec.dpb[i];
        let Some(buf) = env.capture.find_buffer(ent.timestamp) else {
            warn!(
                "HEVC: 缺少 DPB 条目 {i}, 时间戳 {}, 退回本帧自身地址",
                ent.timestamp
            );
            continue;
        };

        if state.use_aux {
            dpb_q_aux[i] = env.aux.ref_idx(buf.index);
            if dpb_q_aux[i].is_none() {
                warn!(
                    "HEVC: 缺少 DPB 条目 {i} 的辅助缓冲, 时间戳 {}, 槽位 {}",
                    ent.timestamp, buf.index
                );
            }
        }

        job.ref_addrs[i][0] = buf.plane_addrs[0];
        job.ref_addrs[i][1] = if fmt.pixelformat.is_multiplane() {
            buf.plane_addrs[1]
        } else {
            buf.plane_addrs[0] + u64::from(fmt.height) * 128
        };
    }

    // DPB 辅助引用换代
    for (slot, fresh) in state.ref_aux.iter_mut().zip(dpb_q_aux.iter_mut()) {
        env.aux.release(slot);
        *slot = fresh.take();
    }

    // 上一帧自己的缓冲此刻要么已进 DPB 要么不再需要
    env.aux.release(&mut state.frame_aux);

    if state.mk_aux {
        let fresh = env
            .aux
            .acquire(run.dst.index, state.colmv_picsize, env.alloc)?;
        job.frame_aux = env.aux.ref_of(&fresh);
        state.frame_aux = Some(fresh);
    }

    if job.dpbno_col != DPB_NO_COL {
        if job.dpbno_col >= run.dec.num_active_dpb_entries {
            error!(
                "HEVC: 同位参考下标 {} >= 激活 DPB 条目数 {}",
                job.dpbno_col, run.dec.num_active_dpb_entries
            );
        } else {
            // 标准要求同位参考在整帧内不变 (7.4.7.1), 这里顺手解析
            job.col_aux = state.ref_aux[job.dpbno_col as usize]
                .as_ref()
                .and_then(|h| env.aux.ref_of(h));
            if job.col_aux.is_none() {
                // 缺同位缓冲必须中止, 阶段 2 会在坏数据上出错
                return Err(QiError::InvalidData("缺少同位参考的辅助缓冲".into()));
            }
        }
    }

    job.state = JobState::Phase1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ref_unit_type() {
        // 表 7-1: 奇数类型为参考
        for t in [1u8, 3, 5, 7, 9, 11, 13, 15] {
            assert!(is_ref_unit_type(t), "类型 {t} 应为参考");
        }
        for t in [0u8, 2, 4, 6, 8, 10, 12, 14] {
            assert!(!is_ref_unit_type(t), "类型 {t} 不应为参考");
        }
        assert!(is_ref_unit_type(19), "IDR_W_RADL 为参考");
    }

    #[test]
    fn test_mk_config2_bits() {
        use crate::params::{Pps, Sps};

        let sps = Sps {
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1080,
            chroma_format_idc: 1,
            bit_depth_luma_minus8: 2,
            bit_depth_chroma_minus8: 2,
            log2_diff_max_min_luma_coding_block_size: 3,
            flags: SpsFlags::STRONG_INTRA_SMOOTHING,
            ..Sps::default()
        };
        let pps = Pps {
            pps_cb_qp_offset: -1,
            log2_parallel_merge_level_minus2: 1,
            ..Pps::default()
        };
        let dec = crate::params::DecodeParams::default();
        let sm = crate::params::ScalingMatrix::default();
        let run = FrameRun {
            sps: &sps,
            pps: &pps,
            dec: &dec,
            slices: &[],
            scaling_matrix: &sm,
            src: crate::params::SrcBuffer {
                addr: 0,
                bytes_used: 0,
                request_token: 0,
            },
            dst: crate::params::DstBuffer {
                index: 0,
                timestamp: 0,
                num_planes: 2,
                plane_addrs: [0; 2],
                plane_lengths: [0; 2],
            },
        };

        let c = mk_config2(&run, 6, true, true);
        assert_eq!(c & 0xf, 10, "10 位亮度");
        assert_eq!((c >> 4) & 0xf, 10);
        assert_ne!(c & (1 << 8), 0, "高位深标志");
        assert_eq!((c >> 10) & 0x7, 6, "log2 CTB");
        assert_ne!(c & (1 << 14), 0, "强帧内平滑");
        assert_ne!(c & (1 << 15), 0, "运动矢量写出");
        assert_eq!((c >> 16) & 0x7, 3, "并行 merge 级别");
        assert_ne!(c & (1 << 19), 0, "时域 MVP");
        assert_eq!((c >> 21) & 31, (-1i8 as u8 as u32) & 31, "Cb QP 偏移取 5 位补码");
    }
}
