//! slice 级命令发射.
//!
//! 每个 slice 段编译为一组寄存器命令: 码流窗口、参数集打包字、
//! slice 消息块与 slice 配置字. 入口点序列由 [`crate::entry`] 负责,
//! 这里只处理与瓦片/WPP 无关的部分.

use qi_core::mem::DmaAddr;

use crate::geometry::Geometry;
use crate::job::DecodeJob;
use crate::params::{
    DecodeParams, DpbEntryFlags, Pps, PpsFlags, SliceFlags, SliceParams, SliceType, Sps, SpsFlags,
};
use crate::probs::{CMDS_WRITE_SCALING_FACTORS, write_scaling_factors};
use crate::regs::{
    CmdFifo, RPI_BFBASE, RPI_BFCONTROL, RPI_BFNUM, RPI_PPS, RPI_SLICE, RPI_SLICECMDS,
    RPI_SLICESTART, RPI_SPS0, RPI_SPS1, SLICE_MSG_BASE, dma_to_axi,
};

/// 参考列表下标
pub const L0: usize = 0;
/// 参考列表下标
pub const L1: usize = 1;

/// [`write_bitstream`] 的命令预算
pub const CMDS_WRITE_BITSTREAM: usize = 4;
/// [`write_slice`] 的命令预算
pub const CMDS_WRITE_SLICE: usize = 1;
/// [`new_slice_segment`] 的命令预算
pub const CMDS_NEW_SLICE_SEGMENT: usize = 4 + CMDS_WRITE_SCALING_FACTORS;
/// [`program_slicecmds`] 的命令预算
pub const CMDS_PROGRAM_SLICECMDS: usize = 1 + crate::job::SLICE_MSGS_MAX;

/// 一个 slice 段的派生状态
///
/// 由帧级编译循环在进入每个 slice 前算好, 发射期间只读.
#[derive(Debug)]
pub struct SliceCtx<'a> {
    /// 序列参数集
    pub sps: &'a Sps,
    /// 图像参数集
    pub pps: &'a Pps,
    /// 帧级解码参数
    pub dec: &'a DecodeParams,
    /// 推导几何
    pub geom: &'a Geometry,
    /// 本 slice 的头参数
    pub sh: &'a SliceParams,
    /// 帧内 slice 序号
    pub slice_idx: u32,
    /// 本 slice 的亮度 QP
    pub slice_qp: u32,
    /// 最大 merge 候选数
    pub max_num_merge_cand: u32,
    /// L0/L1 激活参考数
    pub nb_refs: [u32; 2],
    /// 本帧是否启用时域运动矢量预测 (取自首个 slice)
    pub slice_temporal_mvp: bool,
    /// 是否为依赖性 slice 段
    pub dependent_slice_segment: bool,
    /// 起始 CTB 的瓦片扫描地址
    pub start_ts: u32,
    /// 起始 CTB 列
    pub start_ctb_x: u32,
    /// 起始 CTB 行
    pub start_ctb_y: u32,
    /// 上一 slice 末 CTB 列
    pub prev_ctb_x: u32,
    /// 上一 slice 末 CTB 行
    pub prev_ctb_y: u32,
    /// 码流缓冲基地址
    pub src_addr: DmaAddr,
}

/// slice 配置字的常量部分 (边缘 CTB 宽高由入口点按瓦片/行补上)
pub fn slice_reg_const(ctx: &SliceCtx) -> u32 {
    let mut x = ctx.max_num_merge_cand
        | (ctx.nb_refs[L0] << 4)
        | (ctx.nb_refs[L1] << 8)
        | ((ctx.sh.slice_type as u32) << 12);

    if ctx.sh.flags.contains(SliceFlags::SAO_LUMA) {
        x |= 1 << 14;
    }
    if ctx.sh.flags.contains(SliceFlags::SAO_CHROMA) {
        x |= 1 << 15;
    }
    if ctx.sh.slice_type == SliceType::B && ctx.sh.flags.contains(SliceFlags::MVD_L1_ZERO) {
        x |= 1 << 16;
    }

    x
}

/// 写 slice 配置字, 补上该入口点末 CTB 的实际宽高
///
/// 帧边缘的 CTB 可能小于标称 CTB 尺寸.
pub fn write_slice(
    fifo: &mut CmdFifo,
    ctx: &SliceCtx,
    slice_const: u32,
    ctb_col: u32,
    ctb_row: u32,
) {
    let cs = 1u32 << ctx.geom.log2_ctb_size;
    let w_last = ctx.sps.pic_width_in_luma_samples & (cs - 1);
    let h_last = ctx.sps.pic_height_in_luma_samples & (cs - 1);

    let w = if ctb_col + 1 < ctx.geom.ctb_width || w_last == 0 {
        cs
    } else {
        w_last
    };
    let h = if ctb_row + 1 < ctx.geom.ctb_height || h_last == 0 {
        cs
    } else {
        h_last
    };

    fifo.write(RPI_SLICE, slice_const | (w << 17) | (h << 24));
}

/// 配置本 slice 的码流窗口
///
/// 码流含防竞争码 (提交方不剥离), 偏移按 64 字节 AXI 粒度拆分.
pub fn write_bitstream(fifo: &mut CmdFifo, ctx: &SliceCtx) {
    let use_emu = 1u32;
    let offset = ctx.sh.data_byte_offset;
    let len = ctx.sh.bit_size.div_ceil(8) - offset;
    let addr = ctx.src_addr + DmaAddr::from(offset);
    let offset = (addr & 63) as u32;

    fifo.write(RPI_BFBASE, dma_to_axi(addr));
    fifo.write(RPI_BFNUM, len);
    // 先写带停止位的控制字
    fifo.write(RPI_BFCONTROL, offset + (1 << 7));
    fifo.write(RPI_BFCONTROL, offset + (use_emu << 6));
}

/// 发射 SPS/PPS 打包字与 slice 段起点
pub fn new_slice_segment(job: &mut DecodeJob, ctx: &SliceCtx) {
    let sps = ctx.sps;
    let pps = ctx.pps;

    job.cmds.write(
        RPI_SPS0,
        u32::from(sps.log2_min_luma_coding_block_size_minus3 + 3)
            | (ctx.geom.log2_ctb_size << 4)
            | (u32::from(sps.log2_min_luma_transform_block_size_minus2 + 2) << 8)
            | (u32::from(
                sps.log2_min_luma_transform_block_size_minus2
                    + 2
                    + sps.log2_diff_max_min_luma_transform_block_size,
            ) << 12)
            | (u32::from(sps.bit_depth_luma_minus8 + 8) << 16)
            | (u32::from(sps.bit_depth_chroma_minus8 + 8) << 20)
            | (u32::from(sps.max_transform_hierarchy_depth_intra) << 24)
            | (u32::from(sps.max_transform_hierarchy_depth_inter) << 28),
    );

    let chroma_fmt = if sps.flags.contains(SpsFlags::SEPARATE_COLOUR_PLANE) {
        0
    } else {
        u32::from(sps.chroma_format_idc)
    };
    job.cmds.write(
        RPI_SPS1,
        u32::from(sps.pcm_sample_bit_depth_luma_minus1 + 1)
            | (u32::from(sps.pcm_sample_bit_depth_chroma_minus1 + 1) << 4)
            | (u32::from(sps.log2_min_pcm_luma_coding_block_size_minus3 + 3) << 8)
            | (u32::from(
                sps.log2_min_pcm_luma_coding_block_size_minus3
                    + 3
                    + sps.log2_diff_max_min_pcm_luma_coding_block_size,
            ) << 12)
            | (chroma_fmt << 16)
            | (u32::from(sps.flags.contains(SpsFlags::AMP_ENABLED)) << 18)
            | (u32::from(sps.flags.contains(SpsFlags::PCM_ENABLED)) << 19)
            | (u32::from(sps.flags.contains(SpsFlags::SCALING_LIST_ENABLED)) << 20)
            | (u32::from(sps.flags.contains(SpsFlags::STRONG_INTRA_SMOOTHING)) << 21),
    );

    job.cmds.write(
        RPI_PPS,
        (ctx.geom.log2_ctb_size - u32::from(pps.diff_cu_qp_delta_depth))
            | (u32::from(pps.flags.contains(PpsFlags::CU_QP_DELTA_ENABLED)) << 4)
            | (u32::from(pps.flags.contains(PpsFlags::TRANSQUANT_BYPASS_ENABLED)) << 5)
            | (u32::from(pps.flags.contains(PpsFlags::TRANSFORM_SKIP_ENABLED)) << 6)
            | (u32::from(pps.flags.contains(PpsFlags::SIGN_DATA_HIDING_ENABLED)) << 7)
            | ((((i32::from(pps.pps_cb_qp_offset) + i32::from(ctx.sh.slice_cb_qp_offset))
                as u32)
                & 255)
                << 8)
            | ((((i32::from(pps.pps_cr_qp_offset) + i32::from(ctx.sh.slice_cr_qp_offset))
                as u32)
                & 255)
                << 16)
            | (u32::from(pps.flags.contains(PpsFlags::CONSTRAINED_INTRA_PRED)) << 24),
    );

    if ctx.start_ts == 0 && ctx.sps.flags.contains(SpsFlags::SCALING_LIST_ENABLED) {
        write_scaling_factors(&mut job.cmds, &job.scaling_factors);
    }

    if !ctx.dependent_slice_segment {
        let ctb_col = ctx.sh.slice_segment_addr % job.pic_width_in_ctbs_y;
        let ctb_row = ctx.sh.slice_segment_addr / job.pic_width_in_ctbs_y;
        job.reg_slicestart = ctb_col | (ctb_row << 16);
    }

    job.cmds.write(RPI_SLICESTART, job.reg_slicestart);
}

/// 把缓冲的 slice 消息整体写入硬件消息表区
pub fn program_slicecmds(job: &mut DecodeJob, slice_idx: u32) {
    job.cmds.write(
        RPI_SLICECMDS,
        job.num_slice_msgs as u32 + (slice_idx << 8),
    );
    for i in 0..job.num_slice_msgs {
        let msg = job.slice_msgs[i];
        job.cmds
            .write(SLICE_MSG_BASE + 4 * i as u16, u32::from(msg));
    }
}

/// NoBackwardPredFlag (8.3.5): 列表内所有参考的 POC 都不晚于当前帧
fn has_backward(dec: &DecodeParams, idx: &[u8], n: u32, cur_poc: i32) -> bool {
    idx.iter()
        .take(n as usize)
        .all(|&i| cur_poc >= dec.dpb[i as usize].pic_order_cnt_val)
}

/// 追加一条参考帧的加权预测消息组
fn msg_weights(job: &mut DecodeJob, sh: &SliceParams, list: usize, idx: usize) {
    let w = &sh.pred_weight_table;
    let luma_weight_denom = 1i32 << w.luma_log2_weight_denom;
    let chroma_log2_weight_denom =
        i32::from(w.luma_log2_weight_denom) + i32::from(w.delta_chroma_log2_weight_denom);
    let chroma_weight_denom = 1i32 << chroma_log2_weight_denom;

    let (dl, ol, dc, oc) = if list == L0 {
        (
            &w.delta_luma_weight_l0,
            &w.luma_offset_l0,
            &w.delta_chroma_weight_l0,
            &w.chroma_offset_l0,
        )
    } else {
        (
            &w.delta_luma_weight_l1,
            &w.luma_offset_l1,
            &w.delta_chroma_weight_l1,
            &w.chroma_offset_l1,
        )
    };

    job.msg_slice(
        u16::from(w.luma_log2_weight_denom)
            | (((i32::from(dl[idx]) + luma_weight_denom) as u16 & 0x1ff) << 3),
    );
    job.msg_slice(u16::from(ol[idx] as u8));
    for c in 0..2 {
        job.msg_slice(
            chroma_log2_weight_denom as u16
                | (((i32::from(dc[idx][c]) + chroma_weight_denom) as u16 & 0x1ff) << 3),
        );
        job.msg_slice(u16::from(oc[idx][c] as u8));
    }
}

/// 编译 slice 消息块并记录同位参考
///
/// 消息块总以 slice 配置消息开头, 以去块滤波消息和 QP 偏移消息结尾;
/// P/B slice 在中间插入逐参考帧的描述 (含可选的加权预测因子).
pub fn pre_slice_decode(job: &mut DecodeJob, ctx: &SliceCtx) {
    let sh = ctx.sh;
    let dec = ctx.dec;

    job.num_slice_msgs = 0;

    let mut cmd_slice: u16 = match sh.slice_type {
        SliceType::I => 1,
        SliceType::P => 2,
        SliceType::B => 3,
    };
    cmd_slice |= (ctx.nb_refs[L0] as u16) << 2
        | (ctx.nb_refs[L1] as u16) << 6
        | (ctx.max_num_merge_cand as u16) << 11;

    let collocated_from_l0 = !ctx.slice_temporal_mvp
        || sh.slice_type != SliceType::B
        || sh.flags.contains(SliceFlags::COLLOCATED_FROM_L0);
    cmd_slice |= u16::from(collocated_from_l0) << 14;

    if sh.slice_type == SliceType::P || sh.slice_type == SliceType::B {
        let no_backward = has_backward(dec, &sh.ref_idx_l0, ctx.nb_refs[L0], sh.slice_pic_order_cnt)
            && has_backward(dec, &sh.ref_idx_l1, ctx.nb_refs[L1], sh.slice_pic_order_cnt);
        cmd_slice |= u16::from(no_backward) << 10;
        job.msg_slice(cmd_slice);

        if ctx.slice_temporal_mvp {
            let rpl = if collocated_from_l0 {
                &sh.ref_idx_l0
            } else {
                &sh.ref_idx_l1
            };
            job.dpbno_col = u32::from(rpl[sh.collocated_ref_idx as usize]);
        }

        let weighted_pred = if sh.slice_type == SliceType::P {
            ctx.pps.flags.contains(PpsFlags::WEIGHTED_PRED)
        } else {
            ctx.pps.flags.contains(PpsFlags::WEIGHTED_BIPRED)
        };

        for (list, refs) in [(L0, &sh.ref_idx_l0), (L1, &sh.ref_idx_l1)] {
            for idx in 0..ctx.nb_refs[list] as usize {
                let dpb_no = refs[idx] as usize;
                job.msg_slice(
                    dpb_no as u16
                        | if dec.dpb[dpb_no]
                            .flags
                            .contains(DpbEntryFlags::LONG_TERM_REFERENCE)
                        {
                            1 << 4
                        } else {
                            0
                        }
                        | if weighted_pred { 3 << 5 } else { 0 },
                );
                job.msg_slice(dec.dpb[dpb_no].pic_order_cnt_val as u16);

                if weighted_pred {
                    msg_weights(job, sh, list, idx);
                }
            }
        }
    } else {
        job.msg_slice(cmd_slice);
    }

    job.msg_slice(
        (sh.slice_beta_offset_div2 as u16 & 15)
            | ((sh.slice_tc_offset_div2 as u16 & 15) << 4)
            | (u16::from(sh.flags.contains(SliceFlags::DEBLOCKING_FILTER_DISABLED)) << 8)
            | (u16::from(sh.flags.contains(SliceFlags::LOOP_FILTER_ACROSS_SLICES)) << 9)
            | (u16::from(ctx.pps.flags.contains(PpsFlags::LOOP_FILTER_ACROSS_TILES)) << 10),
    );

    job.msg_slice(
        ((sh.slice_cr_qp_offset as u16 & 31) << 5) + (sh.slice_cb_qp_offset as u16 & 31),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryCache;
    use crate::job::{DPB_NO_COL, JobPool};
    use crate::params::{DpbEntry, PredWeightTable};

    fn sps_1080p() -> Sps {
        Sps {
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1080,
            chroma_format_idc: 1,
            log2_diff_max_min_luma_coding_block_size: 3,
            ..Sps::default()
        }
    }

    fn geom(sps: &Sps, pps: &Pps) -> GeometryCache {
        let mut cache = GeometryCache::new();
        cache.update(sps, pps).unwrap();
        cache
    }

    fn ctx<'a>(
        sps: &'a Sps,
        pps: &'a Pps,
        dec: &'a DecodeParams,
        g: &'a Geometry,
        sh: &'a SliceParams,
    ) -> SliceCtx<'a> {
        SliceCtx {
            sps,
            pps,
            dec,
            geom: g,
            sh,
            slice_idx: 0,
            slice_qp: 30,
            max_num_merge_cand: 5,
            nb_refs: [0, 0],
            slice_temporal_mvp: false,
            dependent_slice_segment: false,
            start_ts: 0,
            start_ctb_x: 0,
            start_ctb_y: 0,
            prev_ctb_x: 0,
            prev_ctb_y: 0,
            src_addr: 0x8000_0000,
        }
    }

    #[test]
    fn test_slice_reg_const_bits() {
        let sps = sps_1080p();
        let pps = Pps::default();
        let dec = DecodeParams::default();
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();
        let sh = SliceParams {
            slice_type: SliceType::B,
            flags: SliceFlags::SAO_LUMA | SliceFlags::MVD_L1_ZERO,
            ..SliceParams::default()
        };
        let mut c = ctx(&sps, &pps, &dec, g, &sh);
        c.max_num_merge_cand = 5;
        c.nb_refs = [2, 1];
        let x = slice_reg_const(&c);
        assert_eq!(x & 0xf, 5);
        assert_eq!((x >> 4) & 0xf, 2);
        assert_eq!((x >> 8) & 0xf, 1);
        assert_eq!((x >> 12) & 0x3, 0, "B slice 编号为 0");
        assert_ne!(x & (1 << 14), 0, "SAO 亮度位");
        assert_eq!(x & (1 << 15), 0, "SAO 色度未置位");
        assert_ne!(x & (1 << 16), 0, "B slice 的 MVD_L1_ZERO 位");
    }

    #[test]
    fn test_write_slice_edge_ctb() {
        let sps = sps_1080p();
        let pps = Pps::default();
        let dec = DecodeParams::default();
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();
        let sh = SliceParams::default();
        let c = ctx(&sps, &pps, &dec, g, &sh);

        // 1080 = 16*64 + 56: 末行 CTB 高 56
        let mut fifo = CmdFifo::new();
        write_slice(&mut fifo, &c, 0, 29, 16);
        assert_eq!(fifo.as_slice()[0].data, (64 << 17) | (56 << 24), "1920 整除时宽用满 CTB");

        let mut fifo = CmdFifo::new();
        write_slice(&mut fifo, &c, 0, 0, 0);
        assert_eq!(fifo.as_slice()[0].data, (64 << 17) | (64 << 24));
    }

    #[test]
    fn test_write_bitstream_splits_axi_offset() {
        let sps = sps_1080p();
        let pps = Pps::default();
        let dec = DecodeParams::default();
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();
        let sh = SliceParams {
            bit_size: 8 * 1000,
            data_byte_offset: 10,
            ..SliceParams::default()
        };
        let mut c = ctx(&sps, &pps, &dec, g, &sh);
        c.src_addr = 0x8000_0000;

        let mut fifo = CmdFifo::new();
        write_bitstream(&mut fifo, &c);
        let cmds = fifo.as_slice();
        // 基地址按 64 字节对齐下取, 余数进控制字
        assert_eq!(cmds[0].addr, RPI_BFBASE);
        assert_eq!(cmds[0].data, ((0x8000_0000u64 + 10) >> 6) as u32);
        assert_eq!(cmds[1].data, 990, "长度应扣除头部偏移");
        assert_eq!(cmds[2].data, 10 + (1 << 7), "停止位");
        assert_eq!(cmds[3].data, 10 + (1 << 6), "防竞争码开启");
    }

    #[test]
    fn test_pre_slice_decode_i_slice() {
        let sps = sps_1080p();
        let pps = Pps::default();
        let dec = DecodeParams::default();
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();
        let sh = SliceParams {
            slice_type: SliceType::I,
            slice_cb_qp_offset: -2,
            slice_cr_qp_offset: 3,
            ..SliceParams::default()
        };
        let mut c = ctx(&sps, &pps, &dec, g, &sh);
        c.max_num_merge_cand = 5;

        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        let job = pool.get_mut(id).unwrap();
        pre_slice_decode(job, &c);

        // I slice: 配置 + 去块 + QP 偏移, 共 3 条
        assert_eq!(job.num_slice_msgs, 3);
        assert_eq!(job.slice_msgs[0] & 0x3, 1, "I slice 编号");
        assert_ne!(job.slice_msgs[0] & (1 << 14), 0, "无时域 MVP 时同位取 L0");
        assert_eq!(job.slice_msgs[2], ((3 & 31) << 5) + (-2i16 as u16 & 31));
        assert_eq!(job.dpbno_col, DPB_NO_COL, "I slice 不应记录同位参考");
    }

    #[test]
    fn test_pre_slice_decode_p_slice_refs_and_col() {
        let sps = sps_1080p();
        let pps = Pps::default();
        let mut dec = DecodeParams::default();
        dec.num_active_dpb_entries = 2;
        dec.dpb[0] = DpbEntry {
            timestamp: 100,
            pic_order_cnt_val: 4,
            flags: DpbEntryFlags::empty(),
        };
        dec.dpb[1] = DpbEntry {
            timestamp: 200,
            pic_order_cnt_val: 8,
            flags: DpbEntryFlags::LONG_TERM_REFERENCE,
        };
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();
        let mut sh = SliceParams {
            slice_type: SliceType::P,
            slice_pic_order_cnt: 10,
            collocated_ref_idx: 1,
            ..SliceParams::default()
        };
        sh.ref_idx_l0[0] = 0;
        sh.ref_idx_l0[1] = 1;
        let mut c = ctx(&sps, &pps, &dec, g, &sh);
        c.nb_refs = [2, 0];
        c.slice_temporal_mvp = true;
        c.max_num_merge_cand = 5;

        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        let job = pool.get_mut(id).unwrap();
        pre_slice_decode(job, &c);

        // 配置 + 2×(描述+POC) + 去块 + QP 偏移
        assert_eq!(job.num_slice_msgs, 7);
        assert_ne!(job.slice_msgs[0] & (1 << 10), 0, "全部参考在过去, 无后向预测");
        assert_eq!(job.slice_msgs[1], 0, "条目 0 无长期位");
        assert_eq!(job.slice_msgs[2], 4);
        assert_eq!(job.slice_msgs[3], 1 | (1 << 4), "条目 1 带长期位");
        assert_eq!(job.slice_msgs[4], 8);
        assert_eq!(job.dpbno_col, 1, "同位参考取 L0[collocated_ref_idx]");
    }

    #[test]
    fn test_pre_slice_decode_weighted_pred() {
        let sps = sps_1080p();
        let pps = Pps {
            flags: PpsFlags::WEIGHTED_PRED,
            ..Pps::default()
        };
        let mut dec = DecodeParams::default();
        dec.num_active_dpb_entries = 1;
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();
        let mut wt = PredWeightTable::default();
        wt.luma_log2_weight_denom = 6;
        wt.delta_luma_weight_l0[0] = -2;
        wt.luma_offset_l0[0] = 5;
        let sh = SliceParams {
            slice_type: SliceType::P,
            pred_weight_table: wt,
            ..SliceParams::default()
        };
        let mut c = ctx(&sps, &pps, &dec, g, &sh);
        c.nb_refs = [1, 0];
        c.max_num_merge_cand = 5;

        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        let job = pool.get_mut(id).unwrap();
        pre_slice_decode(job, &c);

        // 配置 + 描述 + POC + 6 条权重 + 去块 + QP 偏移
        assert_eq!(job.num_slice_msgs, 11);
        assert_ne!(job.slice_msgs[1] & (3 << 5), 0, "加权预测标志");
        // 亮度: denom=6, delta=-2 → (64-2)&0x1ff << 3 | 6
        assert_eq!(job.slice_msgs[3], 6 | (62 << 3));
        assert_eq!(job.slice_msgs[4], 5);
    }

    #[test]
    fn test_new_slice_segment_slicestart_carry() {
        let sps = sps_1080p();
        let pps = Pps::default();
        let dec = DecodeParams::default();
        let cache = geom(&sps, &pps);
        let g = cache.geometry().unwrap();

        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        let job = pool.get_mut(id).unwrap();
        job.pic_width_in_ctbs_y = 30;

        // 独立 slice 从 CTB 180 (列 0, 行 6) 开始
        let sh = SliceParams {
            slice_segment_addr: 180,
            ..SliceParams::default()
        };
        let mut c = ctx(&sps, &pps, &dec, g, &sh);
        c.start_ts = 180;
        new_slice_segment(job, &c);
        assert_eq!(job.reg_slicestart, 6 << 16);

        // 依赖性 slice 沿用上一独立 slice 的起点
        let sh2 = SliceParams {
            slice_segment_addr: 200,
            flags: SliceFlags::DEPENDENT_SLICE_SEGMENT,
            ..SliceParams::default()
        };
        let mut c2 = ctx(&sps, &pps, &dec, g, &sh2);
        c2.dependent_slice_segment = true;
        c2.start_ts = 200;
        new_slice_segment(job, &c2);
        assert_eq!(job.reg_slicestart, 6 << 16, "依赖性 slice 不应改写起点");
        let last = job.cmds.as_slice().last().unwrap();
        assert_eq!(last.addr, RPI_SLICESTART);
        assert_eq!(last.data, 6 << 16);
    }

    #[test]
    fn test_program_slicecmds_layout() {
        let mut pool = JobPool::new();
        let id = pool.acquire().unwrap();
        let job = pool.get_mut(id).unwrap();
        job.msg_slice(0xabc);
        job.msg_slice(0x123);
        program_slicecmds(job, 5);

        let cmds = job.cmds.as_slice();
        assert_eq!(cmds[0].addr, RPI_SLICECMDS);
        assert_eq!(cmds[0].data, 2 + (5 << 8));
        assert_eq!(cmds[1].addr, SLICE_MSG_BASE);
        assert_eq!(cmds[1].data, 0xabc);
        assert_eq!(cmds[2].addr, SLICE_MSG_BASE + 4);
        assert_eq!(cmds[2].data, 0x123);
    }
}
