//! 入口点序列编译 (瓦片模式与 WPP 模式).
//!
//! 硬件在每个瓦片或每个 CTB 行的边界自动暂停, 命令流必须为每个这样的
//! 区段发射一个入口点: 区段坐标、slice 配置、可选的 QP 重置、暂停模式
//! 与恢复控制字. 同一 slice 跨越多个区段时, 概率状态在区段间备份/重载.
//!
//! 区段补齐可以发生在下一个 slice 编译时 (那时才知道上一 slice 的真实
//! 终点), 所以这里只使用不随 slice 变化的尾部状态 ([`DecodeJob`] 的
//! `entry_*` 字段).

use qi_core::QiResult;

use crate::job::DecodeJob;
use crate::probs::{CMDS_WRITE_PROB, write_prob};
use crate::regs::{
    PROB_BACKUP, PROB_RELOAD, RPI_BEGINTILEEND, RPI_CONTROL, RPI_MODE, RPI_QP, RPI_STATUS,
    RPI_TILEEND, RPI_TILESTART, RPI_TRANSFER,
};
use crate::slice::{
    CMDS_NEW_SLICE_SEGMENT, CMDS_PROGRAM_SLICECMDS, CMDS_WRITE_BITSTREAM, CMDS_WRITE_SLICE,
    SliceCtx, new_slice_segment, pre_slice_decode, program_slicecmds, slice_reg_const,
    write_bitstream, write_slice,
};

/// WPP 暂停模式字
pub const PAUSE_MODE_WPP: u32 = 1;
/// 瓦片暂停模式字
pub const PAUSE_MODE_TILE: u32 = 0xffff;

/// [`new_entry_point`] 的命令预算
pub const CMDS_NEW_ENTRY_POINT: usize = 6 + CMDS_WRITE_SLICE;
/// [`wpp_pause`] 的命令预算
pub const CMDS_WPP_PAUSE: usize = 4;
/// WPP 模式补一行的命令预算
pub const CMDS_WPP_ENTRY_FILL_1: usize = CMDS_WPP_PAUSE + 2 + CMDS_NEW_ENTRY_POINT;

/// 发射一个入口点
///
/// 区段终点坐标由瓦片边界 (或 WPP 的当前行) 决定; `reset_qp_y` 时重写
/// 亮度 QP (加上位深偏移). 发射后更新作业的入口点尾部状态.
#[allow(clippy::too_many_arguments)]
pub fn new_entry_point(
    job: &mut DecodeJob,
    ctx: &SliceCtx,
    do_bte: bool,
    reset_qp_y: bool,
    pause_mode: u32,
    tile_x: u32,
    tile_y: u32,
    ctb_col: u32,
    ctb_row: u32,
    slice_qp: u32,
    slice_const: u32,
) {
    let geom = ctx.geom;
    let endx = geom.col_bd[tile_x as usize + 1] - 1;
    let endy = if pause_mode == PAUSE_MODE_WPP {
        ctb_row
    } else {
        geom.row_bd[tile_y as usize + 1] - 1
    };

    job.cmds.write(
        RPI_TILESTART,
        geom.col_bd[tile_x as usize] | (geom.row_bd[tile_y as usize] << 16),
    );
    job.cmds.write(RPI_TILEEND, endx | (endy << 16));

    if do_bte {
        job.cmds.write(RPI_BEGINTILEEND, endx | (endy << 16));
    }

    write_slice(&mut job.cmds, ctx, slice_const, endx, endy);

    if reset_qp_y {
        let sps_qp_bd_offset = 6 * u32::from(ctx.sps.bit_depth_luma_minus8);
        job.cmds.write(RPI_QP, sps_qp_bd_offset + slice_qp);
    }

    job.cmds.write(
        RPI_MODE,
        pause_mode
            | (u32::from(endx == geom.ctb_width - 1) << 17)
            | (u32::from(endy == geom.ctb_height - 1) << 18),
    );

    job.cmds.write(RPI_CONTROL, ctb_col | (ctb_row << 16));

    job.entry_tile_x = tile_x;
    job.entry_tile_y = tile_y;
    job.entry_ctb_x = ctb_col;
    job.entry_ctb_y = ctb_row;
    job.entry_qp = slice_qp;
    job.entry_slice = slice_const;
}

// ---- WPP 模式 ----

/// 在 CTB 行尾暂停并备份概率状态
pub fn wpp_pause(job: &mut DecodeJob, ctb_row: u32) {
    job.cmds.write(RPI_STATUS, (ctb_row << 18) | 0x25);
    job.cmds.write(RPI_TRANSFER, PROB_BACKUP);
    job.cmds.write(
        RPI_MODE,
        if ctb_row == job.pic_height_in_ctbs_y - 1 {
            0x70000
        } else {
            0x30000
        },
    );
    job.cmds.write(RPI_CONTROL, (ctb_row << 16) + 2);
}

/// 把入口点补齐到 `last_y` 行 (不含该行自身的结束)
///
/// 宽度为 1 列时保存的概率状态就是初始状态, 用备份代替重载;
/// 宽度大于 2 列才需要显式暂停.
pub fn wpp_entry_fill(job: &mut DecodeJob, ctx: &SliceCtx, last_y: u32) -> QiResult<()> {
    let geom = ctx.geom;
    let last_x = geom.ctb_width - 1;
    let rows = last_y.saturating_sub(job.entry_ctb_y) as usize;

    job.cmds.check_space(CMDS_WPP_ENTRY_FILL_1 * rows)?;

    while job.entry_ctb_y < last_y {
        if geom.ctb_width > 2 {
            wpp_pause(job, job.entry_ctb_y);
        }
        job.cmds
            .write(RPI_STATUS, (job.entry_ctb_y << 18) | (last_x << 5) | 2);

        if geom.ctb_width == 2 {
            job.cmds.write(RPI_TRANSFER, PROB_BACKUP);
        } else {
            job.cmds.write(RPI_TRANSFER, PROB_RELOAD);
        }

        let (qp, sc, y) = (job.entry_qp, job.entry_slice, job.entry_ctb_y);
        new_entry_point(job, ctx, false, true, PAUSE_MODE_WPP, 0, 0, 0, y + 1, qp, sc);
    }
    Ok(())
}

/// 用上一 slice 的真实终点收尾: 补齐入口点并写期望结束地址
fn wpp_end_previous_slice(job: &mut DecodeJob, ctx: &SliceCtx) -> QiResult<()> {
    wpp_entry_fill(job, ctx, ctx.prev_ctb_y)?;

    job.cmds.check_space(CMDS_WPP_PAUSE + 2)?;

    if job.entry_ctb_x < 2
        && (job.entry_ctb_y < ctx.start_ctb_y || ctx.start_ctb_x > 2)
        && ctx.geom.ctb_width > 2
    {
        wpp_pause(job, ctx.prev_ctb_y);
    }
    job.cmds.write(
        RPI_STATUS,
        1 | (ctx.prev_ctb_x << 5) | (ctx.prev_ctb_y << 18),
    );
    if ctx.start_ctb_x == 2 || (ctx.geom.ctb_width == 2 && job.entry_ctb_y < ctx.start_ctb_y) {
        job.cmds.write(RPI_TRANSFER, PROB_BACKUP);
    }
    Ok(())
}

/// 编译一个 WPP 模式的 slice 段
///
/// 仅支持 main profile, WPP 蕴含单瓦片, 区段即 CTB 行.
pub fn wpp_decode_slice(job: &mut DecodeJob, ctx: &SliceCtx, last_slice: bool) -> QiResult<()> {
    let mut reset_qp_y = true;
    let indep = !ctx.dependent_slice_segment;

    if ctx.start_ts != 0 {
        wpp_end_previous_slice(job, ctx)?;
    }
    pre_slice_decode(job, ctx);

    job.cmds.check_space(
        CMDS_WRITE_BITSTREAM
            + CMDS_WRITE_PROB
            + CMDS_PROGRAM_SLICECMDS
            + CMDS_NEW_SLICE_SEGMENT
            + CMDS_NEW_ENTRY_POINT,
    )?;

    write_bitstream(&mut job.cmds, ctx);

    if ctx.start_ts == 0 || indep || ctx.geom.ctb_width == 1 {
        write_prob(&mut job.cmds, ctx.sh, ctx.slice_qp);
    } else if ctx.start_ctb_x == 0 {
        job.cmds.write(RPI_TRANSFER, PROB_RELOAD);
    } else {
        reset_qp_y = false;
    }

    program_slicecmds(job, ctx.slice_idx);
    new_slice_segment(job, ctx);
    new_entry_point(
        job,
        ctx,
        indep,
        reset_qp_y,
        PAUSE_MODE_WPP,
        0,
        0,
        ctx.start_ctb_x,
        ctx.start_ctb_y,
        ctx.slice_qp,
        slice_reg_const(ctx),
    );

    if last_slice {
        wpp_entry_fill(job, ctx, ctx.geom.ctb_height - 1)?;

        job.cmds.check_space(CMDS_WPP_PAUSE + 1)?;

        if job.entry_ctb_x < 2 && ctx.geom.ctb_width > 2 {
            wpp_pause(job, ctx.geom.ctb_height - 1);
        }

        job.cmds.write(
            RPI_STATUS,
            1 | ((ctx.geom.ctb_width - 1) << 5) | ((ctx.geom.ctb_height - 1) << 18),
        );
    }
    Ok(())
}

// ---- 瓦片模式 ----

/// 把入口点按瓦片扫描序补齐到指定瓦片 (不含)
pub fn tile_entry_fill(
    job: &mut DecodeJob,
    ctx: &SliceCtx,
    last_tile_x: u32,
    last_tile_y: u32,
) -> QiResult<()> {
    let geom = ctx.geom;

    while job.entry_tile_y < last_tile_y
        || (job.entry_tile_y == last_tile_y && job.entry_tile_x < last_tile_x)
    {
        let mut t_x = job.entry_tile_x;
        let mut t_y = job.entry_tile_y;
        let last_x = geom.col_bd[t_x as usize + 1] - 1;
        let last_y = geom.row_bd[t_y as usize + 1] - 1;

        // 多留一条余量
        job.cmds.check_space(CMDS_NEW_ENTRY_POINT + 3)?;

        job.cmds
            .write(RPI_STATUS, 2 | (last_x << 5) | (last_y << 18));
        job.cmds.write(RPI_TRANSFER, PROB_RELOAD);

        t_x += 1;
        if t_x >= geom.tile_width {
            t_x = 0;
            t_y += 1;
        }

        let (qp, sc) = (job.entry_qp, job.entry_slice);
        new_entry_point(
            job,
            ctx,
            false,
            true,
            PAUSE_MODE_TILE,
            t_x,
            t_y,
            geom.col_bd[t_x as usize],
            geom.row_bd[t_y as usize],
            qp,
            sc,
        );
    }
    Ok(())
}

/// 写上一 slice 的期望结束 CTB 地址
fn end_previous_slice(job: &mut DecodeJob, ctx: &SliceCtx) -> QiResult<()> {
    tile_entry_fill(
        job,
        ctx,
        ctx.geom.ctb_to_tile_x(ctx.prev_ctb_x),
        ctx.geom.ctb_to_tile_y(ctx.prev_ctb_y),
    )?;

    job.cmds.write(
        RPI_STATUS,
        1 | (ctx.prev_ctb_x << 5) | (ctx.prev_ctb_y << 18),
    );
    Ok(())
}

/// 编译一个瓦片模式的 slice 段
pub fn decode_slice(job: &mut DecodeJob, ctx: &SliceCtx, last_slice: bool) -> QiResult<()> {
    let tile_x = ctx.geom.ctb_to_tile_x(ctx.start_ctb_x);
    let tile_y = ctx.geom.ctb_to_tile_y(ctx.start_ctb_y);

    if ctx.start_ts != 0 {
        end_previous_slice(job, ctx)?;
    }

    job.cmds.check_space(
        CMDS_WRITE_BITSTREAM
            + CMDS_WRITE_PROB
            + CMDS_PROGRAM_SLICECMDS
            + CMDS_NEW_SLICE_SEGMENT
            + CMDS_NEW_ENTRY_POINT,
    )?;

    pre_slice_decode(job, ctx);
    write_bitstream(&mut job.cmds, ctx);

    // 依赖性 slice 留在同一瓦片内时不重置概率/QP
    let reset_qp_y = ctx.start_ts == 0
        || !ctx.dependent_slice_segment
        || tile_x != ctx.geom.ctb_to_tile_x(ctx.prev_ctb_x)
        || tile_y != ctx.geom.ctb_to_tile_y(ctx.prev_ctb_y);
    if reset_qp_y {
        write_prob(&mut job.cmds, ctx.sh, ctx.slice_qp);
    }

    program_slicecmds(job, ctx.slice_idx);
    new_slice_segment(job, ctx);
    new_entry_point(
        job,
        ctx,
        !ctx.dependent_slice_segment,
        reset_qp_y,
        PAUSE_MODE_TILE,
        tile_x,
        tile_y,
        ctx.start_ctb_x,
        ctx.start_ctb_y,
        ctx.slice_qp,
        slice_reg_const(ctx),
    );

    // 末 slice 才知道本帧不会再有 slice, 此时补齐其余瓦片;
    // 否则留到下一 slice 开头 (那时才知道本 slice 的终点)
    if last_slice {
        tile_entry_fill(job, ctx, ctx.geom.tile_width - 1, ctx.geom.tile_height - 1)?;
        job.cmds.write(
            RPI_STATUS,
            1 | ((ctx.geom.ctb_width - 1) << 5) | ((ctx.geom.ctb_height - 1) << 18),
        );
    }
    Ok(())
}
