//! CABAC 初始概率推导与量化缩放因子展开.
//!
//! 上下文变量初始化过程见 H.265 9.3.2.2, 初始值表见表 9-4 至 9-42.
//! 注意本硬件的条目排列与 FFmpeg 的数组偏移略有不同.

use crate::params::{ScalingMatrix, SliceFlags, SliceParams, SliceType};
use crate::regs::{self, CmdFifo, PROB_BACKUP};

/// 有效概率条目数
pub const PROB_VALS: usize = 154;
/// 按 4 字节对齐后的表长 (按字拷贝)
pub const PROB_ARRAY_SIZE: usize = (PROB_VALS + 3) & !3;

/// 写一张概率表所需的命令数 (表 + 备份命令)
pub const CMDS_WRITE_PROB: usize = PROB_ARRAY_SIZE / 4 + 1;

/// 展开后的缩放因子表总长 (0xbe0 + 0x400, 并非笔误)
pub const NUM_SCALING_FACTORS: usize = 4064;

/// 写缩放因子表的命令预留数
pub const CMDS_WRITE_SCALING_FACTORS: usize = NUM_SCALING_FACTORS;

/// 三组初始化类型的初始值表
static PROB_INIT: [[u8; 156]; 3] = [
    [
        153, 200, 139, 141, 157, 154, 154, 154, 154, 154, 184, 154, 154,
        154, 184, 63, 154, 154, 154, 154, 154, 154, 154, 154, 154, 154,
        154, 154, 154, 153, 138, 138, 111, 141, 94, 138, 182, 154, 154,
        154, 140, 92, 137, 138, 140, 152, 138, 139, 153, 74, 149, 92,
        139, 107, 122, 152, 140, 179, 166, 182, 140, 227, 122, 197, 110,
        110, 124, 125, 140, 153, 125, 127, 140, 109, 111, 143, 127, 111,
        79, 108, 123, 63, 110, 110, 124, 125, 140, 153, 125, 127, 140,
        109, 111, 143, 127, 111, 79, 108, 123, 63, 91, 171, 134, 141,
        138, 153, 136, 167, 152, 152, 139, 139, 111, 111, 125, 110, 110,
        94, 124, 108, 124, 107, 125, 141, 179, 153, 125, 107, 125, 141,
        179, 153, 125, 107, 125, 141, 179, 153, 125, 140, 139, 182, 182,
        152, 136, 152, 136, 153, 136, 139, 111, 136, 139, 111, 0, 0,
    ],
    [
        153, 185, 107, 139, 126, 197, 185, 201, 154, 149, 154, 139, 154,
        154, 154, 152, 110, 122, 95, 79, 63, 31, 31, 153, 153, 168,
        140, 198, 79, 124, 138, 94, 153, 111, 149, 107, 167, 154, 154,
        154, 154, 196, 196, 167, 154, 152, 167, 182, 182, 134, 149, 136,
        153, 121, 136, 137, 169, 194, 166, 167, 154, 167, 137, 182, 125,
        110, 94, 110, 95, 79, 125, 111, 110, 78, 110, 111, 111, 95,
        94, 108, 123, 108, 125, 110, 94, 110, 95, 79, 125, 111, 110,
        78, 110, 111, 111, 95, 94, 108, 123, 108, 121, 140, 61, 154,
        107, 167, 91, 122, 107, 167, 139, 139, 155, 154, 139, 153, 139,
        123, 123, 63, 153, 166, 183, 140, 136, 153, 154, 166, 183, 140,
        136, 153, 154, 166, 183, 140, 136, 153, 154, 170, 153, 123, 123,
        107, 121, 107, 121, 167, 151, 183, 140, 151, 183, 140, 0, 0,
    ],
    [
        153, 160, 107, 139, 126, 197, 185, 201, 154, 134, 154, 139, 154,
        154, 183, 152, 154, 137, 95, 79, 63, 31, 31, 153, 153, 168,
        169, 198, 79, 224, 167, 122, 153, 111, 149, 92, 167, 154, 154,
        154, 154, 196, 167, 167, 154, 152, 167, 182, 182, 134, 149, 136,
        153, 121, 136, 122, 169, 208, 166, 167, 154, 152, 167, 182, 125,
        110, 124, 110, 95, 94, 125, 111, 111, 79, 125, 126, 111, 111,
        79, 108, 123, 93, 125, 110, 124, 110, 95, 94, 125, 111, 111,
        79, 125, 126, 111, 111, 79, 108, 123, 93, 121, 140, 61, 154,
        107, 167, 91, 107, 107, 167, 139, 139, 170, 154, 139, 153, 139,
        123, 123, 63, 124, 166, 183, 140, 136, 153, 154, 166, 183, 140,
        136, 153, 154, 166, 183, 140, 136, 153, 154, 170, 153, 138, 138,
        122, 121, 122, 121, 167, 151, 183, 140, 151, 183, 140, 0, 0,
    ],
];

fn clip_i32(x: i32, lo: i32, hi: i32) -> i32 {
    x.clamp(lo, hi)
}

/// 由 slice 头选择初始化类型 (0..=2)
pub fn init_type_of(sh: &SliceParams) -> usize {
    if sh.flags.contains(SliceFlags::CABAC_INIT) && sh.slice_type != SliceType::I {
        sh.slice_type as usize + 1
    } else {
        2 - sh.slice_type as usize
    }
}

/// 推导一张初始概率表
///
/// `(qp, init_type)` 的纯函数: 定点推导 + 无分支符号折叠 + 奇偶修正钳位,
/// 输出值恒在 `[0, 124]`, 表尾补零对齐到 4 字节.
pub fn derive_probabilities(slice_qp: i32, init_type: usize) -> [u8; PROB_ARRAY_SIZE] {
    let q = clip_i32(slice_qp, 0, 51);
    let p = &PROB_INIT[init_type];
    let mut dst = [0u8; PROB_ARRAY_SIZE];

    for i in 0..PROB_VALS {
        let init_value = i32::from(p[i]);
        let m = (init_value >> 4) * 5 - 45;
        let n = ((init_value & 15) << 3) - 16;
        let mut pre = 2 * (((m * q) >> 4) + n) - 127;

        pre ^= pre >> 31;
        if pre > 124 {
            pre = 124 + (pre & 1);
        }
        dst[i] = pre as u8;
    }
    dst
}

/// 发射概率表写入命令, 随后立即备份
///
/// 备份并非总是必要, 但开销很小, 且简化 (并加速) 多瓦片与 WPP 场景:
/// 不存在写入概率表后还想要回到先前非初始状态的情况.
pub fn write_prob(fifo: &mut CmdFifo, sh: &SliceParams, slice_qp: u32) {
    let dst = derive_probabilities(slice_qp as i32, init_type_of(sh));

    for i in (0..PROB_ARRAY_SIZE).step_by(4) {
        fifo.write(
            regs::PROB_ARRAY_BASE + i as u16,
            u32::from(dst[i])
                | (u32::from(dst[i + 1]) << 8)
                | (u32::from(dst[i + 2]) << 16)
                | (u32::from(dst[i + 3]) << 24),
        );
    }

    fifo.write(regs::RPI_TRANSFER, PROB_BACKUP);
}

/// 发射缩放因子表写入命令
pub fn write_scaling_factors(fifo: &mut CmdFifo, factors: &[u8; NUM_SCALING_FACTORS]) {
    for i in (0..NUM_SCALING_FACTORS).step_by(4) {
        fifo.write(
            regs::SCALING_FACTOR_BASE + i as u16,
            u32::from(factors[i])
                | (u32::from(factors[i + 1]) << 8)
                | (u32::from(factors[i + 2]) << 16)
                | (u32::from(factors[i + 3]) << 24),
        );
    }
}

/// 展开一张三角基表到完整缩放矩阵
///
/// 4x4/8x8 直接拷贝; 16x16/32x32 按 2×/4× 最近邻上采样,
/// 然后用显式 DC 系数覆盖元素 0.
pub fn expand_scaling_list(size_id: u32, dst: &mut [u8], src: &[u8], dc: u8) {
    match size_id {
        0 => dst[..16].copy_from_slice(&src[..16]),
        1 => dst[..64].copy_from_slice(&src[..64]),
        2 => {
            let mut d = 0;
            for y in 0..16 {
                let row = &src[(y >> 1) * 8..];
                for x in 0..8 {
                    dst[d] = row[x];
                    dst[d + 1] = row[x];
                    d += 2;
                }
            }
            dst[0] = dc;
        }
        _ => {
            let mut d = 0;
            for y in 0..32 {
                let row = &src[(y >> 2) * 8..];
                for x in 0..8 {
                    dst[d..d + 4].fill(row[x]);
                    d += 4;
                }
            }
            dst[0] = dc;
        }
    }
}

/// 各尺寸类/矩阵号在平坦表中的偏移
static SCALING_FACTOR_OFFSETS: [[usize; 6]; 4] = [
    // SID0 (4x4)
    [0x0000, 0x0010, 0x0020, 0x0030, 0x0040, 0x0050],
    // SID1 (8x8)
    [0x0060, 0x00a0, 0x00e0, 0x0120, 0x0160, 0x01a0],
    // SID2 (16x16)
    [0x01e0, 0x02e0, 0x03e0, 0x04e0, 0x05e0, 0x06e0],
    // SID3 (32x32)
    [0x07e0, 0x0be0, 0x0000, 0x0000, 0x0000, 0x0000],
];

/// 把缩放矩阵展开进作业的平坦因子表
pub fn populate_scaling_factors(
    sl: &ScalingMatrix,
    factors: &mut [u8; NUM_SCALING_FACTORS],
) {
    for mid in 0..6 {
        expand_scaling_list(
            0,
            &mut factors[SCALING_FACTOR_OFFSETS[0][mid]..],
            &sl.scaling_list_4x4[mid],
            0,
        );
    }
    for mid in 0..6 {
        expand_scaling_list(
            1,
            &mut factors[SCALING_FACTOR_OFFSETS[1][mid]..],
            &sl.scaling_list_8x8[mid],
            0,
        );
    }
    for mid in 0..6 {
        expand_scaling_list(
            2,
            &mut factors[SCALING_FACTOR_OFFSETS[2][mid]..],
            &sl.scaling_list_16x16[mid],
            sl.scaling_list_dc_coef_16x16[mid],
        );
    }
    for mid in 0..2 {
        expand_scaling_list(
            3,
            &mut factors[SCALING_FACTOR_OFFSETS[3][mid]..],
            &sl.scaling_list_32x32[mid],
            sl.scaling_list_dc_coef_32x32[mid],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_pure_and_bounded() {
        for init_type in 0..3 {
            for qp in [0, 13, 26, 37, 51] {
                let a = derive_probabilities(qp, init_type);
                let b = derive_probabilities(qp, init_type);
                assert_eq!(a, b, "相同输入必须得到相同概率表");
                assert!(a[..PROB_VALS].iter().all(|&v| v <= 124), "概率值必须 <= 124");
            }
        }
    }

    #[test]
    fn test_derive_known_value() {
        // init=153: m=0, n=56, pre=2*56-127=-15 → 折叠后 14, 与 qp 无关
        for qp in [0, 26, 51] {
            assert_eq!(derive_probabilities(qp, 0)[0], 14);
        }
    }

    #[test]
    fn test_derive_qp_clipped() {
        assert_eq!(
            derive_probabilities(-10, 1),
            derive_probabilities(0, 1),
            "QP 低于 0 应钳位"
        );
        assert_eq!(
            derive_probabilities(99, 1),
            derive_probabilities(51, 1),
            "QP 高于 51 应钳位"
        );
    }

    #[test]
    fn test_derive_padding_is_zero() {
        let t = derive_probabilities(26, 2);
        assert_eq!(&t[PROB_VALS..], &[0, 0], "表尾应补零对齐");
    }

    #[test]
    fn test_init_type_selection() {
        let mut sh = SliceParams {
            slice_type: SliceType::I,
            ..SliceParams::default()
        };
        assert_eq!(init_type_of(&sh), 0, "I slice 固定用表 0");

        sh.slice_type = SliceType::P;
        assert_eq!(init_type_of(&sh), 1);
        sh.flags = SliceFlags::CABAC_INIT;
        assert_eq!(init_type_of(&sh), 2, "CABAC_INIT 翻转 P/B 表选择");

        sh.slice_type = SliceType::B;
        assert_eq!(init_type_of(&sh), 1);
        sh.flags = SliceFlags::empty();
        assert_eq!(init_type_of(&sh), 2);
    }

    #[test]
    fn test_write_prob_emits_backup() {
        let mut fifo = CmdFifo::new();
        let sh = SliceParams::default();
        write_prob(&mut fifo, &sh, 30);
        assert_eq!(fifo.len(), CMDS_WRITE_PROB);
        let last = fifo.as_slice().last().unwrap();
        assert_eq!(last.addr, regs::RPI_TRANSFER);
        assert_eq!(last.data, PROB_BACKUP, "写表后必须立即备份");
    }

    #[test]
    fn test_expand_16x16_upsample_and_dc() {
        let src: Vec<u8> = (0..64).collect();
        let mut dst = [0u8; 256];
        expand_scaling_list(2, &mut dst, &src, 99);
        assert_eq!(dst[0], 99, "元素 0 必须被 DC 系数覆盖");
        for y in 0..16 {
            for x in 0..16 {
                if y == 0 && x == 0 {
                    continue;
                }
                assert_eq!(
                    dst[y * 16 + x],
                    src[(y >> 1) * 8 + (x >> 1)],
                    "2x 最近邻上采样错误 @({y},{x})"
                );
            }
        }
    }

    #[test]
    fn test_expand_32x32_upsample_and_dc() {
        let src: Vec<u8> = (0..64).map(|v| v * 2).collect();
        let mut dst = [0u8; 1024];
        expand_scaling_list(3, &mut dst, &src, 7);
        assert_eq!(dst[0], 7);
        assert_eq!(dst[1], src[0]);
        assert_eq!(dst[32 * 4 + 4], src[8 + 1], "4x 最近邻上采样错误");
    }

    #[test]
    fn test_populate_scaling_factors_offsets() {
        let mut sl = ScalingMatrix::default();
        sl.scaling_list_32x32[1][0] = 33;
        sl.scaling_list_dc_coef_32x32[1] = 44;
        let mut factors = [0u8; NUM_SCALING_FACTORS];
        populate_scaling_factors(&sl, &mut factors);
        assert_eq!(factors[0x0be0], 44, "32x32 第二矩阵 DC 应落在 0xbe0");
        assert_eq!(factors[0x0be0 + 1], 33);
    }
}
