//! 帧级输入参数与缓冲描述符.
//!
//! 这些结构是外部协作层 (码流解析/缓冲管理) 与本编译器之间的契约:
//! 头部解析已经完成, 这里只消费结构化记录. 字段命名沿用 H.265 语法元素,
//! 便于与标准条文对照.

use bitflags::bitflags;

use qi_core::mem::DmaAddr;
use qi_core::{QiError, QiResult};

/// DPB 最大条目数 (硬件参考槽位数)
pub const MAX_REFS: usize = 16;

/// 支持的最大亮度采样宽/高
pub const MAX_PIC_SAMPLES: u32 = 4096;

bitflags! {
    /// SPS 标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpsFlags: u32 {
        /// 分离色彩平面编码
        const SEPARATE_COLOUR_PLANE     = 1 << 0;
        /// 启用量化缩放列表
        const SCALING_LIST_ENABLED      = 1 << 1;
        /// 启用非对称运动分区 (AMP)
        const AMP_ENABLED               = 1 << 2;
        /// 启用 PCM 模式
        const PCM_ENABLED               = 1 << 3;
        /// PCM 块禁用环路滤波
        const PCM_LOOP_FILTER_DISABLED  = 1 << 4;
        /// 序列级允许时域运动矢量预测
        const SPS_TEMPORAL_MVP_ENABLED  = 1 << 5;
        /// 启用强帧内平滑
        const STRONG_INTRA_SMOOTHING    = 1 << 6;
    }
}

bitflags! {
    /// PPS 标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PpsFlags: u32 {
        /// 启用瓦片划分
        const TILES_ENABLED               = 1 << 0;
        /// 启用熵编码同步 (WPP)
        const ENTROPY_CODING_SYNC         = 1 << 1;
        /// 启用 CU 级 QP 调整
        const CU_QP_DELTA_ENABLED         = 1 << 2;
        /// 启用变换量化旁路
        const TRANSQUANT_BYPASS_ENABLED   = 1 << 3;
        /// 启用变换跳过
        const TRANSFORM_SKIP_ENABLED      = 1 << 4;
        /// 启用符号位隐藏
        const SIGN_DATA_HIDING_ENABLED    = 1 << 5;
        /// 受限帧内预测
        const CONSTRAINED_INTRA_PRED      = 1 << 6;
        /// P slice 加权预测
        const WEIGHTED_PRED               = 1 << 7;
        /// B slice 加权双向预测
        const WEIGHTED_BIPRED             = 1 << 8;
        /// 允许跨瓦片环路滤波
        const LOOP_FILTER_ACROSS_TILES    = 1 << 9;
    }
}

bitflags! {
    /// slice 头标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SliceFlags: u32 {
        /// 依赖性 slice 段
        const DEPENDENT_SLICE_SEGMENT      = 1 << 0;
        /// 本帧启用时域运动矢量预测
        const TEMPORAL_MVP_ENABLED         = 1 << 1;
        /// CABAC 初始化表选择
        const CABAC_INIT                   = 1 << 2;
        /// 同位参考帧取自 L0 列表
        const COLLOCATED_FROM_L0           = 1 << 3;
        /// 亮度 SAO
        const SAO_LUMA                     = 1 << 4;
        /// 色度 SAO
        const SAO_CHROMA                   = 1 << 5;
        /// B slice L1 运动矢量差为零
        const MVD_L1_ZERO                  = 1 << 6;
        /// 本 slice 禁用去块滤波
        const DEBLOCKING_FILTER_DISABLED   = 1 << 7;
        /// 允许跨 slice 环路滤波
        const LOOP_FILTER_ACROSS_SLICES    = 1 << 8;
    }
}

bitflags! {
    /// DPB 条目标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DpbEntryFlags: u32 {
        /// 长期参考帧
        const LONG_TERM_REFERENCE = 1 << 0;
    }
}

/// slice 类型 (编号与硬件 slice 配置字一致)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    /// 双向预测
    B = 0,
    /// 单向预测
    P = 1,
    /// 帧内
    I = 2,
}

/// 序列参数集 (已解析)
///
/// 变更检测依赖结构化值比较: 任何字段变化都会触发几何缓存全量重建.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sps {
    /// 亮度采样宽度
    pub pic_width_in_luma_samples: u32,
    /// 亮度采样高度
    pub pic_height_in_luma_samples: u32,
    /// 亮度位深 - 8
    pub bit_depth_luma_minus8: u8,
    /// 色度位深 - 8
    pub bit_depth_chroma_minus8: u8,
    /// 色度格式 (1 = 4:2:0)
    pub chroma_format_idc: u8,
    /// log2(最小亮度 CB 尺寸) - 3
    pub log2_min_luma_coding_block_size_minus3: u8,
    /// log2(最大 CB) - log2(最小 CB)
    pub log2_diff_max_min_luma_coding_block_size: u8,
    /// log2(最小亮度 TB 尺寸) - 2
    pub log2_min_luma_transform_block_size_minus2: u8,
    /// log2(最大 TB) - log2(最小 TB)
    pub log2_diff_max_min_luma_transform_block_size: u8,
    /// 帧间变换树最大深度
    pub max_transform_hierarchy_depth_inter: u8,
    /// 帧内变换树最大深度
    pub max_transform_hierarchy_depth_intra: u8,
    /// PCM 亮度位深 - 1
    pub pcm_sample_bit_depth_luma_minus1: u8,
    /// PCM 色度位深 - 1
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    /// log2(最小 PCM CB 尺寸) - 3
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    /// log2(最大 PCM CB) - log2(最小 PCM CB)
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    /// 子层数 - 1
    pub sps_max_sub_layers_minus1: u8,
    /// 标志位
    pub flags: SpsFlags,
}

impl Sps {
    /// CTB 尺寸的 log2
    pub fn log2_ctb_size(&self) -> u32 {
        u32::from(self.log2_min_luma_coding_block_size_minus3) + 3
            + u32::from(self.log2_diff_max_min_luma_coding_block_size)
    }

    /// 是否已被设置过 (全零视为未设置)
    pub fn is_set(&self) -> bool {
        self.pic_width_in_luma_samples != 0
    }
}

/// 最大瓦片列/行数 (对应档次限制)
pub const MAX_TILE_COLS: usize = 20;
/// 最大瓦片行数
pub const MAX_TILE_ROWS: usize = 22;

/// 图像参数集 (已解析)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pps {
    /// 初始 QP - 26
    pub init_qp_minus26: i8,
    /// CU QP delta 深度
    pub diff_cu_qp_delta_depth: u8,
    /// Cb QP 偏移
    pub pps_cb_qp_offset: i8,
    /// Cr QP 偏移
    pub pps_cr_qp_offset: i8,
    /// 瓦片列数 - 1
    pub num_tile_columns_minus1: u8,
    /// 瓦片行数 - 1
    pub num_tile_rows_minus1: u8,
    /// 各瓦片列宽 - 1 (CTB 单位, 显式划分)
    pub column_width_minus1: [u8; MAX_TILE_COLS],
    /// 各瓦片行高 - 1 (CTB 单位, 显式划分)
    pub row_height_minus1: [u8; MAX_TILE_ROWS],
    /// log2(并行 merge 级别) - 2
    pub log2_parallel_merge_level_minus2: u8,
    /// 标志位
    pub flags: PpsFlags,
}

impl Default for Pps {
    fn default() -> Self {
        Self {
            init_qp_minus26: 0,
            diff_cu_qp_delta_depth: 0,
            pps_cb_qp_offset: 0,
            pps_cr_qp_offset: 0,
            num_tile_columns_minus1: 0,
            num_tile_rows_minus1: 0,
            column_width_minus1: [0; MAX_TILE_COLS],
            row_height_minus1: [0; MAX_TILE_ROWS],
            log2_parallel_merge_level_minus2: 0,
            flags: PpsFlags::empty(),
        }
    }
}

/// 加权预测因子表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredWeightTable {
    /// 亮度权重分母的 log2
    pub luma_log2_weight_denom: u8,
    /// 色度权重分母 log2 相对亮度的偏移
    pub delta_chroma_log2_weight_denom: i8,
    /// L0 亮度权重偏差
    pub delta_luma_weight_l0: [i8; MAX_REFS],
    /// L0 亮度偏移
    pub luma_offset_l0: [i8; MAX_REFS],
    /// L0 色度权重偏差 (Cb/Cr)
    pub delta_chroma_weight_l0: [[i8; 2]; MAX_REFS],
    /// L0 色度偏移 (Cb/Cr)
    pub chroma_offset_l0: [[i8; 2]; MAX_REFS],
    /// L1 亮度权重偏差
    pub delta_luma_weight_l1: [i8; MAX_REFS],
    /// L1 亮度偏移
    pub luma_offset_l1: [i8; MAX_REFS],
    /// L1 色度权重偏差 (Cb/Cr)
    pub delta_chroma_weight_l1: [[i8; 2]; MAX_REFS],
    /// L1 色度偏移 (Cb/Cr)
    pub chroma_offset_l1: [[i8; 2]; MAX_REFS],
}

impl Default for PredWeightTable {
    fn default() -> Self {
        Self {
            luma_log2_weight_denom: 0,
            delta_chroma_log2_weight_denom: 0,
            delta_luma_weight_l0: [0; MAX_REFS],
            luma_offset_l0: [0; MAX_REFS],
            delta_chroma_weight_l0: [[0; 2]; MAX_REFS],
            chroma_offset_l0: [[0; 2]; MAX_REFS],
            delta_luma_weight_l1: [0; MAX_REFS],
            luma_offset_l1: [0; MAX_REFS],
            delta_chroma_weight_l1: [[0; 2]; MAX_REFS],
            chroma_offset_l1: [[0; 2]; MAX_REFS],
        }
    }
}

/// 单个 slice 的头参数 (已解析, 一帧内按序排列, 编译期间不可变)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceParams {
    /// slice 在码流中的位长度
    pub bit_size: u32,
    /// 熵编码数据起始的字节偏移
    pub data_byte_offset: u32,
    /// 首个 CTB 的光栅扫描地址
    pub slice_segment_addr: u32,
    /// slice 类型
    pub slice_type: SliceType,
    /// slice QP 增量
    pub slice_qp_delta: i8,
    /// Cb QP 偏移
    pub slice_cb_qp_offset: i8,
    /// Cr QP 偏移
    pub slice_cr_qp_offset: i8,
    /// 去块滤波 beta 偏移 / 2
    pub slice_beta_offset_div2: i8,
    /// 去块滤波 tc 偏移 / 2
    pub slice_tc_offset_div2: i8,
    /// 5 - 最大 merge 候选数
    pub five_minus_max_num_merge_cand: u8,
    /// L0 激活参考数 - 1
    pub num_ref_idx_l0_active_minus1: u8,
    /// L1 激活参考数 - 1
    pub num_ref_idx_l1_active_minus1: u8,
    /// L0 参考列表 (DPB 条目下标)
    pub ref_idx_l0: [u8; MAX_REFS],
    /// L1 参考列表 (DPB 条目下标)
    pub ref_idx_l1: [u8; MAX_REFS],
    /// 同位参考在激活列表中的下标
    pub collocated_ref_idx: u8,
    /// 本帧 POC
    pub slice_pic_order_cnt: i32,
    /// NAL 单元类型 (表 7-1)
    pub nal_unit_type: u8,
    /// NAL 头时域层 id + 1
    pub nuh_temporal_id_plus1: u8,
    /// 加权预测因子
    pub pred_weight_table: PredWeightTable,
    /// 标志位
    pub flags: SliceFlags,
}

impl Default for SliceParams {
    fn default() -> Self {
        Self {
            bit_size: 0,
            data_byte_offset: 0,
            slice_segment_addr: 0,
            slice_type: SliceType::I,
            slice_qp_delta: 0,
            slice_cb_qp_offset: 0,
            slice_cr_qp_offset: 0,
            slice_beta_offset_div2: 0,
            slice_tc_offset_div2: 0,
            five_minus_max_num_merge_cand: 0,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_idx_l0: [0; MAX_REFS],
            ref_idx_l1: [0; MAX_REFS],
            collocated_ref_idx: 0,
            slice_pic_order_cnt: 0,
            nal_unit_type: 0,
            nuh_temporal_id_plus1: 1,
            pred_weight_table: PredWeightTable::default(),
            flags: SliceFlags::empty(),
        }
    }
}

/// DPB 条目: 以时间戳为键的已解码参考帧描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DpbEntry {
    /// 捕获缓冲时间戳 (查找键)
    pub timestamp: u64,
    /// 图像序号
    pub pic_order_cnt_val: i32,
    /// 标志位
    pub flags: DpbEntryFlags,
}

/// 帧级解码参数 (DPB 描述符列表)
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    /// 激活 DPB 条目数
    pub num_active_dpb_entries: u32,
    /// DPB 条目
    pub dpb: [DpbEntry; MAX_REFS],
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            num_active_dpb_entries: 0,
            dpb: [DpbEntry::default(); MAX_REFS],
        }
    }
}

/// 量化缩放矩阵 (三角基表 + DC 系数)
#[derive(Debug, Clone, Copy)]
pub struct ScalingMatrix {
    /// 4x4 基表 × 6
    pub scaling_list_4x4: [[u8; 16]; 6],
    /// 8x8 基表 × 6
    pub scaling_list_8x8: [[u8; 64]; 6],
    /// 16x16 基表 × 6 (8x8 下采样存储)
    pub scaling_list_16x16: [[u8; 64]; 6],
    /// 32x32 基表 × 2 (8x8 下采样存储)
    pub scaling_list_32x32: [[u8; 64]; 2],
    /// 16x16 DC 系数
    pub scaling_list_dc_coef_16x16: [u8; 6],
    /// 32x32 DC 系数
    pub scaling_list_dc_coef_32x32: [u8; 2],
}

impl Default for ScalingMatrix {
    fn default() -> Self {
        Self {
            scaling_list_4x4: [[16; 16]; 6],
            scaling_list_8x8: [[16; 64]; 6],
            scaling_list_16x16: [[16; 64]; 6],
            scaling_list_32x32: [[16; 64]; 2],
            scaling_list_dc_coef_16x16: [16; 6],
            scaling_list_dc_coef_32x32: [16; 2],
        }
    }
}

/// 目标帧像素格式 (8/10 位 × 列式瓦片/线性布局)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstPixelFormat {
    /// 8 位, 128 列瓦片, 双平面
    Nv12MtCol128,
    /// 10 位, 128 列瓦片, 双平面
    Nv12Mt10Col128,
    /// 8 位, 128 列条带, 单平面
    Nv12Col128,
    /// 10 位, 128 列条带, 单平面
    Nv12_10Col128,
}

impl DstPixelFormat {
    /// 该格式是否为双平面瓦片布局
    pub fn is_multiplane(self) -> bool {
        matches!(self, Self::Nv12MtCol128 | Self::Nv12Mt10Col128)
    }

    /// 该格式承载的亮度位深
    pub fn bit_depth(self) -> u8 {
        match self {
            Self::Nv12MtCol128 | Self::Nv12Col128 => 8,
            Self::Nv12Mt10Col128 | Self::Nv12_10Col128 => 10,
        }
    }
}

/// 协商好的捕获格式 (外部格式协商的产物, 这里只消费)
#[derive(Debug, Clone, Copy)]
pub struct DstFormat {
    /// 像素格式
    pub pixelformat: DstPixelFormat,
    /// 帧宽
    pub width: u32,
    /// 帧高 (决定列式布局的平面步距)
    pub height: u32,
    /// 平面 0 每行字节数 (线性格式使用)
    pub bytesperline: u32,
    /// 各平面应有的最小长度
    pub sizeimage: [u32; 2],
}

/// 源码流缓冲描述
#[derive(Debug, Clone, Copy)]
pub struct SrcBuffer {
    /// 码流基地址
    pub addr: DmaAddr,
    /// 已用字节数
    pub bytes_used: u32,
    /// 外部完成令牌 (对应一次提交请求)
    pub request_token: u64,
}

/// 目标帧缓冲描述
#[derive(Debug, Clone, Copy)]
pub struct DstBuffer {
    /// 捕获队列中的槽位号 (辅助缓冲按此号索引)
    pub index: u32,
    /// 时间戳 (之后作为 DPB 查找键)
    pub timestamp: u64,
    /// 平面数
    pub num_planes: u32,
    /// 各平面基地址
    pub plane_addrs: [DmaAddr; 2],
    /// 各平面长度
    pub plane_lengths: [u32; 2],
}

/// 一帧的全部输入: 参数集 + slice 列表 + 缓冲描述
#[derive(Debug)]
pub struct FrameRun<'a> {
    /// 序列参数集
    pub sps: &'a Sps,
    /// 图像参数集
    pub pps: &'a Pps,
    /// 帧级解码参数
    pub dec: &'a DecodeParams,
    /// 有序 slice 头列表
    pub slices: &'a [SliceParams],
    /// 量化缩放矩阵 (启用缩放列表时使用)
    pub scaling_matrix: &'a ScalingMatrix,
    /// 源码流缓冲
    pub src: SrcBuffer,
    /// 目标帧缓冲
    pub dst: DstBuffer,
}

/// 校验 SPS 是否落在本硬件支持范围内
///
/// 不支持的序列在触碰硬件之前即被拒绝 (逐帧失败, 码流可以继续).
pub fn validate_sps(sps: &Sps, dst_fmt: Option<&DstFormat>) -> QiResult<()> {
    if sps.chroma_format_idc != 1 {
        return Err(QiError::Unsupported(format!(
            "色度格式 ({}) 不支持, 仅支持 4:2:0",
            sps.chroma_format_idc
        )));
    }

    if sps.bit_depth_luma_minus8 != 0 && sps.bit_depth_luma_minus8 != 2 {
        return Err(QiError::Unsupported(format!(
            "亮度位深 ({}) 不支持",
            sps.bit_depth_luma_minus8 + 8
        )));
    }

    if sps.bit_depth_luma_minus8 != sps.bit_depth_chroma_minus8 {
        return Err(QiError::Unsupported(format!(
            "色度位深 ({}) != 亮度位深 ({})",
            sps.bit_depth_chroma_minus8 + 8,
            sps.bit_depth_luma_minus8 + 8
        )));
    }

    if sps.pic_width_in_luma_samples == 0
        || sps.pic_height_in_luma_samples == 0
        || sps.pic_width_in_luma_samples > MAX_PIC_SAMPLES
        || sps.pic_height_in_luma_samples > MAX_PIC_SAMPLES
    {
        return Err(QiError::InvalidData(format!(
            "SPS 尺寸非法: {}x{}",
            sps.pic_width_in_luma_samples, sps.pic_height_in_luma_samples
        )));
    }

    let Some(fmt) = dst_fmt else {
        return Ok(());
    };

    if sps.bit_depth_luma_minus8 + 8 != fmt.pixelformat.bit_depth() {
        return Err(QiError::InvalidData(format!(
            "SPS 亮度位深 {} 与捕获格式不匹配",
            sps.bit_depth_luma_minus8 + 8
        )));
    }

    if sps.pic_width_in_luma_samples > fmt.width
        || sps.pic_height_in_luma_samples > fmt.height
    {
        return Err(QiError::InvalidData(format!(
            "SPS 尺寸 ({}x{}) > 捕获尺寸 ({}x{})",
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples,
            fmt.width,
            fmt.height
        )));
    }

    Ok(())
}

/// 校验 PPS: WPP 与多瓦片划分互斥 (仅支持 main profile)
pub fn validate_pps(pps: &Pps) -> QiResult<()> {
    if pps.flags.contains(PpsFlags::ENTROPY_CODING_SYNC)
        && pps.flags.contains(PpsFlags::TILES_ENABLED)
        && (pps.num_tile_columns_minus1 != 0 || pps.num_tile_rows_minus1 != 0)
    {
        return Err(QiError::Unsupported("WPP 与多瓦片不能同时启用".into()));
    }
    Ok(())
}
