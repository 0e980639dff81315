//! 硬件寄存器映射与命令 FIFO.
//!
//! 阶段 1 的寄存器程序是 (16 位 APB 地址, 32 位数据) 对的有序序列,
//! 由外部执行引擎按序回放. 阶段 2 的寄存器在提交时直接编程, 不走 FIFO.

use bytes::{BufMut, Bytes, BytesMut};
use log::{error, info};

use qi_core::mem::DmaAddr;
use qi_core::{QiError, QiResult};

// ---- 阶段 1 APB 寄存器 ----

/// SPS 打包字 0
pub const RPI_SPS0: u16 = 0x100;
/// SPS 打包字 1
pub const RPI_SPS1: u16 = 0x104;
/// PPS 打包字
pub const RPI_PPS: u16 = 0x108;
/// slice 配置字 (含边缘 CTB 宽高)
pub const RPI_SLICE: u16 = 0x10c;
/// 瓦片起始 CTB 坐标
pub const RPI_TILESTART: u16 = 0x110;
/// 瓦片结束 CTB 坐标
pub const RPI_TILEEND: u16 = 0x114;
/// slice 起始 CTB 坐标
pub const RPI_SLICESTART: u16 = 0x118;
/// 模式字 (暂停模式 + 帧边缘标志)
pub const RPI_MODE: u16 = 0x11c;
/// 亮度 QP
pub const RPI_QP: u16 = 0x130;
/// 入口点控制字
pub const RPI_CONTROL: u16 = 0x134;
/// 状态寄存器 (期望结束地址校验)
pub const RPI_STATUS: u16 = 0x138;
/// 码流基地址
pub const RPI_BFBASE: u16 = 0x140;
/// 码流长度
pub const RPI_BFNUM: u16 = 0x144;
/// 码流控制 (偏移 + 防竞争码开关)
pub const RPI_BFCONTROL: u16 = 0x148;
/// PU 写出基地址
pub const RPI_PUWBASE: u16 = 0x150;
/// PU 写出步距
pub const RPI_PUWSTRIDE: u16 = 0x154;
/// 系数写出基地址
pub const RPI_COEFFWBASE: u16 = 0x158;
/// 系数写出步距
pub const RPI_COEFFWSTRIDE: u16 = 0x15c;
/// slice 消息块头
pub const RPI_SLICECMDS: u16 = 0x160;
/// 独立 slice 的起始瓦片结束坐标
pub const RPI_BEGINTILEEND: u16 = 0x164;
/// 概率状态传输命令 (备份/重载)
pub const RPI_TRANSFER: u16 = 0x168;
/// 命令 FIFO 基地址
pub const RPI_CFBASE: u16 = 0x16c;
/// 命令 FIFO 长度
pub const RPI_CFNUM: u16 = 0x170;
/// 命令 FIFO 已执行计数
pub const RPI_CFSTATUS: u16 = 0x174;

// ---- 阶段 2 寄存器 ----

/// PU 回读基地址
pub const RPI_PURBASE: u16 = 0x200;
/// PU 回读步距
pub const RPI_PURSTRIDE: u16 = 0x204;
/// 系数回读基地址
pub const RPI_COEFFRBASE: u16 = 0x208;
/// 系数回读步距
pub const RPI_COEFFRSTRIDE: u16 = 0x20c;
/// CTB 行数 (写入后启动阶段 2)
pub const RPI_NUMROWS: u16 = 0x210;
/// 帧级配置字
pub const RPI_CONFIG2: u16 = 0x214;
/// 输出亮度基地址
pub const RPI_OUTYBASE: u16 = 0x218;
/// 输出亮度步距
pub const RPI_OUTYSTRIDE: u16 = 0x21c;
/// 输出色度基地址
pub const RPI_OUTCBASE: u16 = 0x220;
/// 输出色度步距
pub const RPI_OUTCSTRIDE: u16 = 0x224;
/// 帧尺寸
pub const RPI_FRAMESIZE: u16 = 0x22c;
/// 运动矢量写出基地址
pub const RPI_MVBASE: u16 = 0x230;
/// 运动矢量写出步距
pub const RPI_MVSTRIDE: u16 = 0x234;
/// 同位运动矢量回读基地址
pub const RPI_COLBASE: u16 = 0x238;
/// 同位运动矢量回读步距
pub const RPI_COLSTRIDE: u16 = 0x23c;
/// 当前帧 POC
pub const RPI_CURRPOC: u16 = 0x240;

// ---- 表区基址 (FIFO 内按 4 字节步进写入) ----

/// CABAC 概率表区
pub const PROB_ARRAY_BASE: u16 = 0x1000;
/// 量化缩放因子表区
pub const SCALING_FACTOR_BASE: u16 = 0x2000;
/// slice 消息表区
pub const SLICE_MSG_BASE: u16 = 0x4000;
/// 参考帧地址表区 (阶段 2 直接编程)
pub const REF_ADDR_BASE: u16 = 0x9000;

/// 概率状态备份命令字
pub const PROB_BACKUP: u32 = (20 << 12) + (20 << 6);
/// 概率状态重载命令字
pub const PROB_RELOAD: u32 = (20 << 12) + 20;

/// DMA 总线地址 → 64 字节粒度的 AXI 地址
pub fn dma_to_axi(addr: DmaAddr) -> u32 {
    (addr >> 6) as u32
}

/// 一条硬件命令: 16 位寄存器地址 + 32 位数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cmd {
    /// 寄存器地址
    pub addr: u16,
    /// 写入数据
    pub data: u32,
}

/// 命令 FIFO 初始容量
const CMD_FIFO_INITIAL: usize = 8096;

/// 单次预留的合理性上限
const CMD_RESERVE_SANE: usize = 0x10_0000;

/// 可增长的命令 FIFO
///
/// 发射方先以 `check_space` 预留空间再写入; 预留失败是可恢复错误
/// (本帧被拒绝), 写入越过预留则记录错误并丢弃该命令.
#[derive(Debug)]
pub struct CmdFifo {
    cmds: Vec<Cmd>,
}

impl Default for CmdFifo {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdFifo {
    /// 创建带初始容量的 FIFO
    pub fn new() -> Self {
        Self {
            cmds: Vec::with_capacity(CMD_FIFO_INITIAL),
        }
    }

    /// 预留 `n` 条命令的空间
    pub fn check_space(&mut self, n: usize) -> QiResult<()> {
        if n > CMD_RESERVE_SANE {
            error!("HEVC: 命令预留数 {n} 不合理");
            return Err(QiError::OutOfMemory(format!("命令预留数 {n} 不合理")));
        }

        if self.cmds.len() + n <= self.cmds.capacity() {
            return Ok(());
        }

        let old = self.cmds.capacity();
        let newmax = (self.cmds.len() + n).next_power_of_two();
        self.cmds
            .try_reserve_exact(newmax - self.cmds.len())
            .map_err(|_| {
                error!("HEVC: 命令缓冲从 {old} 扩容到 {newmax} 失败");
                QiError::OutOfMemory(format!("命令缓冲扩容到 {newmax} 失败"))
            })?;
        info!("HEVC: 命令缓冲从 {old} 扩容到 {newmax}");
        Ok(())
    }

    /// 追加一条命令 (对应阶段 1 的一次 APB 写)
    pub fn write(&mut self, addr: u16, data: u32) {
        if self.cmds.len() >= self.cmds.capacity() {
            error!("HEVC: 命令 FIFO 在 {} 处溢出", self.cmds.len());
            return;
        }
        self.cmds.push(Cmd { addr, data });
    }

    /// 已编译命令数
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// 清空 (作业复用时调用, 保留容量)
    pub fn clear(&mut self) {
        self.cmds.clear();
    }

    /// 命令切片
    pub fn as_slice(&self) -> &[Cmd] {
        &self.cmds
    }

    /// 序列化为执行引擎消费的 DMA 镜像 (小端 addr/data 对)
    pub fn to_dma_image(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.cmds.len() * 8);
        for cmd in &self.cmds {
            buf.put_u32_le(u32::from(cmd.addr));
            buf.put_u32_le(cmd.data);
        }
        buf.freeze()
    }
}
