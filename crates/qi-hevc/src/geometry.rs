//! CTB 网格与瓦片几何缓存.
//!
//! 由 SPS/PPS 推导 CTB 网格、瓦片边界数组与光栅↔瓦片扫描地址互换表.
//! 推导结果只在参数集变化时重建: 变更检测采用结构化值比较, 任何字段的
//! 变化都触发全量重建 (保守的过度近似, 与硬件时序保持一致).

use log::debug;

use qi_core::{QiError, QiResult};

use crate::params::{Pps, PpsFlags, Sps};

/// 一帧的推导几何: CTB 网格、瓦片边界与扫描表
#[derive(Debug, Default)]
pub struct Geometry {
    /// CTB 尺寸的 log2
    pub log2_ctb_size: u32,
    /// 帧宽 (CTB 单位)
    pub ctb_width: u32,
    /// 帧高 (CTB 单位)
    pub ctb_height: u32,
    /// 帧面积 (CTB 单位)
    pub ctb_size: u32,
    /// 瓦片列数
    pub tile_width: u32,
    /// 瓦片行数
    pub tile_height: u32,
    /// 瓦片列边界, `tile_width + 1` 项, `[0] = 0`, 末项 = ctb_width
    pub col_bd: Vec<u32>,
    /// 瓦片行边界, `tile_height + 1` 项
    pub row_bd: Vec<u32>,
    /// 光栅地址 → 瓦片扫描地址
    pub rs_to_ts: Vec<u32>,
    /// 瓦片扫描地址 → 光栅地址
    pub ts_to_rs: Vec<u32>,
}

/// 在边界数组中查找 CTB 坐标所在的瓦片下标
///
/// `bd` 有 num+1 项且 `bd[0] = 0`, 所以总能找到.
fn ctb_to_tile(ctb: u32, bd: &[u32]) -> u32 {
    let mut i = 1;
    while ctb >= bd[i] {
        i += 1;
    }
    (i - 1) as u32
}

impl Geometry {
    /// CTB 列坐标 → 瓦片列下标
    pub fn ctb_to_tile_x(&self, ctb_x: u32) -> u32 {
        ctb_to_tile(ctb_x, &self.col_bd)
    }

    /// CTB 行坐标 → 瓦片行下标
    pub fn ctb_to_tile_y(&self, ctb_y: u32) -> u32 {
        ctb_to_tile(ctb_y, &self.row_bd)
    }

    /// 瓦片列宽 (CTB 单位)
    fn tile_col_width(&self, t_x: u32) -> u32 {
        self.col_bd[t_x as usize + 1] - self.col_bd[t_x as usize]
    }

    /// 瓦片行高 (CTB 单位)
    fn tile_row_height(&self, t_y: u32) -> u32 {
        self.row_bd[t_y as usize + 1] - self.row_bd[t_y as usize]
    }

    /// 按瓦片扫描序填充光栅↔扫描互换表
    fn fill_rs_to_ts(&mut self) {
        let mut ts = 0u32;
        let mut tr_rs = 0u32;

        for t_y in 0..self.tile_height {
            let t_h = self.tile_row_height(t_y);
            let mut tc_rs = tr_rs;

            for t_x in 0..self.tile_width {
                let t_w = self.tile_col_width(t_x);
                let mut rs = tc_rs;

                for _y in 0..t_h {
                    for x in 0..t_w {
                        self.rs_to_ts[(rs + x) as usize] = ts;
                        self.ts_to_rs[ts as usize] = rs + x;
                        ts += 1;
                    }
                    rs += self.ctb_width;
                }
                tc_rs += t_w;
            }
            tr_rs += t_h * self.ctb_width;
        }
    }
}

/// 分配一个预填充的表, 分配失败转为软错误
fn alloc_table(len: usize) -> QiResult<Vec<u32>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| QiError::OutOfMemory(format!("几何表分配失败 ({len} 项)")))?;
    v.resize(len, 0);
    Ok(v)
}

/// 几何缓存: 保存上一次见到的参数集与推导结果
///
/// 分配失败时缓存被标记为无效 (缓存的图像宽度清零), 下一帧必然重建;
/// 调用方必须把无效缓存当作"本帧被拒绝"处理.
#[derive(Debug, Default)]
pub struct GeometryCache {
    sps: Sps,
    pps: Pps,
    geom: Option<Geometry>,
}

impl GeometryCache {
    /// 创建空缓存
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前推导几何; `None` 表示缓存无效
    pub fn geometry(&self) -> Option<&Geometry> {
        self.geom.as_ref()
    }

    /// 缓存的 SPS
    pub fn sps(&self) -> &Sps {
        &self.sps
    }

    /// 缓存的 PPS
    pub fn pps(&self) -> &Pps {
        &self.pps
    }

    /// 参数集变化时重建几何; 返回是否发生了重建
    pub fn update(&mut self, sps: &Sps, pps: &Pps) -> QiResult<bool> {
        let sps_changed = self.sps != *sps;
        if !sps_changed && self.pps == *pps && self.geom.is_some() {
            return Ok(false);
        }

        self.sps = *sps;
        self.pps = *pps;
        match rebuild(sps, pps) {
            Ok(geom) => {
                debug!(
                    "HEVC: 几何重建 {}x{} CTB, {}x{} 瓦片",
                    geom.ctb_width, geom.ctb_height, geom.tile_width, geom.tile_height
                );
                self.geom = Some(geom);
                Ok(true)
            }
            Err(e) => {
                // 置无效, 强制下一帧重试
                self.sps.pic_width_in_luma_samples = 0;
                self.geom = None;
                Err(e)
            }
        }
    }
}

/// 由参数集全量推导几何
fn rebuild(sps: &Sps, pps: &Pps) -> QiResult<Geometry> {
    let log2_ctb_size = sps.log2_ctb_size();
    let ctb_width =
        (sps.pic_width_in_luma_samples + (1 << log2_ctb_size) - 1) >> log2_ctb_size;
    let ctb_height =
        (sps.pic_height_in_luma_samples + (1 << log2_ctb_size) - 1) >> log2_ctb_size;
    let ctb_size = ctb_width * ctb_height;

    let (tile_width, tile_height) = if pps.flags.contains(PpsFlags::TILES_ENABLED) {
        (
            u32::from(pps.num_tile_columns_minus1) + 1,
            u32::from(pps.num_tile_rows_minus1) + 1,
        )
    } else {
        (1, 1)
    };

    let mut geom = Geometry {
        log2_ctb_size,
        ctb_width,
        ctb_height,
        ctb_size,
        tile_width,
        tile_height,
        col_bd: alloc_table(tile_width as usize + 1)?,
        row_bd: alloc_table(tile_height as usize + 1)?,
        rs_to_ts: alloc_table(ctb_size as usize)?,
        ts_to_rs: alloc_table(ctb_size as usize)?,
    };

    geom.col_bd[0] = 0;
    for i in 1..tile_width as usize {
        geom.col_bd[i] = geom.col_bd[i - 1] + u32::from(pps.column_width_minus1[i - 1]) + 1;
    }
    geom.col_bd[tile_width as usize] = ctb_width;

    geom.row_bd[0] = 0;
    for i in 1..tile_height as usize {
        geom.row_bd[i] = geom.row_bd[i - 1] + u32::from(pps.row_height_minus1[i - 1]) + 1;
    }
    geom.row_bd[tile_height as usize] = ctb_height;

    // 边界必须严格递增, 否则扫描表会越界
    if geom.col_bd.windows(2).any(|w| w[0] >= w[1])
        || geom.row_bd.windows(2).any(|w| w[0] >= w[1])
    {
        return Err(QiError::InvalidData("瓦片边界划分非法".into()));
    }

    geom.fill_rs_to_ts();
    Ok(geom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps(width: u32, height: u32) -> Sps {
        Sps {
            pic_width_in_luma_samples: width,
            pic_height_in_luma_samples: height,
            chroma_format_idc: 1,
            // CTB64
            log2_diff_max_min_luma_coding_block_size: 3,
            ..Sps::default()
        }
    }

    fn pps_tiles(cols: &[u8], rows: &[u8]) -> Pps {
        let mut pps = Pps {
            flags: PpsFlags::TILES_ENABLED,
            num_tile_columns_minus1: cols.len() as u8,
            num_tile_rows_minus1: rows.len() as u8,
            ..Pps::default()
        };
        pps.column_width_minus1[..cols.len()].copy_from_slice(cols);
        pps.row_height_minus1[..rows.len()].copy_from_slice(rows);
        pps
    }

    #[test]
    fn test_ctb_grid_1080p() {
        let mut cache = GeometryCache::new();
        cache.update(&sps(1920, 1080), &Pps::default()).unwrap();
        let g = cache.geometry().unwrap();
        assert_eq!(g.ctb_width, 30);
        assert_eq!(g.ctb_height, 17);
        assert_eq!(g.ctb_size, 510);
        assert_eq!(g.tile_width, 1);
        assert_eq!(g.col_bd, vec![0, 30]);
        assert_eq!(g.row_bd, vec![0, 17]);
    }

    #[test]
    fn test_no_rebuild_when_unchanged() {
        let mut cache = GeometryCache::new();
        let s = sps(1920, 1080);
        let p = Pps::default();
        assert!(cache.update(&s, &p).unwrap(), "首次必须重建");
        assert!(!cache.update(&s, &p).unwrap(), "参数未变不应重建");

        // 任何字段变化都触发全量重建, 即使与几何无关
        let mut p2 = p;
        p2.pps_cb_qp_offset = 1;
        assert!(cache.update(&s, &p2).unwrap(), "PPS 字段变化应重建");
    }

    #[test]
    fn test_scan_tables_are_inverse_permutations() {
        // 不均匀 2x2 瓦片划分
        let mut cache = GeometryCache::new();
        cache
            .update(&sps(1920, 1080), &pps_tiles(&[9], &[4]))
            .unwrap();
        let g = cache.geometry().unwrap();
        assert_eq!(g.col_bd, vec![0, 10, 30]);
        assert_eq!(g.row_bd, vec![0, 5, 17]);

        let n = g.ctb_size as usize;
        let mut seen = vec![false; n];
        for rs in 0..n {
            let ts = g.rs_to_ts[rs] as usize;
            assert!(ts < n);
            assert!(!seen[ts], "瓦片扫描地址 {ts} 重复");
            seen[ts] = true;
            assert_eq!(g.ts_to_rs[ts] as usize, rs, "互换表必须互为逆置换");
        }
        assert!(seen.iter().all(|&b| b), "扫描表必须覆盖全部地址");
    }

    #[test]
    fn test_tile_scan_order_within_first_tile() {
        let mut cache = GeometryCache::new();
        cache
            .update(&sps(1920, 1080), &pps_tiles(&[9], &[4]))
            .unwrap();
        let g = cache.geometry().unwrap();
        // 第一个瓦片 (10x5 CTB) 内部按光栅序连续编号
        for y in 0..5u32 {
            for x in 0..10u32 {
                assert_eq!(g.rs_to_ts[(y * 30 + x) as usize], y * 10 + x);
            }
        }
        // 第二个瓦片从第一个瓦片之后继续编号
        assert_eq!(g.rs_to_ts[10], 50);
    }

    #[test]
    fn test_ctb_to_tile_lookup() {
        let mut cache = GeometryCache::new();
        cache
            .update(&sps(1920, 1080), &pps_tiles(&[9], &[4]))
            .unwrap();
        let g = cache.geometry().unwrap();
        assert_eq!(g.ctb_to_tile_x(0), 0);
        assert_eq!(g.ctb_to_tile_x(9), 0);
        assert_eq!(g.ctb_to_tile_x(10), 1);
        assert_eq!(g.ctb_to_tile_x(29), 1);
        assert_eq!(g.ctb_to_tile_y(4), 0);
        assert_eq!(g.ctb_to_tile_y(5), 1);
    }

    #[test]
    fn test_invalid_tile_split_rejected() {
        let mut cache = GeometryCache::new();
        // 列宽超出帧宽: col_bd 不再严格递增
        let bad = pps_tiles(&[40], &[4]);
        assert!(cache.update(&sps(1920, 1080), &bad).is_err());
        assert!(cache.geometry().is_none(), "失败后缓存应无效");
        // 恢复合法参数必须强制重建
        assert!(cache.update(&sps(1920, 1080), &Pps::default()).unwrap());
    }
}
