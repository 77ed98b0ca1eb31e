use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::cells::MAX_CELLS;
use crate::error::CacheError;
use crate::hash::next_prime;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const DEFAULT_MIN_PAGES: usize = 8;
pub const DEFAULT_MAX_PAGES: usize = 64;
pub const DEFAULT_DELTA_PAGES: usize = 8;
pub const DEFAULT_HASH_SIZE: usize = 2048;
pub const DEFAULT_CELLS_NUM: usize = 30;
pub const DEFAULT_MIN_TTL: u32 = 1;
/// 页数上限的上限。
pub const MAX_PAGES: usize = 1 << 20;
pub const MAX_HASH_SIZE: usize = 1 << 24;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RrcacheConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub cache: CacheParams,
    /// 查询时依次尝试的域名后缀，最多 31 个。
    #[serde(default)]
    pub domain_suffixes: Vec<String>,
}

/// 缓存参数。任一数值为 0 表示取缺省值，见 [`CacheParams::resolve`]。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheParams {
    /// 页大小（字节），缺省 4096，最小 512。
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 启动时预分配的页数。
    #[serde(default = "default_min_pages")]
    pub min_pages: usize,
    /// 页数上限。
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// 每次扩容的页数。
    #[serde(default = "default_delta_pages")]
    pub delta_pages: usize,
    /// 哈希表大小，实际取不小于该值的素数。
    #[serde(default = "default_hash_size")]
    pub hash_size: usize,
    /// 可缓存的最小TTL（秒）。
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    /// 过期单元数量，最大TTL为 min_ttl << (cells_num - 1)。
    #[serde(default = "default_cells_num")]
    pub cells_num: usize,
    /// 本地hosts文件，先于缓存查询，变更后自动重载。
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            min_pages: default_min_pages(),
            max_pages: default_max_pages(),
            delta_pages: default_delta_pages(),
            hash_size: default_hash_size(),
            min_ttl: default_min_ttl(),
            cells_num: default_cells_num(),
            hosts_file: None,
        }
    }
}

/// Parameters after defaults and bounds are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedParams {
    pub page_size: usize,
    pub min_pages: usize,
    pub max_pages: usize,
    pub delta_pages: usize,
    pub hash_size: usize,
    pub min_ttl: u32,
    pub cells_num: usize,
}

impl CacheParams {
    pub fn resolve(&self) -> Result<ResolvedParams, CacheError> {
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n if n < MIN_PAGE_SIZE => MIN_PAGE_SIZE,
            n => n,
        };
        if page_size > u16::MAX as usize {
            return Err(CacheError::BadParam(format!(
                "page_size {page_size} exceeds {}",
                u16::MAX
            )));
        }

        let (min_pages, max_pages) = match (self.min_pages, self.max_pages) {
            (0, 0) => (DEFAULT_MIN_PAGES, DEFAULT_MAX_PAGES),
            (0, max) => (max, max),
            (min, 0) => (min, min),
            (min, max) => (min, max),
        };
        if max_pages < min_pages {
            return Err(CacheError::BadParam(format!(
                "max_pages {max_pages} is less than min_pages {min_pages}"
            )));
        }

        if max_pages > MAX_PAGES {
            return Err(CacheError::BadParam(format!(
                "max_pages {max_pages} exceeds {MAX_PAGES}"
            )));
        }

        let delta_pages = match self.delta_pages {
            0 => DEFAULT_DELTA_PAGES,
            n => n,
        };
        let hash_size = match self.hash_size {
            0 => DEFAULT_HASH_SIZE,
            n => n,
        };
        let cells_num = match self.cells_num {
            0 => DEFAULT_CELLS_NUM,
            n => n,
        };
        if cells_num > MAX_CELLS {
            return Err(CacheError::BadParam(format!(
                "cells_num {cells_num} exceeds {MAX_CELLS}"
            )));
        }
        if hash_size > MAX_HASH_SIZE {
            return Err(CacheError::BadParam(format!(
                "hash_size {hash_size} exceeds {MAX_HASH_SIZE}"
            )));
        }
        let min_ttl = match self.min_ttl {
            0 => DEFAULT_MIN_TTL,
            n => n,
        };

        Ok(ResolvedParams {
            page_size,
            min_pages,
            max_pages,
            delta_pages,
            hash_size: next_prime(hash_size),
            min_ttl,
            cells_num,
        })
    }
}

pub fn load_config(path: &Path) -> Result<RrcacheConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: RrcacheConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // 提前校验参数，避免运行时才发现错误。
    cfg.cache
        .resolve()
        .with_context(|| format!("invalid cache parameters in {}", path.display()))?;
    if cfg.domain_suffixes.len() > 31 {
        anyhow::bail!(
            "at most 31 domain suffixes are supported, got {}",
            cfg.domain_suffixes.len()
        );
    }

    Ok(cfg)
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_min_pages() -> usize {
    DEFAULT_MIN_PAGES
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

fn default_delta_pages() -> usize {
    DEFAULT_DELTA_PAGES
}

fn default_hash_size() -> usize {
    DEFAULT_HASH_SIZE
}

fn default_min_ttl() -> u32 {
    DEFAULT_MIN_TTL
}

fn default_cells_num() -> usize {
    DEFAULT_CELLS_NUM
}
