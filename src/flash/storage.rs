//! Flash 存储错误与配置
//!
//! 驱动层统一走 `embedded_storage::nor_flash::NorFlash`，
//! 这里把驱动错误归并成本 crate 的 `StorageError`。

use core::fmt;

use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

/// 一次编程操作的最小单位 (字节)
pub const PHRASE_SIZE: usize = 8;

/// 存储操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum StorageError {
    /// 地址越界
    OutOfBounds,
    /// 对齐错误
    AlignmentError,
    /// 只支持 1/2/4 字节
    InvalidSize,
    /// 编程失败 (保护违例或访问错误)
    ProgramError,
    /// 擦除失败
    EraseError,
    /// 读取失败
    ReadError,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds => write!(f, "Address out of bounds"),
            Self::AlignmentError => write!(f, "Address alignment error"),
            Self::InvalidSize => write!(f, "Invalid access size"),
            Self::ProgramError => write!(f, "Flash program error"),
            Self::EraseError => write!(f, "Flash erase error"),
            Self::ReadError => write!(f, "Flash read error"),
        }
    }
}

/// 驱动操作类别，用于 `Other` 错误的归类
#[derive(Debug, Clone, Copy)]
pub(crate) enum FlashOp {
    Read,
    Program,
    Erase,
}

impl StorageError {
    pub(crate) fn from_driver<E: NorFlashError>(err: E, op: FlashOp) -> Self {
        match err.kind() {
            NorFlashErrorKind::NotAligned => Self::AlignmentError,
            NorFlashErrorKind::OutOfBounds => Self::OutOfBounds,
            _ => match op {
                FlashOp::Read => Self::ReadError,
                FlashOp::Program => Self::ProgramError,
                FlashOp::Erase => Self::EraseError,
            },
        }
    }
}

/// 非易失变量区配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvConfig {
    /// 保留短语的起始地址 (驱动地址空间内，按扇区对齐)
    pub data_start: u32,
    /// 扇区大小 (擦除单位)
    pub sector_size: u32,
}

impl Default for NvConfig {
    fn default() -> Self {
        Self {
            data_start: 0x0008_0000, // 程序 Flash 第 2 块起始
            sector_size: 4096,
        }
    }
}

impl NvConfig {
    /// 保留区结束地址 (不含)
    #[inline]
    pub const fn data_end(&self) -> u32 {
        self.data_start + PHRASE_SIZE as u32
    }

    /// 校验配置与驱动几何参数是否匹配
    pub fn validate(&self, capacity: usize, write_size: usize, erase_size: usize) -> Result<(), StorageError> {
        if write_size == 0 || PHRASE_SIZE % write_size != 0 {
            return Err(StorageError::AlignmentError);
        }
        if erase_size == 0 || self.sector_size as usize % erase_size != 0 {
            return Err(StorageError::AlignmentError);
        }
        if self.data_start % self.sector_size != 0 {
            return Err(StorageError::AlignmentError);
        }
        if self.data_start as usize + self.sector_size as usize > capacity {
            return Err(StorageError::OutOfBounds);
        }
        Ok(())
    }
}
