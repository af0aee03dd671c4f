//! 非易失小变量存储
//!
//! 所有变量挤在一个 8 字节短语里，按 1/2/4 字节自然对齐首次适配分配。
//! 分配位图不落盘: 启动代码按固定顺序分配，每次启动得到相同的地址。
//!
//! 写入永远是整短语的读-改-擦-写:
//!
//! ```text
//! 读出整个短语 → 在副本中修改目标区域 → 擦除扇区 → 编程整个短语
//! ```
//!
//! Flash 编程只能把 1 变成 0，0 变回 1 只能靠擦除，所以不能就地局部修改。

use embedded_storage::nor_flash::NorFlash;

use super::storage::{FlashOp, NvConfig, StorageError, PHRASE_SIZE};
use crate::util::log::*;

/// 已分配的变量位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct NvSlot {
    address: u32,
    size: u8,
}

impl NvSlot {
    /// 驱动地址空间内的绝对地址
    #[inline]
    pub const fn address(&self) -> u32 {
        self.address
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size as usize
    }
}

/// 非易失存储
pub struct NvStore<F> {
    flash: F,
    config: NvConfig,
    /// 每位对应短语中的一个字节
    allocated: u8,
}

impl<F: NorFlash> NvStore<F> {
    /// 创建存储，校验驱动几何参数
    pub fn new(flash: F, config: NvConfig) -> Result<Self, StorageError> {
        config.validate(flash.capacity(), F::WRITE_SIZE, F::ERASE_SIZE)?;
        Ok(Self {
            flash,
            config,
            allocated: 0,
        })
    }

    pub fn config(&self) -> &NvConfig {
        &self.config
    }

    /// 分配一个 1/2/4 字节的变量
    ///
    /// 首次适配、自然对齐；空间不足或尺寸非法返回 `None`。
    /// 分配出的区域在本次运行内不会回收。
    pub fn allocate(&mut self, size: usize) -> Option<NvSlot> {
        if !matches!(size, 1 | 2 | 4) {
            return None;
        }

        // size 个低位为 1: 2 => 0b0000_0011
        let base_mask = ((1u16 << size) - 1) as u8;
        let offset = (0..PHRASE_SIZE)
            .step_by(size)
            .find(|&offset| self.allocated & (base_mask << offset) == 0)?;

        self.allocated |= base_mask << offset;
        let slot = NvSlot {
            address: self.config.data_start + offset as u32,
            size: size as u8,
        };
        log_debug!("nv: allocated {} bytes at offset {}", size, offset);
        Some(slot)
    }

    /// 读取整个保留短语
    pub fn read_phrase(&mut self) -> Result<[u8; PHRASE_SIZE], StorageError> {
        let mut phrase = [0u8; PHRASE_SIZE];
        self.flash
            .read(self.config.data_start, &mut phrase)
            .map_err(|e| StorageError::from_driver(e, FlashOp::Read))?;
        Ok(phrase)
    }

    /// 写入 1/2/4 字节 (小端) 到保留短语内的 `address`
    ///
    /// 地址必须在保留区内且按数据尺寸对齐
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StorageError> {
        let size = data.len();
        if !matches!(size, 1 | 2 | 4) {
            return Err(StorageError::InvalidSize);
        }
        if address < self.config.data_start || address + size as u32 > self.config.data_end() {
            return Err(StorageError::OutOfBounds);
        }
        if address % size as u32 != 0 {
            return Err(StorageError::AlignmentError);
        }

        let offset = (address - self.config.data_start) as usize;
        let mut phrase = self.read_phrase()?;
        phrase[offset..offset + size].copy_from_slice(data);

        self.erase()?;
        self.flash
            .write(self.config.data_start, &phrase)
            .map_err(|e| {
                log_error!("nv: phrase program failed");
                StorageError::from_driver(e, FlashOp::Program)
            })
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> Result<(), StorageError> {
        self.write(address, &[value])
    }

    pub fn write_u16(&mut self, address: u32, value: u16) -> Result<(), StorageError> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), StorageError> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn read_u8(&mut self, address: u32) -> Result<u8, StorageError> {
        let mut buf = [0u8; 1];
        self.read_into(address, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, address: u32) -> Result<u16, StorageError> {
        let mut buf = [0u8; 2];
        self.read_into(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, address: u32) -> Result<u32, StorageError> {
        let mut buf = [0u8; 4];
        self.read_into(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// 擦除保留扇区 (全部置 1)
    pub fn erase(&mut self) -> Result<(), StorageError> {
        let from = self.config.data_start;
        let to = from + self.config.sector_size;
        self.flash.erase(from, to).map_err(|e| {
            log_error!("nv: sector erase failed");
            StorageError::from_driver(e, FlashOp::Erase)
        })
    }

    /// 底层驱动
    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    fn read_into(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        if address < self.config.data_start || address + buf.len() as u32 > self.config.data_end() {
            return Err(StorageError::OutOfBounds);
        }
        let phrase = self.read_phrase()?;
        let offset = (address - self.config.data_start) as usize;
        buf.copy_from_slice(&phrase[offset..offset + buf.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimFlash;

    const START: u32 = 0x0008_0000;

    fn store() -> NvStore<SimFlash<4096>> {
        NvStore::new(SimFlash::new(START), NvConfig::default()).unwrap()
    }

    #[test]
    fn test_allocations_are_disjoint_and_aligned() {
        let mut nv = store();
        let slots: std::vec::Vec<NvSlot> = [1, 2, 1, 4]
            .iter()
            .map(|&size| nv.allocate(size).unwrap())
            .collect();

        let offsets: std::vec::Vec<u32> = slots.iter().map(|s| s.address() - START).collect();
        assert_eq!(offsets, [0, 2, 1, 4]);

        for (i, a) in slots.iter().enumerate() {
            assert_eq!(a.address() % a.size() as u32, 0);
            for b in &slots[i + 1..] {
                let a_end = a.address() + a.size() as u32;
                let b_end = b.address() + b.size() as u32;
                assert!(a_end <= b.address() || b_end <= a.address());
            }
        }
        assert_eq!(nv.allocate(1), None);
    }

    #[test]
    fn test_exhaustion_and_invalid_sizes() {
        let mut nv = store();
        assert_eq!(nv.allocate(3), None);
        assert_eq!(nv.allocate(8), None);
        assert!(nv.allocate(4).is_some());
        assert!(nv.allocate(4).is_some());
        assert_eq!(nv.allocate(1), None);
        assert_eq!(nv.allocate(2), None);
    }

    #[test]
    fn test_fragmentation_blocks_larger_sizes() {
        let mut nv = store();
        // 字节 0 和 4 被占用后，不再有对齐的 4 字节空洞
        let a = nv.allocate(1).unwrap();
        let _ = nv.allocate(2).unwrap();
        let _ = nv.allocate(1).unwrap();
        let _ = nv.allocate(1).unwrap();
        assert_eq!(a.address(), START);
        assert_eq!(nv.allocate(4), None);
        assert_eq!(nv.allocate(2).map(|s| s.address() - START), Some(6));
    }

    #[test]
    fn test_write_preserves_other_regions() {
        let mut nv = store();
        let mode = nv.allocate(2).unwrap();
        let number = nv.allocate(2).unwrap();
        let flag = nv.allocate(1).unwrap();

        nv.write_u16(mode.address(), 1).unwrap();
        nv.write_u16(number.address(), 4718).unwrap();
        nv.write_u8(flag.address(), 0x5A).unwrap();
        // 把位从 0 改回 1 也必须成功
        nv.write_u16(mode.address(), 0xFFFE).unwrap();

        assert_eq!(nv.read_u16(mode.address()), Ok(0xFFFE));
        assert_eq!(nv.read_u16(number.address()), Ok(4718));
        assert_eq!(nv.read_u8(flag.address()), Ok(0x5A));
        assert_eq!(
            nv.read_phrase().unwrap(),
            [0xFE, 0xFF, 0x6E, 0x12, 0x5A, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(nv.flash().erase_count(), 4);
    }

    #[test]
    fn test_write_validation() {
        let mut nv = store();
        assert_eq!(nv.write(START + 8, &[1]), Err(StorageError::OutOfBounds));
        assert_eq!(nv.write(START - 1, &[1]), Err(StorageError::OutOfBounds));
        assert_eq!(nv.write(START + 1, &[1, 2]), Err(StorageError::AlignmentError));
        assert_eq!(nv.write(START + 6, &[0; 4]), Err(StorageError::OutOfBounds));
        assert_eq!(nv.write(START, &[0; 3]), Err(StorageError::InvalidSize));
        assert_eq!(nv.flash().erase_count(), 0);
    }

    #[test]
    fn test_erase_sets_all_ones() {
        let mut nv = store();
        nv.write_u32(START + 4, 0).unwrap();
        nv.erase().unwrap();
        assert_eq!(nv.read_phrase(), Ok([0xFF; PHRASE_SIZE]));
    }

    #[test]
    fn test_program_failure_is_reported() {
        let mut nv = store();
        nv.flash_mut().fail_next_program();
        assert_eq!(nv.write_u8(START, 7), Err(StorageError::ProgramError));
        assert_eq!(nv.write_u8(START, 7), Ok(()));
        assert_eq!(nv.read_u8(START), Ok(7));
    }
}
