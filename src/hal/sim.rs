//! RAM 仿真外设
//!
//! 行为尽量贴近真实硬件的可观察部分 (Flash 只能清位、比较通道只触发一次等)，
//! 用于宿主机测试和离线仿真。

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};
use heapless::{Deque, Vec};

use super::{Adc, Board, FtmHw, Led, Leds, Peripherals, PeriodicTimer, Rtc, TimerFunction};
use crate::config::{ANALOG_NB_INPUTS, FTM_NB_CHANNELS};
use crate::flash::{NvConfig, PHRASE_SIZE};
use crate::serial::{BaudDivisor, UartPort};

// ===================================================================
// UART
// ===================================================================

/// 仿真 UART: 接收队列由测试注入，发送字节被记录
pub struct SimUart {
    rx: Deque<u8, 512>,
    tx: Vec<u8, 2048>,
    tx_interrupt: bool,
    divisor: Option<BaudDivisor>,
}

impl SimUart {
    pub const fn new() -> Self {
        Self {
            rx: Deque::new(),
            tx: Vec::new(),
            tx_interrupt: false,
            divisor: None,
        }
    }

    /// 注入接收字节，队列满时丢弃多余部分
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.rx.push_back(b).is_err() {
                break;
            }
        }
    }

    /// 已发送的全部字节
    pub fn transmitted(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_transmitted(&mut self) {
        self.tx.clear();
    }

    pub fn tx_interrupt_enabled(&self) -> bool {
        self.tx_interrupt
    }

    pub fn divisor(&self) -> Option<BaudDivisor> {
        self.divisor
    }
}

impl Default for SimUart {
    fn default() -> Self {
        Self::new()
    }
}

impl UartPort for SimUart {
    fn configure(&mut self, divisor: BaudDivisor) {
        self.divisor = Some(divisor);
    }

    fn read(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn tx_ready(&self) -> bool {
        !self.tx.is_full()
    }

    fn write(&mut self, byte: u8) {
        let _ = self.tx.push(byte);
    }

    fn set_tx_interrupt(&mut self, enabled: bool) {
        self.tx_interrupt = enabled;
    }
}

// ===================================================================
// Flash
// ===================================================================

/// 仿真扇区大小
pub const SIM_SECTOR_SIZE: usize = 4096;

/// 仿真 NOR Flash，地址空间为 `base..base + SIZE`
///
/// 编程只能清位 (按位与)，擦除把整扇区置为 0xFF
pub struct SimFlash<const SIZE: usize> {
    base: u32,
    data: [u8; SIZE],
    erase_count: u32,
    program_count: u32,
    fail_program: bool,
}

impl<const SIZE: usize> SimFlash<SIZE> {
    pub fn new(base: u32) -> Self {
        assert!(SIZE % SIM_SECTOR_SIZE == 0, "SIZE must be whole sectors");
        Self {
            base,
            data: [0xFF; SIZE],
            erase_count: 0,
            program_count: 0,
            fail_program: false,
        }
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn program_count(&self) -> u32 {
        self.program_count
    }

    /// 下一次编程报告访问错误
    pub fn fail_next_program(&mut self) {
        self.fail_program = true;
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
        let start = offset
            .checked_sub(self.base)
            .ok_or(NorFlashErrorKind::OutOfBounds)? as usize;
        let end = start + len;
        if end > SIZE {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl<const SIZE: usize> ErrorType for SimFlash<SIZE> {
    type Error = NorFlashErrorKind;
}

impl<const SIZE: usize> ReadNorFlash for SimFlash<SIZE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.base as usize + SIZE
    }
}

impl<const SIZE: usize> NorFlash for SimFlash<SIZE> {
    const WRITE_SIZE: usize = PHRASE_SIZE;
    const ERASE_SIZE: usize = SIM_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if to < from || from as usize % SIM_SECTOR_SIZE != 0 || to as usize % SIM_SECTOR_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.data[range].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % PHRASE_SIZE != 0 || bytes.len() % PHRASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;
        if core::mem::take(&mut self.fail_program) {
            return Err(NorFlashErrorKind::Other);
        }
        for (cell, &b) in self.data[range].iter_mut().zip(bytes) {
            *cell &= b;
        }
        self.program_count += 1;
        Ok(())
    }
}

// ===================================================================
// ADC / RTC / LED
// ===================================================================

/// 仿真 ADC: 每个通道返回设定值
pub struct SimAdc {
    values: [i16; ANALOG_NB_INPUTS],
    failing: bool,
}

impl SimAdc {
    pub const fn new() -> Self {
        Self {
            values: [0; ANALOG_NB_INPUTS],
            failing: false,
        }
    }

    pub fn set(&mut self, channel: u8, value: i16) {
        if let Some(v) = self.values.get_mut(channel as usize) {
            *v = value;
        }
    }

    pub fn fail(&mut self, failing: bool) {
        self.failing = failing;
    }
}

impl Default for SimAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl Adc for SimAdc {
    fn read(&mut self, channel: u8) -> Option<i16> {
        if self.failing {
            return None;
        }
        self.values.get(channel as usize).copied()
    }
}

/// 仿真 RTC
#[derive(Default)]
pub struct SimRtc {
    seconds: u32,
}

impl SimRtc {
    pub const fn new() -> Self {
        Self { seconds: 0 }
    }

    pub fn advance(&mut self, seconds: u32) {
        self.seconds = self.seconds.wrapping_add(seconds);
    }
}

impl Rtc for SimRtc {
    fn set_seconds(&mut self, seconds: u32) {
        self.seconds = seconds;
    }

    fn seconds(&self) -> u32 {
        self.seconds
    }
}

/// 仿真 LED: 记录亮灭与翻转次数
#[derive(Default)]
pub struct SimLeds {
    lit: [bool; 4],
    toggles: [u32; 4],
}

impl SimLeds {
    pub const fn new() -> Self {
        Self {
            lit: [false; 4],
            toggles: [0; 4],
        }
    }

    pub fn is_on(&self, led: Led) -> bool {
        self.lit[led.index()]
    }

    pub fn toggle_count(&self, led: Led) -> u32 {
        self.toggles[led.index()]
    }
}

impl Leds for SimLeds {
    fn on(&mut self, led: Led) {
        self.lit[led.index()] = true;
    }

    fn off(&mut self, led: Led) {
        self.lit[led.index()] = false;
    }

    fn toggle(&mut self, led: Led) {
        self.lit[led.index()] ^= true;
        self.toggles[led.index()] += 1;
    }
}

// ===================================================================
// 定时器
// ===================================================================

/// 仿真周期定时器: `fire` 置位中断标志
#[derive(Default)]
pub struct SimTimer {
    loaded: Option<u32>,
    enabled: bool,
    pending: bool,
}

impl SimTimer {
    pub const fn new() -> Self {
        Self {
            loaded: None,
            enabled: false,
            pending: false,
        }
    }

    pub fn loaded(&self) -> Option<u32> {
        self.loaded
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fire(&mut self) {
        self.pending = true;
    }
}

impl PeriodicTimer for SimTimer {
    fn load(&mut self, cycles: u32) {
        self.loaded = Some(cycles);
    }

    fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn take_interrupt(&mut self) -> bool {
        core::mem::take(&mut self.pending)
    }
}

/// 仿真 FlexTimer
///
/// 16 位自由计数；比较值写入后，计数器走过比较点时触发一次
pub struct SimFtm {
    counter: u16,
    functions: [Option<TimerFunction>; FTM_NB_CHANNELS],
    /// 距离比较点还剩的计数
    remaining: [Option<u32>; FTM_NB_CHANNELS],
    pending: u8,
}

impl SimFtm {
    pub const fn new() -> Self {
        Self {
            counter: 0,
            functions: [None; FTM_NB_CHANNELS],
            remaining: [None; FTM_NB_CHANNELS],
            pending: 0,
        }
    }

    /// 计数器前进 `counts` 个周期
    pub fn advance(&mut self, counts: u32) {
        self.counter = self.counter.wrapping_add(counts as u16);
        for (channel, remaining) in self.remaining.iter_mut().enumerate() {
            if let Some(left) = remaining {
                if counts >= *left {
                    *remaining = None;
                    self.pending |= 1 << channel;
                } else {
                    *left -= counts;
                }
            }
        }
    }

    pub fn function(&self, channel: u8) -> Option<TimerFunction> {
        self.functions.get(channel as usize).copied().flatten()
    }
}

impl Default for SimFtm {
    fn default() -> Self {
        Self::new()
    }
}

impl FtmHw for SimFtm {
    fn counter(&self) -> u16 {
        self.counter
    }

    fn configure(&mut self, channel: u8, function: TimerFunction) {
        if let Some(f) = self.functions.get_mut(channel as usize) {
            *f = Some(function);
        }
    }

    fn set_compare(&mut self, channel: u8, value: u16) {
        let distance = match value.wrapping_sub(self.counter) {
            0 => 1 << 16,
            d => u32::from(d),
        };
        if let Some(r) = self.remaining.get_mut(channel as usize) {
            *r = Some(distance);
        }
    }

    fn take_pending(&mut self) -> Option<u8> {
        if self.pending == 0 {
            return None;
        }
        let channel = self.pending.trailing_zeros() as u8;
        self.pending &= !(1 << channel);
        Some(channel)
    }

    fn detach(&mut self, channel: u8) {
        if let Some(r) = self.remaining.get_mut(channel as usize) {
            *r = None;
        }
    }
}

// ===================================================================
// 仿真板
// ===================================================================

/// 仿真 Flash 容量: 从保留区起始的一个扇区
pub type SimBoardFlash = SimFlash<SIM_SECTOR_SIZE>;

/// 全部由仿真外设组成的板子
pub struct SimBoard;

impl Board for SimBoard {
    type Uart = SimUart;
    type Flash = SimBoardFlash;
    type Adc = SimAdc;
    type Rtc = SimRtc;
    type Leds = SimLeds;
    type Pit = SimTimer;
    type Ftm = SimFtm;
}

impl SimBoard {
    /// 新的仿真外设，Flash 覆盖默认保留区
    pub fn peripherals() -> Peripherals<SimBoard> {
        Peripherals {
            uart: SimUart::new(),
            flash: SimFlash::new(NvConfig::default().data_start),
            adc: SimAdc::new(),
            rtc: SimRtc::new(),
            leds: SimLeds::new(),
            pit: SimTimer::new(),
            ftm: SimFtm::new(),
        }
    }
}
