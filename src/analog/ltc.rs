//! LTC1859 外部 ADC (SPI, 16 位)
//!
//! 每次读取两帧: 第一帧写入通道选择命令，第二帧读回转换结果。
//! 帧之间等待转换完成，用 `DelayNs` 代替固定次数的空循环。

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;

use crate::config::ANALOG_NB_INPUTS;
use crate::hal::Adc;
use crate::util::log::*;

/// 单端输入 (不是差分)
const SGL: u8 = 0x80;
/// 量程 ±10V
const GAIN: u8 = 0x04;
/// 通道号在命令字节中的位置
const ODD_SHIFT: u8 = 6;
/// 最短转换/换通道等待时间 (微秒)
pub const CONVERSION_US: u32 = 5;

/// 通道选择命令 (高字节有效)
pub const fn channel_command(channel: u8) -> u16 {
    ((SGL | GAIN | (channel << ODD_SHIFT)) as u16) << 8
}

/// LTC1859 驱动
pub struct LtcAdc<SPI, D> {
    spi: SPI,
    delay: D,
}

impl<SPI, D> LtcAdc<SPI, D>
where
    SPI: SpiDevice<u16>,
    D: DelayNs,
{
    pub fn new(spi: SPI, delay: D) -> Self {
        Self { spi, delay }
    }

    pub fn release(self) -> (SPI, D) {
        (self.spi, self.delay)
    }
}

impl<SPI, D> Adc for LtcAdc<SPI, D>
where
    SPI: SpiDevice<u16>,
    D: DelayNs,
{
    fn read(&mut self, channel: u8) -> Option<i16> {
        if channel as usize >= ANALOG_NB_INPUTS {
            return None;
        }

        if self.spi.write(&[channel_command(channel)]).is_err() {
            log_warn!("ltc: command write failed on channel {}", channel);
            return None;
        }
        self.delay.delay_us(CONVERSION_US);

        let mut frame = [0u16];
        if self.spi.transfer_in_place(&mut frame).is_err() {
            log_warn!("ltc: read failed on channel {}", channel);
            return None;
        }
        self.delay.delay_us(CONVERSION_US);

        Some(frame[0] as i16)
    }
}
