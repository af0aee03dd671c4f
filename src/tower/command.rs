//! Tower 串口协议命令
//!
//! | 命令 | 名称           | 参数                                  | 回复          |
//! |------|----------------|---------------------------------------|---------------|
//! | 0x04 | 启动值         | 0, 0, 0                               | 5 个身份包    |
//! | 0x07 | Flash 写字节   | 偏移 0-7 (8 = 擦除), 0, 数据          | 无            |
//! | 0x08 | Flash 读字节   | 偏移 0-7, 0, 0                        | `08 偏移 0 值`|
//! | 0x09 | 特殊: 版本     | 'v', 'x', CR                          | 版本包        |
//! | 0x0A | 协议模式       | 1 = 读 / 2 = 写, 模式, 0              | 读时回复      |
//! | 0x0B | Tower 编号     | 1 = 读 / 2 = 写, LSB, MSB             | 读时回复      |
//! | 0x0C | 设置时间       | 时, 分, 秒                            | 无            |
//! | 0x0D | Tower 模式     | 1 = 读 / 2 = 写, LSB, MSB             | 读时回复      |
//!
//! 命令字节第 7 位请求应答: 处理后回显原包，成功时保留第 7 位，失败时清除。

use crate::config::{VERSION_MAJOR, VERSION_MINOR};
use crate::hal::{Board, Rtc, Time};
use crate::packet::Packet;
use crate::util::log::*;

use super::{ProtocolMode, Tower};

/// 命令编号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Startup = 0x04,
    FlashProgram = 0x07,
    FlashRead = 0x08,
    Special = 0x09,
    ProtocolMode = 0x0A,
    TowerNumber = 0x0B,
    Time = 0x0C,
    TowerMode = 0x0D,
    /// 仅 Tower -> PC
    AnalogInput = 0x50,
}

impl Command {
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x04 => Some(Self::Startup),
            0x07 => Some(Self::FlashProgram),
            0x08 => Some(Self::FlashRead),
            0x09 => Some(Self::Special),
            0x0A => Some(Self::ProtocolMode),
            0x0B => Some(Self::TowerNumber),
            0x0C => Some(Self::Time),
            0x0D => Some(Self::TowerMode),
            0x50 => Some(Self::AnalogInput),
            _ => None,
        }
    }

    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }
}

/// 读 / 写子命令 (parameter1)
const GET: u8 = 1;
const SET: u8 = 2;

/// Flash 写字节命令中表示 "擦除扇区" 的偏移
const ERASE_OFFSET: u8 = 8;

impl<B: Board> Tower<B> {
    /// 按命令分发；返回值决定应答包的成功位
    pub async fn dispatch(&self, packet: &Packet) -> bool {
        match Command::from_id(packet.command_id()) {
            Some(Command::Startup) => self.handle_startup(packet).await,
            Some(Command::FlashProgram) => self.handle_flash_program(packet).await,
            Some(Command::FlashRead) => self.handle_flash_read(packet).await,
            Some(Command::Special) => self.handle_special(packet).await,
            Some(Command::ProtocolMode) => self.handle_protocol_mode(packet).await,
            Some(Command::TowerNumber) => self.handle_tower_number(packet).await,
            Some(Command::Time) => self.handle_time(packet),
            Some(Command::TowerMode) => self.handle_tower_mode(packet).await,
            Some(Command::AnalogInput) | None => {
                log_debug!("tower: unsupported command 0x{:x}", packet.command_id());
                false
            }
        }
    }

    // ==================== 处理函数 ====================

    async fn handle_startup(&self, packet: &Packet) -> bool {
        if packet.parameter1 != 0 || packet.parameter23() != 0 {
            return false;
        }
        self.send_startup_values().await;
        true
    }

    async fn handle_flash_program(&self, packet: &Packet) -> bool {
        if packet.parameter2 != 0 || packet.parameter1 > ERASE_OFFSET {
            return false;
        }

        let result = self
            .with_nv(|nv| {
                if packet.parameter1 == ERASE_OFFSET {
                    nv.erase()
                } else {
                    let address = nv.config().data_start + u32::from(packet.parameter1);
                    nv.write_u8(address, packet.parameter3)
                }
            })
            .await;
        if let Err(e) = result {
            log_error!("tower: flash program failed: {}", e);
        }
        result.is_ok()
    }

    async fn handle_flash_read(&self, packet: &Packet) -> bool {
        if packet.parameter23() != 0 || packet.parameter1 >= ERASE_OFFSET {
            return false;
        }

        let read = self
            .with_nv(|nv| {
                let address = nv.config().data_start + u32::from(packet.parameter1);
                nv.read_u8(address)
            })
            .await;
        match read {
            Ok(byte) => {
                self.send(Packet::new(Command::FlashRead.id(), packet.parameter1, 0, byte))
                    .await;
                true
            }
            Err(e) => {
                log_error!("tower: flash read failed: {}", e);
                false
            }
        }
    }

    async fn handle_special(&self, packet: &Packet) -> bool {
        if (packet.parameter1, packet.parameter2, packet.parameter3) != (b'v', b'x', b'\r') {
            return false;
        }
        self.send_version().await;
        true
    }

    async fn handle_protocol_mode(&self, packet: &Packet) -> bool {
        match packet.parameter1 {
            GET if packet.parameter23() == 0 => {
                self.send_protocol_mode().await;
                true
            }
            SET if packet.parameter3 == 0 => match ProtocolMode::from_u8(packet.parameter2) {
                Some(mode) => {
                    self.set_protocol_mode(mode);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    async fn handle_tower_number(&self, packet: &Packet) -> bool {
        match packet.parameter1 {
            GET if packet.parameter23() == 0 => {
                self.send_tower_number().await;
                true
            }
            SET => {
                self.write_nv_u16(self.tower_number.address(), packet.parameter23())
                    .await
            }
            _ => false,
        }
    }

    fn handle_time(&self, packet: &Packet) -> bool {
        match Time::new(packet.parameter1, packet.parameter2, packet.parameter3) {
            Some(time) => {
                self.with_rtc(|rtc| rtc.set(time));
                true
            }
            None => false,
        }
    }

    async fn handle_tower_mode(&self, packet: &Packet) -> bool {
        match packet.parameter1 {
            GET if packet.parameter23() == 0 => {
                self.send_tower_mode().await;
                true
            }
            SET => {
                self.write_nv_u16(self.tower_mode.address(), packet.parameter23())
                    .await
            }
            _ => false,
        }
    }

    async fn write_nv_u16(&self, address: u32, value: u16) -> bool {
        match self.with_nv(|nv| nv.write_u16(address, value)).await {
            Ok(()) => true,
            Err(e) => {
                log_error!("tower: nv write at 0x{:x} failed: {}", address, e);
                false
            }
        }
    }

    // ==================== 发送 ====================

    /// 发送失败 (发送 FIFO 满) 只记录，不影响命令结果
    pub(crate) async fn send(&self, packet: Packet) {
        if !self.codec.put(packet).await {
            log_warn!("tower: tx fifo full, packet 0x{:x} truncated", packet.command);
        }
    }

    /// 启动包、版本、Tower 编号、Tower 模式、协议模式
    pub(crate) async fn send_startup_values(&self) {
        self.send(Packet::new(Command::Startup.id(), 0, 0, 0)).await;
        self.send_version().await;
        self.send_tower_number().await;
        self.send_tower_mode().await;
        self.send_protocol_mode().await;
    }

    async fn send_version(&self) {
        self.send(Packet::new(
            Command::Special.id(),
            b'v',
            VERSION_MAJOR,
            VERSION_MINOR,
        ))
        .await;
    }

    async fn send_tower_number(&self) {
        match self.tower_number().await {
            Ok(number) => {
                self.send(Packet::with_parameter23(Command::TowerNumber.id(), GET, number))
                    .await
            }
            Err(e) => log_error!("tower: tower number read failed: {}", e),
        }
    }

    async fn send_tower_mode(&self) {
        match self.tower_mode().await {
            Ok(mode) => {
                self.send(Packet::with_parameter23(Command::TowerMode.id(), GET, mode))
                    .await
            }
            Err(e) => log_error!("tower: tower mode read failed: {}", e),
        }
    }

    async fn send_protocol_mode(&self) {
        let mode = self.protocol_mode() as u8;
        self.send(Packet::new(Command::ProtocolMode.id(), GET, mode, 0))
            .await;
    }

    pub(crate) async fn send_time(&self) {
        let time = self.with_rtc(|rtc| rtc.get());
        self.send(Packet::new(
            Command::Time.id(),
            time.hours,
            time.minutes,
            time.seconds,
        ))
        .await;
    }
}
