//! 硬件能力接口
//!
//! 内核与协议层只通过这些 trait 接触外设；寄存器级实现属于板级支持包。
//! `sim` 提供 RAM 实现，供宿主机测试与仿真使用。
//!
//! | 接口            | 对应外设                  |
//! |-----------------|---------------------------|
//! | `UartPort`      | 串口 (见 `serial`)        |
//! | `NorFlash`      | 片上 Flash (embedded-storage) |
//! | `Adc`           | 外部 SPI ADC              |
//! | `Rtc`           | 秒计数实时时钟            |
//! | `PeriodicTimer` | PIT 周期定时器            |
//! | `FtmHw`         | FlexTimer 比较/捕获通道   |
//! | `Leds`          | 板载 LED                  |

use embedded_storage::nor_flash::NorFlash;

use crate::serial::UartPort;

pub mod ftm;
pub mod pit;
pub mod sim;

pub use ftm::{Ftm, TimerChannel, TimerFunction};
pub use pit::Pit;

/// 中断回调
///
/// 代替 "函数指针 + 参数" 的注册方式，每个使用点实现一次
pub trait Callback {
    fn on_fire(&self);
}

/// 模拟量输入
pub trait Adc {
    /// 读取一个通道；无数据或传输失败返回 `None`
    fn read(&mut self, channel: u8) -> Option<i16>;
}

// ===== LED =====

/// 板载 LED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum Led {
    Orange,
    Yellow,
    Green,
    Blue,
}

impl Led {
    pub const ALL: [Led; 4] = [Led::Orange, Led::Yellow, Led::Green, Led::Blue];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

pub trait Leds {
    fn on(&mut self, led: Led);
    fn off(&mut self, led: Led);
    fn toggle(&mut self, led: Led);
}

// ===== RTC =====

/// 一天中的时刻
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct Time {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl Time {
    /// 校验范围: 时 0-23，分 0-59，秒 0-59
    pub const fn new(hours: u8, minutes: u8, seconds: u8) -> Option<Self> {
        if hours < 24 && minutes < 60 && seconds < 60 {
            Some(Self {
                hours,
                minutes,
                seconds,
            })
        } else {
            None
        }
    }

    pub const fn to_seconds(self) -> u32 {
        self.hours as u32 * 3600 + self.minutes as u32 * 60 + self.seconds as u32
    }

    /// 由秒计数换算，超过一天后从 0 点重新开始
    pub const fn from_seconds(total: u32) -> Self {
        let of_day = total % 86_400;
        Self {
            hours: (of_day / 3600) as u8,
            minutes: (of_day % 3600 / 60) as u8,
            seconds: (of_day % 60) as u8,
        }
    }
}

/// 秒计数 RTC
pub trait Rtc {
    fn set_seconds(&mut self, seconds: u32);
    fn seconds(&self) -> u32;

    fn set(&mut self, time: Time) {
        self.set_seconds(time.to_seconds());
    }

    fn get(&self) -> Time {
        Time::from_seconds(self.seconds())
    }
}

// ===== 定时器 =====

/// 周期定时器硬件
pub trait PeriodicTimer {
    /// 装载计数周期 (模块时钟周期数)
    fn load(&mut self, cycles: u32);
    fn enable(&mut self, enabled: bool);
    /// 读取并清除中断标志
    fn take_interrupt(&mut self) -> bool;
}

/// FlexTimer 硬件
pub trait FtmHw {
    /// 自由运行计数器当前值
    fn counter(&self) -> u16;
    /// 设置通道功能并使能通道中断
    fn configure(&mut self, channel: u8, function: TimerFunction);
    fn set_compare(&mut self, channel: u8, value: u16);
    /// 取出一个已触发的通道并清除其标志
    fn take_pending(&mut self) -> Option<u8>;
    /// 触发后断开通道的输出动作
    fn detach(&mut self, channel: u8);
}

// ===== 板级组合 =====

/// 一块板子的外设类型集合
pub trait Board {
    type Uart: UartPort;
    type Flash: NorFlash;
    type Adc: Adc;
    type Rtc: Rtc;
    type Leds: Leds;
    type Pit: PeriodicTimer;
    type Ftm: FtmHw;
}

/// 交给 `Tower` 的外设实例
pub struct Peripherals<B: Board> {
    pub uart: B::Uart,
    pub flash: B::Flash,
    pub adc: B::Adc,
    pub rtc: B::Rtc,
    pub leds: B::Leds,
    pub pit: B::Pit,
    pub ftm: B::Ftm,
}
