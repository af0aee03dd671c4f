//! 串口通道
//!
//! 硬件 UART 之上的字节流: 接收/发送各一个 FIFO。
//! 中断 (或轮询) 在数据寄存器和 FIFO 之间搬运字节，线程只接触 FIFO。
//!
//! ```text
//! UART RX ──on_interrupt──► rx Fifo ──in_char──► 协议线程
//! 协议线程 ──out_char──► tx Fifo ──on_interrupt──► UART TX
//! ```

use core::cell::RefCell;

use crate::config::FIFO_SIZE;
use crate::kernel::{Kernel, KernelError};
use crate::sync::primitives::CriticalMutex;
use crate::sync::Fifo;
use crate::util::log::*;

/// UART 硬件能力
pub trait UartPort {
    /// 设置波特率分频并使能收发
    fn configure(&mut self, divisor: BaudDivisor);
    /// 接收数据寄存器满时取出一个字节
    fn read(&mut self) -> Option<u8>;
    /// 发送数据寄存器空
    fn tx_ready(&self) -> bool;
    /// 写发送数据寄存器
    fn write(&mut self, byte: u8);
    /// 发送寄存器空中断使能
    fn set_tx_interrupt(&mut self, enabled: bool);
}

/// 支持的波特率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum BaudRate {
    #[default]
    Baud38400,
    Baud115200,
}

impl BaudRate {
    /// 每秒比特数
    pub const fn bps(self) -> u32 {
        match self {
            Self::Baud38400 => 38_400,
            Self::Baud115200 => 115_200,
        }
    }
}

/// UART 分频: 13 位 SBR + 5 位小数微调 (BRFA, 单位 1/32)
///
/// baud = clock / (16 * (SBR + BRFA / 32))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct BaudDivisor {
    pub sbr: u16,
    pub brfa: u8,
}

impl BaudDivisor {
    /// 由模块时钟计算分频，全部整数运算
    pub const fn compute(module_clock_hz: u32, baud: BaudRate) -> Self {
        // 32 * (SBR + BRFA/32) = 2 * clock / baud
        let scaled = (2 * module_clock_hz as u64) / baud.bps() as u64;
        Self {
            sbr: ((scaled / 32) & 0x1FFF) as u16,
            brfa: (scaled % 32) as u8,
        }
    }
}

/// 串口通道
pub struct SerialChannel<P> {
    port: CriticalMutex<RefCell<P>>,
    rx: Fifo<FIFO_SIZE>,
    tx: Fifo<FIFO_SIZE>,
}

impl<P: UartPort> SerialChannel<P> {
    /// 初始化 FIFO 并配置 UART
    pub fn new(
        kernel: &'static Kernel,
        mut port: P,
        baud: BaudRate,
        module_clock_hz: u32,
    ) -> Result<Self, KernelError> {
        let divisor = BaudDivisor::compute(module_clock_hz, baud);
        port.configure(divisor);
        log_info!("uart: {} bps, sbr={} brfa={}", baud.bps(), divisor.sbr, divisor.brfa);

        Ok(Self {
            port: CriticalMutex::new(RefCell::new(port)),
            rx: Fifo::new(kernel)?,
            tx: Fifo::new(kernel)?,
        })
    }

    /// 非阻塞接收
    #[inline]
    pub fn try_in_char(&self) -> Option<u8> {
        self.rx.try_get()
    }

    /// 阻塞接收: 挂起直到收到字节
    pub async fn in_char(&self) -> u8 {
        self.rx.blocking_get().await
    }

    /// 放入发送 FIFO 并打开发送中断
    ///
    /// FIFO 满时返回 `false`
    pub fn out_char(&self, byte: u8) -> bool {
        if !self.tx.try_put(byte) {
            log_warn!("uart: tx fifo full, dropping 0x{:x}", byte);
            return false;
        }
        self.with_port(|port| port.set_tx_interrupt(true));
        true
    }

    /// 轮询模式: 每次最多搬运一个接收字节和一个发送字节
    pub fn poll(&self) {
        self.with_port(|port| {
            if let Some(byte) = port.read() {
                self.receive(byte);
            }
            if port.tx_ready() {
                if let Some(byte) = self.tx.try_get() {
                    port.write(byte);
                }
            }
        });
    }

    /// 中断服务: 取空接收寄存器，填满发送寄存器
    ///
    /// 发送 FIFO 取空后关闭发送中断，避免空中断反复触发
    pub fn on_interrupt(&self) {
        self.with_port(|port| {
            while let Some(byte) = port.read() {
                self.receive(byte);
            }
            while port.tx_ready() {
                match self.tx.try_get() {
                    Some(byte) => port.write(byte),
                    None => {
                        port.set_tx_interrupt(false);
                        break;
                    }
                }
            }
        });
    }

    /// 在临界区内访问底层端口
    pub fn with_port<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        self.port.lock(|port| f(&mut port.borrow_mut()))
    }

    /// 接收 FIFO 中等待处理的字节数
    pub fn rx_pending(&self) -> usize {
        self.rx.len()
    }

    /// 发送 FIFO 中尚未写入硬件的字节数
    pub fn tx_pending(&self) -> usize {
        self.tx.len()
    }

    fn receive(&self, byte: u8) {
        if !self.rx.try_put(byte) {
            log_warn!("uart: rx overrun, dropping 0x{:x}", byte);
        }
    }
}
