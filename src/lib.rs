//! TowerRTOS - Tower 板固件核心库
//!
//! 本库提供以下核心功能:
//! - 固定优先级内核 (静态线程 + 计数信号量)
//! - 临界区保护的字节 FIFO 与中断驱动串口
//! - 带校验和的 5 字节串口协议包
//! - 片上 Flash 非易失小变量存储
//! - 模拟量滑动窗口中值采样
//! - 条件编译日志系统
//!
//! 硬件只通过 `hal` 中的能力 trait 访问，`hal::sim` 提供宿主机仿真外设。

#![cfg_attr(not(test), no_std)]

pub mod analog;
pub mod flash;
pub mod hal;
pub mod kernel;
pub mod packet;
pub mod serial;
pub mod sync;
pub mod tower;
pub mod util;

// ===== 重导出常用类型 =====
pub use kernel::{Kernel, KernelConfig, KernelError, Scheduler, Semaphore, WaitError};
pub use packet::{Packet, PacketCodec};
pub use sync::primitives::CriticalMutex;
pub use sync::ringbuffer::RingBuffer;
pub use sync::Fifo;
pub use tower::{BootError, Tower, TowerConfig};

// ===== 版本信息 =====
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// 系统配置常量
pub mod config {
    /// 默认系统节拍频率 (Hz)
    pub const KERNEL_TICK_HZ: u32 = 1_000;

    /// 线程表容量
    pub const MAX_THREADS: usize = 16;

    /// 信号量表容量
    pub const MAX_SEMAPHORES: usize = 32;

    /// 串口收发 FIFO 大小 (字节)
    pub const FIFO_SIZE: usize = 256;

    /// 协议包长度 (命令 + 3 参数 + 校验和)
    pub const PACKET_SIZE: usize = 5;

    /// 模拟量通道数
    pub const ANALOG_NB_INPUTS: usize = 2;

    /// 中值滤波滑动窗口长度
    pub const ANALOG_WINDOW_SIZE: usize = 5;

    /// FlexTimer 通道数
    pub const FTM_NB_CHANNELS: usize = 8;

    // ===== 线程优先级 (数值越小越先运行) =====

    pub const PROTOCOL_PRIORITY: u8 = 1;
    pub const RTC_PRIORITY: u8 = 6;
    pub const LED_TIMEOUT_PRIORITY: u8 = 7;
    /// 通道 n 的优先级为 `ANALOG_BASE_PRIORITY - n`
    pub const ANALOG_BASE_PRIORITY: u8 = 10;

    /// 绿灯每多少次采样回调翻转一次 (10ms × 50 = 500ms)
    pub const GREEN_TOGGLE_CALLS: u8 = 50;

    // ===== 默认值 =====

    pub const DEFAULT_TOWER_NUMBER: u16 = 4718;
    pub const DEFAULT_TOWER_MODE: u16 = 1;

    /// 固件版本 (次版本号按百分制: V1.3 = 1, 30)
    pub const VERSION_MAJOR: u8 = 1;
    pub const VERSION_MINOR: u8 = 0;
}
