//! Tower 设备上下文
//!
//! 启动时把所有外设、信号量和非易失变量装进一个 `Tower`，
//! 线程与中断入口都只通过它访问共享状态 (没有全局可变单例)。
//!
//! # 线程
//!
//! | 线程         | 优先级 | 唤醒来源              |
//! |--------------|--------|-----------------------|
//! | 协议处理     | 1      | 串口收到完整包        |
//! | RTC 广播     | 6      | RTC 秒中断            |
//! | 蓝灯超时     | 7      | FTM 通道 0 比较中断   |
//! | 模拟量 (×2)  | 10, 9  | PIT 采样回调          |
//!
//! # 启动流程
//!
//! ```text
//! Tower::new()
//!   ├─► 串口 + 包收发器
//!   ├─► Flash: 分配 tower mode，再分配 tower number (空则写默认值)
//!   ├─► 信号量: RTC / 蓝灯超时 / 每个模拟通道
//!   ├─► FTM 通道 0: 输出比较，1 秒
//!   ├─► PIT: 10ms 周期
//!   └─► 橙灯亮
//! tower.run()  ← 注册线程并开始调度 (不返回)
//! ```

use core::cell::{Cell, RefCell};
use core::convert::Infallible;
use core::fmt;
use core::future::Future;
use core::pin::Pin;

use embassy_time::Duration;

use crate::analog::AnalogPipeline;
use crate::config::{
    ANALOG_BASE_PRIORITY, ANALOG_NB_INPUTS, DEFAULT_TOWER_MODE, DEFAULT_TOWER_NUMBER,
    GREEN_TOGGLE_CALLS, LED_TIMEOUT_PRIORITY, PROTOCOL_PRIORITY, RTC_PRIORITY,
};
use crate::flash::{NvConfig, NvSlot, NvStore, StorageError};
use crate::hal::{
    Board, Callback, Ftm, Led, Leds, Peripherals, Pit, TimerChannel, TimerFunction,
};
use crate::kernel::{Kernel, KernelError, Scheduler, Semaphore};
use crate::packet::{Packet, PacketCodec};
use crate::serial::{BaudRate, SerialChannel};
use crate::sync::primitives::{AsyncMutex, CriticalMutex};
use crate::util::log::*;

pub mod command;

pub use command::Command;

// ===== 配置 =====

/// 设备配置
#[derive(Debug, Clone, Copy)]
pub struct TowerConfig {
    pub baud_rate: BaudRate,
    /// 总线时钟 (UART / PIT 的模块时钟)
    pub module_clock_hz: u32,
    /// 模拟量采样周期
    pub sample_period: Duration,
    /// 蓝灯点亮时长 (FTM 固定频率时钟周期数)
    pub led_timeout_counts: u16,
    pub flash: NvConfig,
}

impl Default for TowerConfig {
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::Baud115200,
            module_clock_hz: 50_000_000,
            sample_period: Duration::from_millis(10),
            led_timeout_counts: 32_768, // 32.768 kHz 固定频率时钟 = 1 秒
            flash: NvConfig::default(),
        }
    }
}

/// 协议模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum ProtocolMode {
    /// 值变化时才发送模拟量
    Asynchronous = 0,
    /// 每个采样周期都发送
    Synchronous = 1,
}

impl ProtocolMode {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Asynchronous),
            1 => Some(Self::Synchronous),
            _ => None,
        }
    }
}

// ===== 错误 =====

/// 启动失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum BootError {
    Kernel(KernelError),
    Storage(StorageError),
    /// 非易失短语空间不足
    NvExhausted,
    /// 外设配置被拒绝
    Peripheral,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(e) => write!(f, "kernel: {}", e),
            Self::Storage(e) => write!(f, "storage: {}", e),
            Self::NvExhausted => write!(f, "non-volatile phrase exhausted"),
            Self::Peripheral => write!(f, "peripheral setup rejected"),
        }
    }
}

impl From<KernelError> for BootError {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

impl From<StorageError> for BootError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ===== 设备上下文 =====

/// Tower 设备
pub struct Tower<B: Board> {
    kernel: &'static Kernel,
    codec: PacketCodec<B::Uart>,
    nv: AsyncMutex<NvStore<B::Flash>>,
    tower_number: NvSlot,
    tower_mode: NvSlot,
    protocol_mode: CriticalMutex<Cell<ProtocolMode>>,
    analog: CriticalMutex<RefCell<AnalogPipeline<B::Adc>>>,
    rtc: CriticalMutex<RefCell<B::Rtc>>,
    leds: CriticalMutex<RefCell<B::Leds>>,
    pit: CriticalMutex<RefCell<Pit<B::Pit>>>,
    ftm: CriticalMutex<RefCell<Ftm<B::Ftm>>>,
    led_channel: TimerChannel,
    led_timeout: Semaphore,
    rtc_second: Semaphore,
    analog_ready: [Semaphore; ANALOG_NB_INPUTS],
    pit_calls: CriticalMutex<Cell<u8>>,
}

impl<B: Board> Tower<B> {
    /// 初始化全部组件
    ///
    /// 任何一步失败都返回错误，调用者负责停机
    pub fn new(
        kernel: &'static Kernel,
        peripherals: Peripherals<B>,
        config: TowerConfig,
    ) -> Result<Self, BootError> {
        let Peripherals {
            uart,
            flash,
            adc,
            rtc,
            mut leds,
            pit,
            ftm,
        } = peripherals;

        let serial = SerialChannel::new(kernel, uart, config.baud_rate, config.module_clock_hz)?;
        let codec = PacketCodec::new(kernel, serial)?;

        let mut nv = NvStore::new(flash, config.flash)?;
        let tower_mode = allocate_and_set(&mut nv, DEFAULT_TOWER_MODE)?;
        let tower_number = allocate_and_set(&mut nv, DEFAULT_TOWER_NUMBER)?;

        let rtc_second = kernel.semaphore_create(0)?;
        let led_timeout = kernel.semaphore_create(0)?;
        let mut analog_ready = [rtc_second; ANALOG_NB_INPUTS];
        for slot in analog_ready.iter_mut() {
            *slot = kernel.semaphore_create(0)?;
        }

        let led_channel = TimerChannel {
            channel: 0,
            function: TimerFunction::OutputCompare,
            delay_counts: config.led_timeout_counts,
        };
        let mut ftm = Ftm::new(ftm);
        if !ftm.set(&led_channel, led_timeout) {
            return Err(BootError::Peripheral);
        }

        let mut pit = Pit::new(pit, config.module_clock_hz);
        pit.set(config.sample_period, true);

        leds.on(Led::Orange);
        log_info!("tower: boot complete");

        Ok(Self {
            kernel,
            codec,
            nv: AsyncMutex::new(nv),
            tower_number,
            tower_mode,
            protocol_mode: CriticalMutex::new(Cell::new(ProtocolMode::Asynchronous)),
            analog: CriticalMutex::new(RefCell::new(AnalogPipeline::new(adc))),
            rtc: CriticalMutex::new(RefCell::new(rtc)),
            leds: CriticalMutex::new(RefCell::new(leds)),
            pit: CriticalMutex::new(RefCell::new(pit)),
            ftm: CriticalMutex::new(RefCell::new(ftm)),
            led_channel,
            led_timeout,
            rtc_second,
            analog_ready,
            pit_calls: CriticalMutex::new(Cell::new(0)),
        })
    }

    /// 注册全部线程并开始调度，永不返回
    pub fn run(&self) -> ! {
        crate::pin_tower_threads!(threads = self);
        let mut scheduler = Scheduler::new(self.kernel);
        if let Err(e) = threads.register(&mut scheduler) {
            fatal!("tower: thread registration failed: {}", e);
        }
        scheduler.start()
    }

    /// 全部线程的 future (尚未固定)，用 `pin_tower_threads!` 固定后注册
    pub fn threads(
        &self,
    ) -> ThreadFutures<
        impl Future<Output = Infallible> + '_,
        impl Future<Output = Infallible> + '_,
        impl Future<Output = Infallible> + '_,
        impl Future<Output = Infallible> + '_,
    > {
        ThreadFutures {
            protocol: self.protocol_thread(),
            rtc: self.rtc_thread(),
            led_timeout: self.led_timeout_thread(),
            analog: core::array::from_fn(|channel| self.analog_thread(channel as u8)),
        }
    }

    // ==================== 中断入口 ====================

    /// UART 收发中断
    pub fn on_uart_interrupt(&self) {
        self.codec.serial().on_interrupt();
    }

    /// PIT 周期中断
    pub fn on_pit_interrupt(&self) {
        self.pit
            .lock(|pit| pit.borrow_mut().on_interrupt(&SampleTick(self)));
    }

    /// RTC 秒中断
    pub fn on_rtc_interrupt(&self) {
        SecondTick(self).on_fire();
    }

    /// FTM 通道中断
    pub fn on_ftm_interrupt(&self) {
        self.ftm.lock(|ftm| ftm.borrow_mut().on_interrupt());
    }

    // ==================== 线程 ====================

    async fn protocol_thread(&self) -> Infallible {
        self.send_startup_values().await;

        loop {
            let packet = self.codec.get().await;

            // 收到有效包: 蓝灯亮，由 FTM 超时线程熄灭
            self.with_leds(|leds| leds.on(Led::Blue));
            self.ftm
                .lock(|ftm| ftm.borrow_mut().start_timer(&self.led_channel));

            let handled = self.dispatch(&packet).await;
            log_debug!("tower: command 0x{:x} handled={}", packet.command_id(), handled);

            if packet.ack_requested() {
                self.send(packet.acknowledgement(handled)).await;
            }
        }
    }

    async fn rtc_thread(&self) -> Infallible {
        loop {
            wait_or_halt(self.rtc_second).await;
            self.with_leds(|leds| leds.toggle(Led::Yellow));
            self.send_time().await;
        }
    }

    async fn led_timeout_thread(&self) -> Infallible {
        loop {
            wait_or_halt(self.led_timeout).await;
            self.with_leds(|leds| leds.off(Led::Blue));
        }
    }

    async fn analog_thread(&self, channel: u8) -> Infallible {
        let ready = self.analog_ready[channel as usize];
        loop {
            wait_or_halt(ready).await;

            // 中值与旧值只在这里更新，PIT 回调只写原始样本
            let Some(input) = self.analog.lock(|a| a.borrow_mut().process(channel)) else {
                continue;
            };
            if self.protocol_mode() == ProtocolMode::Synchronous || input.changed() {
                self.send(Packet::with_parameter23(
                    Command::AnalogInput.id(),
                    channel,
                    input.value as u16,
                ))
                .await;
            }
        }
    }

    // ==================== 回调 ====================

    fn sample_all(&self) {
        for (channel, ready) in self.analog_ready.iter().enumerate() {
            let sampled = self
                .analog
                .lock(|a| a.borrow_mut().sample_channel(channel as u8));
            if sampled {
                ready.signal();
            }
        }

        let calls = self.pit_calls.lock(|c| {
            let n = c.get() + 1;
            c.set(if n == GREEN_TOGGLE_CALLS { 0 } else { n });
            n
        });
        if calls == GREEN_TOGGLE_CALLS {
            self.with_leds(|leds| leds.toggle(Led::Green));
        }
    }

    // ==================== 访问接口 ====================

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn codec(&self) -> &PacketCodec<B::Uart> {
        &self.codec
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        self.protocol_mode.lock(|m| m.get())
    }

    pub fn set_protocol_mode(&self, mode: ProtocolMode) {
        self.protocol_mode.lock(|m| m.set(mode));
    }

    pub async fn tower_number(&self) -> Result<u16, StorageError> {
        self.with_nv(|nv| nv.read_u16(self.tower_number.address()))
            .await
    }

    pub async fn tower_mode(&self) -> Result<u16, StorageError> {
        self.with_nv(|nv| nv.read_u16(self.tower_mode.address()))
            .await
    }

    pub fn with_uart<R>(&self, f: impl FnOnce(&mut B::Uart) -> R) -> R {
        self.codec.serial().with_port(f)
    }

    pub fn with_leds<R>(&self, f: impl FnOnce(&mut B::Leds) -> R) -> R {
        self.leds.lock(|leds| f(&mut leds.borrow_mut()))
    }

    pub fn with_rtc<R>(&self, f: impl FnOnce(&mut B::Rtc) -> R) -> R {
        self.rtc.lock(|rtc| f(&mut rtc.borrow_mut()))
    }

    /// 独占访问非易失存储
    ///
    /// 擦除 + 编程耗时较长，期间只挂起其它访问 Flash 的线程，中断照常响应
    pub async fn with_nv<R>(&self, f: impl FnOnce(&mut NvStore<B::Flash>) -> R) -> R {
        let mut nv = self.nv.lock().await;
        f(&mut nv)
    }

    pub fn with_adc<R>(&self, f: impl FnOnce(&mut B::Adc) -> R) -> R {
        self.analog.lock(|a| f(a.borrow_mut().adc_mut()))
    }

    pub fn with_pit<R>(&self, f: impl FnOnce(&mut Pit<B::Pit>) -> R) -> R {
        self.pit.lock(|pit| f(&mut pit.borrow_mut()))
    }

    pub fn with_ftm<R>(&self, f: impl FnOnce(&mut Ftm<B::Ftm>) -> R) -> R {
        self.ftm.lock(|ftm| f(&mut ftm.borrow_mut()))
    }
}

/// 分配一个 16 位变量；读到擦除态 (0xFFFF) 时写入默认值
fn allocate_and_set<F>(nv: &mut NvStore<F>, default: u16) -> Result<NvSlot, BootError>
where
    F: embedded_storage::nor_flash::NorFlash,
{
    let slot = nv.allocate(2).ok_or(BootError::NvExhausted)?;
    if nv.read_u16(slot.address())? == 0xFFFF {
        log_info!("tower: nv slot empty, writing default {}", default);
        nv.write_u16(slot.address(), default)?;
    }
    Ok(slot)
}

async fn wait_or_halt(semaphore: Semaphore) {
    if semaphore.wait_forever().await.is_err() {
        fatal!("tower: unexpected semaphore wait error");
    }
}

/// PIT 回调: 采样所有通道，每 50 次翻转绿灯
struct SampleTick<'t, B: Board>(&'t Tower<B>);

impl<B: Board> Callback for SampleTick<'_, B> {
    fn on_fire(&self) {
        self.0.sample_all();
    }
}

/// RTC 回调: 唤醒时间广播线程
struct SecondTick<'t, B: Board>(&'t Tower<B>);

impl<B: Board> Callback for SecondTick<'_, B> {
    fn on_fire(&self) {
        self.0.rtc_second.signal();
    }
}

// ===== 线程集合 =====

/// `Tower::threads` 返回的线程 future，尚未固定
pub struct ThreadFutures<P, R, L, A> {
    pub protocol: P,
    pub rtc: R,
    pub led_timeout: L,
    pub analog: [A; ANALOG_NB_INPUTS],
}

/// 已固定在调用者栈帧上的线程，`register` 交给调度器
pub struct TowerThreads<'a, P, R, L, A> {
    pub protocol: Pin<&'a mut P>,
    pub rtc: Pin<&'a mut R>,
    pub led_timeout: Pin<&'a mut L>,
    pub analog: [Pin<&'a mut A>; ANALOG_NB_INPUTS],
}

impl<'a, P, R, L, A> TowerThreads<'a, P, R, L, A>
where
    P: Future<Output = Infallible> + 'a,
    R: Future<Output = Infallible> + 'a,
    L: Future<Output = Infallible> + 'a,
    A: Future<Output = Infallible> + 'a,
{
    /// 按固定优先级注册全部线程
    pub fn register(self, scheduler: &mut Scheduler<'a>) -> Result<(), KernelError> {
        for (channel, thread) in self.analog.into_iter().enumerate() {
            scheduler.thread_create(thread, ANALOG_BASE_PRIORITY - channel as u8)?;
        }
        scheduler.thread_create(self.rtc, RTC_PRIORITY)?;
        scheduler.thread_create(self.led_timeout, LED_TIMEOUT_PRIORITY)?;
        scheduler.thread_create(self.protocol, PROTOCOL_PRIORITY)?;
        Ok(())
    }
}

/// 在调用者的栈帧上固定 `Tower::threads` 的全部线程，绑定为 `TowerThreads`
///
/// ```ignore
/// towerrtos::pin_tower_threads!(threads = tower);
/// let mut scheduler = Scheduler::new(tower.kernel());
/// threads.register(&mut scheduler)?;
/// ```
#[macro_export]
macro_rules! pin_tower_threads {
    ($threads:ident = $tower:expr) => {
        let $crate::tower::ThreadFutures {
            protocol,
            rtc,
            led_timeout,
            analog: [analog0, analog1],
        } = $tower.threads();
        let protocol = ::core::pin::pin!(protocol);
        let rtc = ::core::pin::pin!(rtc);
        let led_timeout = ::core::pin::pin!(led_timeout);
        let analog0 = ::core::pin::pin!(analog0);
        let analog1 = ::core::pin::pin!(analog1);
        let $threads = $crate::tower::TowerThreads {
            protocol,
            rtc,
            led_timeout,
            analog: [analog0, analog1],
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimBoardFlash;

    fn nv() -> NvStore<SimBoardFlash> {
        let config = NvConfig::default();
        NvStore::new(SimBoardFlash::new(config.data_start), config).unwrap()
    }

    #[test]
    fn test_allocate_and_set_keeps_stored_value() {
        let mut nv = nv();
        let start = nv.config().data_start;
        nv.write_u16(start, 7).unwrap();

        let mode = allocate_and_set(&mut nv, DEFAULT_TOWER_MODE).unwrap();
        assert_eq!(mode.address(), start);
        assert_eq!(nv.read_u16(start), Ok(7));

        let number = allocate_and_set(&mut nv, DEFAULT_TOWER_NUMBER).unwrap();
        assert_eq!(number.address(), start + 2);
        assert_eq!(nv.read_u16(start + 2), Ok(DEFAULT_TOWER_NUMBER));
    }

    #[test]
    fn test_allocate_and_set_exhausts_phrase() {
        let mut nv = nv();
        for _ in 0..4 {
            assert!(allocate_and_set(&mut nv, 0).is_ok());
        }
        assert_eq!(allocate_and_set(&mut nv, 0), Err(BootError::NvExhausted));
    }

    #[test]
    fn test_protocol_mode_values() {
        assert_eq!(ProtocolMode::from_u8(0), Some(ProtocolMode::Asynchronous));
        assert_eq!(ProtocolMode::from_u8(1), Some(ProtocolMode::Synchronous));
        assert_eq!(ProtocolMode::from_u8(2), None);
    }
}
