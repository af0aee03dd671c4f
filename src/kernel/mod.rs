//! 优先级抢占内核
//!
//! 静态配置的线程 + 计数信号量:
//! - 线程是启动时固定的 `Future<Output = Infallible>`，其状态机即线程私有栈
//! - 调度器每次都运行优先级最高 (数值最小) 的就绪线程
//! - 信号量 `signal` 直接把许可交给优先级最高的等待者并唤醒它；
//!   线程中用 `signal_and_yield`，被唤醒者优先级更高时当前线程立即让出，
//!   中断中 `signal` 后中断返回即进入调度点
//! - `tick` 由系统节拍中断调用，驱动等待超时
//!
//! 资源耗尽 (线程表、信号量表) 返回 `KernelError`，启动代码负责停机。
//!
//! # 启动流程
//!
//! ```text
//! Kernel::new(config)            ← 全局初始化 (只调用一次)
//!   ├─► kernel.semaphore_create() ← 创建信号量 (×N)
//!   ├─► scheduler.thread_create() ← 注册线程 (×N)
//!   └─► scheduler.start()         ← 开始调度 (不返回)
//! ```

use core::cell::RefCell;
use core::fmt;
use core::task::Waker;

use embassy_time::Duration;
use heapless::Vec;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::{KERNEL_TICK_HZ, MAX_SEMAPHORES, MAX_THREADS};
use crate::sync::primitives::{AtomicCounter, AtomicFlag, CriticalMutex};

pub mod scheduler;
pub mod semaphore;

pub use scheduler::{yield_now, Scheduler, Thread, ThreadId, YieldNow};
pub use semaphore::{Semaphore, Wait, WaitError};

/// 内核配置
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// 系统节拍频率 (Hz)，决定超时精度
    pub tick_hz: u32,
    /// 节拍到来时在同优先级线程之间轮转
    pub preempt_on_tick: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_hz: KERNEL_TICK_HZ,
            preempt_on_tick: false,
        }
    }
}

/// 内核错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum KernelError {
    /// 线程表已满
    TooManyThreads,
    /// 信号量表已满
    TooManySemaphores,
    /// 调度器已启动，不能再创建线程
    AlreadyStarted,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyThreads => write!(f, "thread table exhausted"),
            Self::TooManySemaphores => write!(f, "semaphore table exhausted"),
            Self::AlreadyStarted => write!(f, "scheduler already started"),
        }
    }
}

/// 线程头: 唤醒器指向这里
pub(crate) struct ThreadHeader {
    ready: AtomicBool,
}

impl ThreadHeader {
    const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn clear_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

/// 阻塞在信号量上的等待者
pub(crate) struct Waiter {
    pub(crate) token: u32,
    pub(crate) priority: u8,
    pub(crate) waker: Waker,
    pub(crate) deadline: Option<u32>,
    /// 已被 `signal` 直接授予许可
    pub(crate) granted: bool,
}

pub(crate) struct SemaphoreState {
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) waiters: Vec<Waiter, MAX_THREADS>,
}

pub(crate) struct KernelState {
    pub(crate) semaphores: Vec<SemaphoreState, MAX_SEMAPHORES>,
    pub(crate) priorities: Vec<u8, MAX_THREADS>,
    pub(crate) running: Option<ThreadId>,
    pub(crate) next_token: u32,
}

/// 不属于任何线程的等待者 (例如测试中的 block_on) 按最低优先级处理
pub(crate) const UNTHREADED_PRIORITY: u8 = u8::MAX;

/// 内核实例
///
/// 必须放在 `'static` 位置 (static 或泄漏的堆对象)，
/// 唤醒器直接引用其中的线程头。
pub struct Kernel {
    config: KernelConfig,
    ticks: AtomicU32,
    started: AtomicFlag,
    context_switches: AtomicCounter,
    pub(crate) headers: [ThreadHeader; MAX_THREADS],
    state: CriticalMutex<RefCell<KernelState>>,
}

impl Kernel {
    /// 创建内核 (对应一次性的全局初始化)
    pub const fn new(config: KernelConfig) -> Self {
        const HEADER: ThreadHeader = ThreadHeader::new();
        Self {
            config,
            ticks: AtomicU32::new(0),
            started: AtomicFlag::new(),
            context_switches: AtomicCounter::new(),
            headers: [HEADER; MAX_THREADS],
            state: CriticalMutex::new(RefCell::new(KernelState {
                semaphores: Vec::new(),
                priorities: Vec::new(),
                running: None,
                next_token: 0,
            })),
        }
    }

    /// 获取配置
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// 创建计数信号量 (无上限)
    pub fn semaphore_create(&'static self, initial: u32) -> Result<Semaphore, KernelError> {
        self.semaphore_create_bounded(initial, u32::MAX)
    }

    /// 创建带上限的计数信号量
    ///
    /// 计数达到 `max` 后继续 `signal` 不再增加 (FIFO 槽位计数用)
    pub fn semaphore_create_bounded(
        &'static self,
        initial: u32,
        max: u32,
    ) -> Result<Semaphore, KernelError> {
        let index = self.with_state(|state| {
            let index = state.semaphores.len();
            state
                .semaphores
                .push(SemaphoreState {
                    count: initial.min(max),
                    max,
                    waiters: Vec::new(),
                })
                .map(|_| index)
                .map_err(|_| KernelError::TooManySemaphores)
        })?;

        Ok(Semaphore::from_raw(self, index as u8))
    }

    /// 系统节拍 (由节拍中断调用)
    ///
    /// 推进节拍计数并唤醒所有已超时的等待者
    pub fn tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        self.with_state(|state| {
            for sem in state.semaphores.iter() {
                for waiter in sem.waiters.iter() {
                    if !waiter.granted && waiter.deadline.is_some_and(|d| deadline_passed(now, d)) {
                        waiter.waker.wake_by_ref();
                    }
                }
            }
        });
    }

    /// 当前节拍计数
    #[inline]
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    /// 累计上下文切换次数
    #[inline]
    pub fn context_switches(&self) -> u32 {
        self.context_switches.get()
    }

    /// 调度器是否已启动
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.is_set()
    }

    /// 当前正在运行的线程
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.with_state(|state| state.running)
    }

    /// 把时长换算成节拍数 (向上取整，至少 1 个节拍)
    ///
    /// 零时长在 `Semaphore::wait` 中表示永久等待，不经过这里
    pub fn duration_to_ticks(&self, duration: Duration) -> u32 {
        let hz = u64::from(self.config.tick_hz);
        let ticks = (duration.as_micros() * hz).div_ceil(1_000_000);
        ticks.clamp(1, u64::from(u32::MAX)) as u32
    }

    // ==================== 内部接口 ====================

    #[inline]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    pub(crate) fn register_thread(&self, priority: u8) -> Result<ThreadId, KernelError> {
        if self.is_started() {
            return Err(KernelError::AlreadyStarted);
        }

        self.with_state(|state| {
            let index = state.priorities.len();
            state
                .priorities
                .push(priority)
                .map(|_| ThreadId::new(index as u8))
                .map_err(|_| KernelError::TooManyThreads)
        })
    }

    pub(crate) fn mark_started(&self) {
        self.started.set();
    }

    pub(crate) fn record_switch(&self) {
        self.context_switches.increment();
    }

    pub(crate) fn set_running(&self, thread: Option<ThreadId>) {
        self.with_state(|state| state.running = thread);
    }
}

/// 节拍回绕安全的超时判断
#[inline]
pub(crate) fn deadline_passed(now: u32, deadline: u32) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

#[cfg(test)]
pub(crate) fn leak_kernel(config: KernelConfig) -> &'static Kernel {
    std::boxed::Box::leak(std::boxed::Box::new(Kernel::new(config)))
}

/// 在线程之外用空唤醒器轮询一次
#[cfg(test)]
pub(crate) fn poll_once<F: core::future::Future>(
    fut: core::pin::Pin<&mut F>,
) -> core::task::Poll<F::Output> {
    use core::task::{Context, RawWaker, RawWakerVTable, Waker};
    static VTABLE: RawWakerVTable = RawWakerVTable::new(
        |p| RawWaker::new(p, &VTABLE),
        |_| {},
        |_| {},
        |_| {},
    );
    let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
    let mut cx = Context::from_waker(&waker);
    fut.poll(&mut cx)
}
