//! 固定优先级调度器
//!
//! 每个线程是一个被固定 (pin) 的 `Future<Output = Infallible>`，永不结束。
//! 唤醒器直接指向 `Kernel` 里的线程头，`wake` 只是置位就绪标志，
//! 因此可以在中断里安全调用。调度点总是选择优先级数值最小的就绪线程；
//! 同优先级按创建顺序，打开 `preempt_on_tick` 时按节拍轮转。

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use heapless::Vec;

use super::{Kernel, KernelError, ThreadHeader};
use crate::config::MAX_THREADS;
use crate::util::log::*;

/// 线程标识 (创建顺序)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct ThreadId(u8);

impl ThreadId {
    pub(crate) const fn new(index: u8) -> Self {
        Self(index)
    }

    /// 线程表下标
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// 线程入口: 永不返回的 future
pub type Thread<'a> = Pin<&'a mut dyn Future<Output = Infallible>>;

struct Slot<'a> {
    id: ThreadId,
    priority: u8,
    thread: Thread<'a>,
}

/// 调度器
///
/// 持有所有线程的 future；`'a` 是线程状态 (栈) 的生存期。
pub struct Scheduler<'a> {
    kernel: &'static Kernel,
    slots: Vec<Slot<'a>, MAX_THREADS>,
    last: Option<ThreadId>,
}

impl<'a> Scheduler<'a> {
    pub fn new(kernel: &'static Kernel) -> Self {
        Self {
            kernel,
            slots: Vec::new(),
            last: None,
        }
    }

    /// 注册线程，立即处于就绪状态
    ///
    /// 数值越小优先级越高；调度开始后再创建返回 `AlreadyStarted`。
    pub fn thread_create(&mut self, thread: Thread<'a>, priority: u8) -> Result<ThreadId, KernelError> {
        let id = self.kernel.register_thread(priority)?;
        self.slots
            .push(Slot {
                id,
                priority,
                thread,
            })
            .map_err(|_| KernelError::TooManyThreads)?;

        self.kernel.headers[id.index()].set_ready();
        log_debug!("thread {} created, priority {}", id.index(), priority);
        Ok(id)
    }

    /// 已注册线程数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 开始调度，永不返回
    pub fn start(mut self) -> ! {
        self.kernel.mark_started();
        log_info!("scheduler started with {} threads", self.slots.len());

        loop {
            if !self.run_once() {
                // 空闲: 等待下一个中断置位就绪标志
                core::hint::spin_loop();
            }
        }
    }

    /// 运行所有就绪线程直到全部阻塞，返回调度次数
    ///
    /// 主要给宿主机测试使用；线程一直就绪时不会返回。
    pub fn run_until_idle(&mut self) -> usize {
        let mut dispatched = 0;
        while self.run_once() {
            dispatched += 1;
        }
        dispatched
    }

    /// 调度一次: 选出最高优先级的就绪线程运行到下一个挂起点
    ///
    /// 没有就绪线程时返回 `false`
    pub fn run_once(&mut self) -> bool {
        self.kernel.mark_started();
        match self.next_ready() {
            Some(slot) => {
                self.dispatch(slot);
                true
            }
            None => false,
        }
    }

    fn next_ready(&self) -> Option<usize> {
        let n = self.slots.len();
        if n == 0 {
            return None;
        }

        let offset = if self.kernel.config().preempt_on_tick {
            self.kernel.ticks() as usize % n
        } else {
            0
        };

        (0..n)
            .map(|i| (i + offset) % n)
            .filter(|&i| self.kernel.headers[self.slots[i].id.index()].is_ready())
            .min_by_key(|&i| self.slots[i].priority)
    }

    fn dispatch(&mut self, index: usize) {
        let kernel = self.kernel;
        let slot = &mut self.slots[index];
        let header = &kernel.headers[slot.id.index()];

        header.clear_ready();
        if self.last != Some(slot.id) {
            kernel.record_switch();
            self.last = Some(slot.id);
        }

        kernel.set_running(Some(slot.id));
        let waker = thread_waker(header);
        let mut cx = Context::from_waker(&waker);
        match slot.thread.as_mut().poll(&mut cx) {
            Poll::Ready(never) => match never {},
            Poll::Pending => {}
        }
        kernel.set_running(None);
    }
}

// ===== 唤醒器: 数据指针即 &'static ThreadHeader =====

static VTABLE: RawWakerVTable = RawWakerVTable::new(waker_clone, waker_wake, waker_wake, waker_drop);

fn thread_waker(header: &'static ThreadHeader) -> Waker {
    let raw = RawWaker::new(header as *const ThreadHeader as *const (), &VTABLE);
    // Safety: 线程头位于 'static 的 Kernel 中，vtable 各函数只读访问原子标志
    unsafe { Waker::from_raw(raw) }
}

unsafe fn waker_clone(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn waker_wake(data: *const ()) {
    // Safety: data 来自 thread_waker
    let header = unsafe { &*(data as *const ThreadHeader) };
    header.set_ready();
}

unsafe fn waker_drop(_: *const ()) {}

/// 让出 CPU: 保持就绪并回到调度点
///
/// 调度器随即选择优先级最高的就绪线程；没有更高优先级线程时当前线程继续运行。
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
