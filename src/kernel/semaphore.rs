//! 计数信号量
//!
//! `signal` 可在中断或线程中调用；`wait` 只能在线程 (或测试的 block_on) 中等待。
//! 计数为 0 时 `signal` 不累加计数，而是把许可直接交给优先级最高的等待者，
//! 同优先级等待者之间的先后顺序不作保证。

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use embassy_time::Duration;

use super::{deadline_passed, yield_now, Kernel, Waiter, UNTHREADED_PRIORITY};
use crate::sync::primitives::in_critical;
use crate::util::log::*;

/// 等待错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum WaitError {
    /// 超时且未获得许可
    Timeout,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "semaphore wait timed out"),
        }
    }
}

/// 信号量句柄 (可复制)
#[derive(Clone, Copy)]
pub struct Semaphore {
    kernel: &'static Kernel,
    index: u8,
}

impl Semaphore {
    pub(crate) fn from_raw(kernel: &'static Kernel, index: u8) -> Self {
        Self { kernel, index }
    }

    /// 释放一个许可
    ///
    /// 有等待者时直接授予优先级最高者并唤醒它，计数不变；
    /// 否则计数加一 (不超过上限)。中断里调用时，中断返回后调度器
    /// 立即运行被唤醒的线程。
    pub fn signal(&self) {
        self.release();
    }

    /// 线程中释放许可；许可交给了比当前线程优先级更高的等待者时返回 `true`
    ///
    /// 返回 `true` 时调用方应尽快 `yield_now().await`，见 `signal_and_yield`。
    pub fn signal_preempts(&self) -> bool {
        self.release()
    }

    /// 线程中释放许可，并在唤醒了更高优先级线程时立即让出
    pub async fn signal_and_yield(&self) {
        if self.release() {
            yield_now().await;
        }
    }

    fn release(&self) -> bool {
        self.kernel.with_state(|state| {
            let running = state.running.map(|t| state.priorities[t.index()]);
            let sem = &mut state.semaphores[self.index as usize];

            let best = sem
                .waiters
                .iter_mut()
                .filter(|w| !w.granted)
                .min_by_key(|w| (w.priority, w.token));

            match best {
                Some(waiter) => {
                    waiter.granted = true;
                    waiter.waker.wake_by_ref();
                    running.is_some_and(|p| waiter.priority < p)
                }
                None => {
                    if sem.count < sem.max {
                        sem.count += 1;
                    }
                    false
                }
            }
        })
    }

    /// 等待许可
    ///
    /// `timeout` 为 `None` 或零时长表示永久等待；超时返回 `WaitError::Timeout`，
    /// 且不会消耗之后到来的许可。
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            sem: *self,
            timeout: timeout
                .filter(|d| d.as_ticks() != 0)
                .map(|d| self.kernel.duration_to_ticks(d)),
            token: None,
        }
    }

    /// 永久等待
    #[inline]
    pub fn wait_forever(&self) -> Wait {
        self.wait(None)
    }

    /// 不阻塞地尝试获取许可
    pub fn try_acquire(&self) -> bool {
        self.kernel.with_state(|state| {
            let sem = &mut state.semaphores[self.index as usize];
            if sem.count > 0 {
                sem.count -= 1;
                true
            } else {
                false
            }
        })
    }

    /// 当前计数
    pub fn count(&self) -> u32 {
        self.kernel
            .with_state(|state| state.semaphores[self.index as usize].count)
    }

    /// 正在阻塞 (尚未获得许可) 的等待者数量
    pub fn waiting(&self) -> usize {
        self.kernel.with_state(|state| {
            state.semaphores[self.index as usize]
                .waiters
                .iter()
                .filter(|w| !w.granted)
                .count()
        })
    }
}

enum Step {
    Acquired,
    TimedOut,
    Pending,
    /// 等待者表已满
    Overflow,
    /// 等待记录丢失 (内核状态被破坏)
    Lost,
}

/// `Semaphore::wait` 返回的 future
///
/// 被丢弃时撤销等待；如果许可已经授予但还没被取走，会转交给下一个等待者。
#[must_use = "futures do nothing unless polled"]
pub struct Wait {
    sem: Semaphore,
    timeout: Option<u32>,
    token: Option<u32>,
}

impl Future for Wait {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let kernel = this.sem.kernel;
        let index = this.sem.index as usize;

        let (step, nested) = kernel.with_state(|state| {
            let nested = in_critical();
            let now = kernel.ticks();
            let priority = state
                .running
                .map_or(UNTHREADED_PRIORITY, |t| state.priorities[t.index()]);
            let sem = &mut state.semaphores[index];

            let step = match this.token {
                None if sem.count > 0 => {
                    sem.count -= 1;
                    Step::Acquired
                }
                None => {
                    let token = state.next_token;
                    state.next_token = token.wrapping_add(1);
                    let waiter = Waiter {
                        token,
                        priority,
                        waker: cx.waker().clone(),
                        deadline: this.timeout.map(|t| now.wrapping_add(t)),
                        granted: false,
                    };
                    if sem.waiters.push(waiter).is_ok() {
                        this.token = Some(token);
                        Step::Pending
                    } else {
                        Step::Overflow
                    }
                }
                Some(token) => match sem.waiters.iter().position(|w| w.token == token) {
                    None => Step::Lost,
                    Some(pos) => {
                        let waiter = &mut sem.waiters[pos];
                        if waiter.granted {
                            sem.waiters.swap_remove(pos);
                            this.token = None;
                            Step::Acquired
                        } else if waiter.deadline.is_some_and(|d| deadline_passed(now, d)) {
                            sem.waiters.swap_remove(pos);
                            this.token = None;
                            Step::TimedOut
                        } else {
                            if !waiter.waker.will_wake(cx.waker()) {
                                waiter.waker = cx.waker().clone();
                            }
                            Step::Pending
                        }
                    }
                },
            };
            (step, nested)
        });

        if nested {
            fatal!("semaphore wait inside a critical section");
        }

        match step {
            Step::Acquired => Poll::Ready(Ok(())),
            Step::TimedOut => Poll::Ready(Err(WaitError::Timeout)),
            Step::Pending => Poll::Pending,
            Step::Overflow => fatal!("semaphore {} waiter table exhausted", index),
            Step::Lost => fatal!("semaphore {} lost a waiter", index),
        }
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let index = self.sem.index as usize;
        let granted = self.sem.kernel.with_state(|state| {
            let waiters = &mut state.semaphores[index].waiters;
            match waiters.iter().position(|w| w.token == token) {
                Some(pos) => waiters.swap_remove(pos).granted,
                None => false,
            }
        });

        if granted {
            self.sem.signal();
        }
    }
}
