//! 中断安全的字节 FIFO
//!
//! 环形缓冲区 + 两个计数信号量:
//! - `get_ready`: 可读字节的许可 (上限 N)
//! - `put_ready`: 空闲槽位的许可 (上限 N)
//!
//! 成败只看缓冲区里的字节数；检查、修改与通知对方信号量在同一个临界区内完成，
//! 生产者可以是中断处理函数。非阻塞操作顺带消耗一个空闲许可 (如果有)，
//! 因此中断侧的 `try_put` 可以与线程侧的 `blocking_get` 配对使用 (串口接收)，
//! 反之亦然 (串口发送)。阻塞操作拿到许可后缓冲区可能已被非阻塞操作抢先，
//! 此时重新等待。

use core::cell::RefCell;

use crate::kernel::{yield_now, Kernel, KernelError, Semaphore};
use crate::sync::primitives::CriticalMutex;
use crate::sync::ringbuffer::RingBuffer;
use crate::util::log::*;

/// 字节 FIFO
pub struct Fifo<const N: usize> {
    buffer: CriticalMutex<RefCell<RingBuffer<u8, N>>>,
    get_ready: Semaphore,
    put_ready: Semaphore,
}

impl<const N: usize> Fifo<N> {
    /// 创建空 FIFO，占用内核的两个信号量
    pub fn new(kernel: &'static Kernel) -> Result<Self, KernelError> {
        let capacity = N as u32;
        Ok(Self {
            buffer: CriticalMutex::new(RefCell::new(RingBuffer::new())),
            get_ready: kernel.semaphore_create_bounded(0, capacity)?,
            put_ready: kernel.semaphore_create_bounded(capacity, capacity)?,
        })
    }

    /// 容量
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// 当前字节数
    pub fn len(&self) -> usize {
        self.buffer.lock(|b| b.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 非阻塞写入
    ///
    /// 满时返回 `false`，内容不变
    pub fn try_put(&self, byte: u8) -> bool {
        self.push(byte, true).is_some()
    }

    /// 非阻塞读取
    ///
    /// 空时返回 `None`
    pub fn try_get(&self) -> Option<u8> {
        self.pop(true).map(|(byte, _)| byte)
    }

    /// 阻塞读取: 挂起当前线程直到有数据
    pub async fn blocking_get(&self) -> u8 {
        loop {
            if self.get_ready.wait_forever().await.is_err() {
                fatal!("fifo get wait failed");
            }
            if let Some((byte, preempt)) = self.pop(false) {
                if preempt {
                    yield_now().await;
                }
                return byte;
            }
            log_trace!("fifo: byte taken by a non-blocking get, waiting again");
        }
    }

    /// 阻塞写入: 挂起当前线程直到有空位
    pub async fn blocking_put(&self, byte: u8) {
        loop {
            if self.put_ready.wait_forever().await.is_err() {
                fatal!("fifo put wait failed");
            }
            if let Some(preempt) = self.push(byte, false) {
                if preempt {
                    yield_now().await;
                }
                return;
            }
            log_trace!("fifo: slot taken by a non-blocking put, waiting again");
        }
    }

    // 返回写入后是否唤醒了更高优先级的读者；满时返回 None
    fn push(&self, byte: u8, take_permit: bool) -> Option<bool> {
        self.buffer.lock(|b| {
            if !b.borrow_mut().try_push(byte) {
                return None;
            }
            if take_permit {
                self.put_ready.try_acquire();
            }
            Some(self.get_ready.signal_preempts())
        })
    }

    fn pop(&self, take_permit: bool) -> Option<(u8, bool)> {
        self.buffer.lock(|b| {
            let byte = b.borrow_mut().try_pop()?;
            if take_permit {
                self.get_ready.try_acquire();
            }
            Some((byte, self.put_ready.signal_preempts()))
        })
    }
}
