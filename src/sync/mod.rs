//! 同步原语模块
//!
//! - `CriticalMutex` / `CriticalGuard`: 关中断的临界区
//! - `AsyncMutex`: 线程间的异步互斥锁 (持锁期间不关中断)
//! - `RingBuffer`: 不带同步的定长环形缓冲区
//! - `Fifo`: 临界区保护 + 信号量阻塞的字节 FIFO

pub mod fifo;
pub mod primitives;
pub mod ringbuffer;

pub use fifo::Fifo;
pub use primitives::{enter_critical, in_critical, AsyncMutex, CriticalGuard, CriticalMutex};
pub use ringbuffer::RingBuffer;
