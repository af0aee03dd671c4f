//! 同步原语封装
//!
//! 基于 embassy-sync 的阻塞互斥锁，统一使用 CriticalSectionRawMutex:
//! 共享数据的生产者可能是中断处理函数，所以只能用关中断的临界区保护，
//! 普通互斥锁不够。只在线程之间共享、操作耗时的数据 (Flash) 用异步互斥锁，
//! 等待时挂起线程而不关中断。

use core::marker::PhantomData;

use critical_section::RestoreState;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_sync::mutex;
use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

// ===== 类型别名: 简化使用 =====

/// 临界区互斥锁 - 中断与线程共享的数据
///
/// `lock` 期间中断关闭，闭包必须短小且不能阻塞
///
/// # Example
/// ```ignore
/// static SHARED: CriticalMutex<RefCell<u32>> = CriticalMutex::new(RefCell::new(0));
///
/// SHARED.lock(|v| *v.borrow_mut() += 1);
/// ```
pub type CriticalMutex<T> = Mutex<CriticalSectionRawMutex, T>;

/// 异步互斥锁 - 线程之间共享、持有时间较长的数据
///
/// 只有锁状态的检查在临界区内，持锁期间中断保持打开；不能在中断中使用
pub type AsyncMutex<T> = mutex::Mutex<CriticalSectionRawMutex, T>;

// ===== 临界区守卫 =====

/// 当前线程持有的临界区嵌套深度
static CRITICAL_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// 进入临界区 (关中断)
///
/// 返回的守卫在 drop 或 `exit()` 时恢复中断状态。
/// 守卫可以嵌套，必须按相反顺序释放 (Rust 的 drop 顺序天然满足)。
pub fn enter_critical() -> CriticalGuard {
    // Safety: 守卫不可跨线程移动，释放顺序由作用域保证
    let restore = unsafe { critical_section::acquire() };
    CRITICAL_DEPTH.fetch_add(1, Ordering::Relaxed);
    CriticalGuard {
        restore,
        _not_send: PhantomData,
    }
}

/// 当前是否处于 `enter_critical` 打开的临界区内
#[inline]
pub fn in_critical() -> bool {
    CRITICAL_DEPTH.load(Ordering::Relaxed) > 0
}

/// 临界区守卫
pub struct CriticalGuard {
    restore: RestoreState,
    _not_send: PhantomData<*const ()>,
}

impl CriticalGuard {
    /// 显式退出临界区
    #[inline]
    pub fn exit(self) {
        drop(self);
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        CRITICAL_DEPTH.fetch_sub(1, Ordering::Relaxed);
        // Safety: restore 来自配对的 acquire
        unsafe { critical_section::release(self.restore) };
    }
}

// ===== 优化的原子操作封装 =====

/// 原子标志 - 最快的任务间通知
pub struct AtomicFlag {
    flag: AtomicBool,
}

impl AtomicFlag {
    /// 创建新的原子标志
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// 设置标志
    #[inline(always)]
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// 检查标志 (不清除)
    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// 原子计数器 - 用于统计
pub struct AtomicCounter {
    count: AtomicU32,
}

impl AtomicCounter {
    /// 创建新的计数器
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// 增加并返回新值
    #[inline(always)]
    pub fn increment(&self) -> u32 {
        self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// 获取当前值
    #[inline(always)]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for AtomicFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_guard_nesting() {
        let outer = enter_critical();
        assert!(in_critical());
        {
            let _inner = enter_critical();
            assert!(in_critical());
        }
        assert!(in_critical());
        outer.exit();
    }

    #[test]
    fn test_flag_and_counter() {
        let flag = AtomicFlag::new();
        assert!(!flag.is_set());
        flag.set();
        flag.set();
        assert!(flag.is_set());

        let counter = AtomicCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.get(), 2);
    }
}
