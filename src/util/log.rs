//! 条件编译日志系统
//!
//! 根据 feature 选择不同的日志后端:
//! - `log-defmt`: 使用 defmt (高效二进制日志)
//! - 默认: 不输出日志 (参数仍做类型检查，零运行时开销)
//!
//! # 日志级别
//! - `log_error!`: 错误信息
//! - `log_warn!`: 警告信息
//! - `log_info!`: 一般信息
//! - `log_debug!`: 调试信息
//! - `log_trace!`: 详细跟踪
//!
//! 另外提供 `fatal!`: 记录错误后停机 (panic handler 负责停住核心)

// ===================================================================
// defmt 后端 (feature = "log-defmt")
// ===================================================================
#[cfg(feature = "log-defmt")]
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { defmt::info!($($arg)*) };
}

#[cfg(feature = "log-defmt")]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { defmt::debug!($($arg)*) };
}

#[cfg(feature = "log-defmt")]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { defmt::warn!($($arg)*) };
}

#[cfg(feature = "log-defmt")]
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { defmt::error!($($arg)*) };
}

#[cfg(feature = "log-defmt")]
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { defmt::trace!($($arg)*) };
}

// ===================================================================
// 空实现 (无日志 feature)
// ===================================================================
// 参数放进永不执行的分支，避免未使用变量告警
#[cfg(not(feature = "log-defmt"))]
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(feature = "log-defmt"))]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(feature = "log-defmt"))]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(feature = "log-defmt"))]
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(feature = "log-defmt"))]
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

// ===================================================================
// 致命错误
// ===================================================================

/// 不可恢复错误: 记录后停机
///
/// 对应嵌入式上的 debug halt。资源表耗尽、信号量等待异常、
/// FIFO 不变量被破坏都走这里，没有监督者负责重启。
///
/// # Example
/// ```ignore
/// let sem = kernel.semaphore_create(0).unwrap_or_else(|e| fatal!("semaphore: {}", e));
/// ```
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::log_error!($($arg)*);
        panic!($($arg)*)
    }};
}

// ===================================================================
// 便捷重导出
// ===================================================================
pub use crate::{fatal, log_debug, log_error, log_info, log_trace, log_warn};
