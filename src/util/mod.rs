//! 工具模块
//!
//! - `log`: 条件编译日志宏与 `fatal!`

pub mod log;
