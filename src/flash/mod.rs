//! Flash 非易失存储
//!
//! - `storage`: 错误类型与保留区配置
//! - `nv`: 短语内小变量的分配与读-改-擦-写

pub mod nv;
pub mod storage;

pub use nv::{NvSlot, NvStore};
pub use storage::{NvConfig, StorageError, PHRASE_SIZE};
