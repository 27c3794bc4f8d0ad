//! 日志宏模块
//!
//! 对 `tracing` crate 的日志宏做条件包装：
//!
//! 1. `tracing` feature 启用时，宏展开为对应的 `tracing::*` 调用
//! 2. 未启用时，宏展开为空操作
//!
//! 通过 `#[macro_use]` 在 `lib.rs` 中最先引入，crate 内任何位置都可以直接使用
//! `trace!` 和 `debug!`，无需关心 feature 是否启用。

/// `debug!`：调试级别日志，转发到 `tracing::debug!`。
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::debug!($($arg)+);
        }
    }
}

/// `trace!`：最详细级别日志，转发到 `tracing::trace!`。
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::trace!($($arg)+);
        }
    }
}
