//! crate 内部共用的小工具
//!
//! - `origin`：URL 拆分与 origin 规范化
//! - [`lock`]：容忍中毒（poison）的互斥锁加锁

pub(crate) mod origin;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// 加锁；若持锁线程 panic 导致锁中毒，则直接取回 guard。
///
/// 以这种方式保护的状态在语句之间总是一致的，中毒的锁不会带有撕裂的数据。
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
