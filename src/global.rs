//! 进程级默认 dispatcher
//!
//! 未指定 dispatcher 时，[`request`](crate::request) 和 [`stream`](crate::stream)
//! 使用这里保存的 dispatcher。
//!
//! ## 初始化
//!
//! 默认值是一个使用默认选项的 [`Agent`]。可以在启动时调用
//! [`init_global_dispatcher`] 提前创建它；没有调用时，它在第一次被读取时创建。
//!
//! ## 替换
//!
//! [`set_global_dispatcher`] 随时可以替换默认值，已经发出的请求继续由
//! 它们当初被发往的 dispatcher 处理。

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::agent::Agent;
use crate::dispatcher::Dispatch;

// 只初始化一次；之后的替换通过 RwLock 完成
static GLOBAL: OnceLock<RwLock<Arc<dyn Dispatch>>> = OnceLock::new();

fn global() -> &'static RwLock<Arc<dyn Dispatch>> {
    GLOBAL.get_or_init(|| {
        trace!("creating default global agent");
        let agent: Arc<dyn Dispatch> = Arc::new(Agent::new());
        RwLock::new(agent)
    })
}

/// 立即创建默认 dispatcher。
///
/// 已经初始化（或已被 [`set_global_dispatcher`] 设置）时什么也不做。
pub fn init_global_dispatcher() {
    let _ = global();
}

/// 返回当前的默认 dispatcher。
pub fn global_dispatcher() -> Arc<dyn Dispatch> {
    global()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// 替换默认 dispatcher，返回被替换的那一个。
pub fn set_global_dispatcher(dispatcher: Arc<dyn Dispatch>) -> Arc<dyn Dispatch> {
    let mut slot = global().write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, dispatcher)
}
