// 以下 lint 属性控制编译器的警告行为，确保代码质量：
#![deny(missing_docs)]                      // 所有公共 API 必须有文档注释
#![deny(missing_debug_implementations)]     // 所有公共类型必须实现 Debug trait
#![cfg_attr(test, deny(rust_2018_idioms))]  // 测试时要求使用 Rust 2018 惯用写法
#![cfg_attr(docsrs, feature(doc_cfg))]      // docs.rs 构建时启用 doc_cfg feature，用于在文档中显示 feature 标记

//! # hyper-agent
//!
//! Connection management for HTTP/1.1 clients built on hyper.
//!
//! - An [`Agent`] routes requests for any number of origins to one pool per
//!   origin, creates pools lazily and drops them once they go idle.
//! - A [`Connector`] opens plain and TLS transports, resuming TLS sessions
//!   from a bounded cache shared by every connection it makes.
//! - [`Client`] and [`ClientPool`] own the connections to one origin.
//!
//! Requests are dispatched without waiting: a [`Dispatch`] queues the request
//! and reports the outcome to a [`Handler`] later. The [`request`] and
//! [`stream`] helpers wrap that in futures and go through a process-wide
//! default agent unless told otherwise.
//!
//! ```no_run
//! # async fn run() -> hyper_agent::Result<()> {
//! use std::sync::Arc;
//! use hyper_agent::{request, Agent, RequestOptions};
//!
//! let agent = Arc::new(Agent::new());
//! let res = request(
//!     "https://example.com/index.html",
//!     RequestOptions::with_dispatcher(agent),
//! )?
//! .await?;
//! println!("status: {}", res.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Optional Features
//!
//! - `tracing`: emits debug logs through the [`tracing`] crate.
//!
//! [`tracing`]: https://docs.rs/tracing

// `#[macro_use]` 使得 trace 模块中定义的日志宏（trace!、debug!）
// 在整个 crate 中可用。此模块必须最先声明，因为后续模块依赖这些宏。
#[macro_use]
mod trace;

/// Origin 注册表：按 origin 懒创建连接池并路由请求。
pub mod agent;
/// 基于 future 的请求与流式响应辅助函数。
pub mod api;
/// 单一 origin 的客户端与客户端池。
pub mod client;
// 内部通用工具模块（origin 规范化、容忍中毒的加锁）。
mod common;
/// Socket 连接器与 TLS 会话缓存。
pub mod connect;
/// dispatcher 抽象：Dispatch、Pool、Handler 以及请求选项。
pub mod dispatcher;
// 错误类型模块，通过下面的 `pub use` 导出公共 API。
mod error;
/// dispatcher 向监听者发出的生命周期事件。
pub mod event;
/// 进程级默认 dispatcher。
pub mod global;

// 将常用类型重新导出到 crate 顶层，使用户无需逐个引用子模块。
pub use crate::agent::Agent;
pub use crate::api::{request, stream, RequestOptions, ResponseData, StreamResponse};
pub use crate::client::{Client, ClientOptions, ClientPool, PoolVariant};
pub use crate::connect::Connector;
pub use crate::dispatcher::{Dispatch, DispatchOptions, Handler, Pool};
pub use crate::error::{Error, Informational, Result};
pub use crate::event::{DispatcherId, Event, Listener, Subscription};
pub use crate::global::{global_dispatcher, init_global_dispatcher, set_global_dispatcher};
