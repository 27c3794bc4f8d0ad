//! TLS 会话缓存模块
//!
//! 本模块实现 [`Connector`](super::Connector) 用于会话恢复（session resumption）
//! 的有界缓存，使重连同一 server name 时可以跳过完整握手。
//!
//! ## 组成
//!
//! - [`SessionCache`]：从 TLS server name 到恢复状态的有界映射，按插入顺序淘汰。
//!   读取不会刷新条目，最早插入的条目总是下一个被淘汰，这是有界 FIFO 而不是 LRU。
//!   容量为 0 时缓存被禁用。
//! - [`SessionStore`]：把 `SessionCache` 接入 rustls 的 [`ClientSessionStore`]，
//!   同一 connector 建立的所有连接都从这里恢复、也都向这里写入。
//!
//! ## 失效
//!
//! 某个 server name 的 socket 报告非 informational 类错误时，
//! 该 server name 的全部条目（会话票据与密钥交换提示）都被删除。
//! TLS 1.3 票据只能使用一次，某个 server name 的最后一张票据被取走后，
//! 该条目也随之删除，不再占用容量。

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Mutex;

use indexmap::IndexMap;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;

use crate::common::lock;
use crate::error;

/// 未配置时使用的缓存容量。
pub const DEFAULT_MAX_CACHED_SESSIONS: usize = 100;

// 一次握手可能收到多张 TLS 1.3 票据，每张只能用一次
const MAX_TLS13_TICKETS: usize = 8;

/// 以 TLS server name 为键、按插入顺序淘汰的有界缓存。
///
/// 容量为 0 时缓存被禁用：插入被丢弃，查找总是未命中。
#[derive(Debug)]
pub struct SessionCache<T> {
    entries: IndexMap<String, T>,
    capacity: usize,
}

impl<T> SessionCache<T> {
    /// 创建至多容纳 `capacity` 个条目的空缓存。
    pub fn new(capacity: usize) -> SessionCache<T> {
        SessionCache {
            entries: IndexMap::new(),
            capacity,
        }
    }

    /// 条目数上限。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前条目数。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 没有任何条目时返回 true。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 查找 `server_name` 的条目。
    pub fn get(&self, server_name: &str) -> Option<&T> {
        self.entries.get(server_name)
    }

    /// 以可变方式查找 `server_name` 的条目，不改变其淘汰顺序。
    pub fn get_mut(&mut self, server_name: &str) -> Option<&mut T> {
        self.entries.get_mut(server_name)
    }

    /// 为 `server_name` 缓存 `value`。
    ///
    /// 缓存已满时先淘汰最早的条目，即使 `server_name` 已在缓存中。
    /// 未满时覆盖已有条目不改变它在淘汰顺序中的位置。
    pub fn insert(&mut self, server_name: String, value: T) {
        if self.capacity == 0 {
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some((_oldest, _)) = self.entries.shift_remove_index(0) {
                trace!("session cache full, evicted {:?}", _oldest);
            }
        }

        self.entries.insert(server_name, value);
    }

    /// 删除 `server_name` 的条目。
    pub fn remove(&mut self, server_name: &str) -> Option<T> {
        self.entries.shift_remove(server_name)
    }

    /// 从最早到最新遍历已缓存的 server name。
    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// 因传输错误删除 `server_name` 的条目；informational 类错误除外。
    /// 返回是否确实删除了条目。
    pub(crate) fn invalidate(&mut self, server_name: &str, err: &io::Error) -> bool {
        if error::is_informational(err) {
            return false;
        }
        self.remove(server_name).is_some()
    }
}

/// 一个 server name 的恢复状态。
enum Ticket {
    Tls12(Tls12ClientSessionValue),
    Tls13(VecDeque<Tls13ClientSessionValue>),
}

struct Sessions {
    tickets: SessionCache<Ticket>,
    kx_hints: SessionCache<NamedGroup>,
}

/// 由 [`SessionCache`] 支撑的 rustls [`ClientSessionStore`]。
pub struct SessionStore {
    sessions: Mutex<Sessions>,
}

impl SessionStore {
    /// 创建至多为 `capacity` 个 server name 缓存会话的 store。
    pub fn new(capacity: usize) -> SessionStore {
        SessionStore {
            sessions: Mutex::new(Sessions {
                tickets: SessionCache::new(capacity),
                kx_hints: SessionCache::new(capacity),
            }),
        }
    }

    /// 可缓存会话的 server name 数量上限。
    pub fn capacity(&self) -> usize {
        lock(&self.sessions).tickets.capacity()
    }

    /// 当前缓存了会话的 server name 数量。
    pub fn len(&self) -> usize {
        lock(&self.sessions).tickets.len()
    }

    /// 没有缓存任何会话时返回 true。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `server_name` 有缓存的会话时返回 true。
    pub fn contains(&self, server_name: &str) -> bool {
        lock(&self.sessions).tickets.get(server_name).is_some()
    }

    /// 缓存了会话的 server name，最早的在前。
    pub fn server_names(&self) -> Vec<String> {
        lock(&self.sessions)
            .tickets
            .server_names()
            .map(str::to_owned)
            .collect()
    }

    /// 传输错误后清除 `server_name` 的全部缓存；informational 类错误除外。
    pub(crate) fn invalidate(&self, server_name: &str, err: &io::Error) {
        let mut sessions = lock(&self.sessions);
        if sessions.tickets.invalidate(server_name, err) {
            debug!("evicted TLS session for {:?}: {}", server_name, err);
        }
        sessions.kx_hints.invalidate(server_name, err);
    }
}

fn key(server_name: &ServerName<'_>) -> String {
    server_name.to_str().into_owned()
}

impl ClientSessionStore for SessionStore {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        lock(&self.sessions).kx_hints.insert(key(&server_name), group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        lock(&self.sessions).kx_hints.get(&key(server_name)).copied()
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        let name = key(&server_name);
        trace!("caching TLS 1.2 session for {:?}", name);
        lock(&self.sessions)
            .tickets
            .insert(name, Ticket::Tls12(value));
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        match lock(&self.sessions).tickets.get(&key(server_name)) {
            Some(Ticket::Tls12(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        let name = key(server_name);
        let mut sessions = lock(&self.sessions);
        if matches!(sessions.tickets.get(&name), Some(Ticket::Tls12(_))) {
            sessions.tickets.remove(&name);
        }
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        let name = key(&server_name);
        trace!("caching TLS 1.3 ticket for {:?}", name);
        let mut sessions = lock(&self.sessions);
        let mut tickets = match sessions.tickets.get_mut(&name) {
            Some(Ticket::Tls13(tickets)) => std::mem::take(tickets),
            _ => VecDeque::new(),
        };
        if tickets.len() >= MAX_TLS13_TICKETS {
            tickets.pop_front();
        }
        tickets.push_back(value);
        sessions.tickets.insert(name, Ticket::Tls13(tickets));
    }

    fn take_tls13_ticket(
        &self,
        server_name: &ServerName<'static>,
    ) -> Option<Tls13ClientSessionValue> {
        let name = key(server_name);
        let mut sessions = lock(&self.sessions);
        let (ticket, spent) = match sessions.tickets.get_mut(&name) {
            Some(Ticket::Tls13(tickets)) => (tickets.pop_back(), tickets.is_empty()),
            _ => return None,
        };
        // 用尽的条目不再占用容量
        if spent {
            sessions.tickets.remove(&name);
        }
        ticket
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = lock(&self.sessions);
        f.debug_struct("SessionStore")
            .field("len", &sessions.tickets.len())
            .field("capacity", &sessions.tickets.capacity())
            .finish()
    }
}
