//! URL 拆分与 origin 规范化
//!
//! 一个 origin 由 scheme、host 和 port 组成，是连接池划分的单位：同一 origin
//! 的所有请求共用一个池。因此同一个逻辑端点必须总是得到同一个 origin 字符串：
//!
//! - scheme 与 host 一律转为小写；
//! - 端口等于 scheme 的默认端口（`http` 为 80，`https` 为 443）时省略；
//! - user info 从不出现在 origin 中。
//!
//! 这样 `http://127.0.0.1:80/` 与 `HTTP://127.0.0.1/` 会路由到同一个池。

use http::uri::{Scheme, Uri};

use crate::error::Error;

/// 一个 URL 被拆成的、dispatch 需要的两部分。
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Parts {
    /// 规范化后的 `scheme://host[:port]`
    pub(crate) origin: String,
    /// 路径加查询串，总以 `/` 开头
    pub(crate) path: String,
}

/// 一次性将 `url` 解析为 origin 和路径加查询串。
///
/// URL 没有路径时，路径为 `/`。
pub(crate) fn split(url: &str) -> crate::Result<Parts> {
    let uri = url.parse::<Uri>().map_err(Error::new_invalid_url)?;
    let origin = origin(&uri).ok_or_else(|| Error::new_invalid_url(format!("{url:?} has no origin")))?;
    let path = match uri.path_and_query().map(|pq| pq.as_str()) {
        Some(pq) if pq.starts_with('/') => pq.to_owned(),
        Some(pq) if !pq.is_empty() => format!("/{pq}"),
        _ => "/".to_owned(),
    };
    Ok(Parts { origin, path })
}

/// 返回规范化的 `scheme://host[:port]`；缺少 scheme 或 host 时返回 `None`。
pub(crate) fn origin(uri: &Uri) -> Option<String> {
    let scheme = uri.scheme()?;
    let host = uri.host()?.to_ascii_lowercase();
    let name = scheme.as_str().to_ascii_lowercase();
    Some(match uri.port_u16() {
        // 默认端口不写入 origin
        Some(port) if port != default_port(scheme) => format!("{name}://{host}:{port}"),
        _ => format!("{name}://{host}"),
    })
}

/// scheme 未指定端口时隐含的端口。
pub(crate) fn default_port(scheme: &Scheme) -> u16 {
    if *scheme == Scheme::HTTPS {
        443
    } else {
        80
    }
}
