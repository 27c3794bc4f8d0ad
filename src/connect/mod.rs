//! Socket 连接器：建立到 origin 的明文与 TLS 传输
//!
//! [`Connector`] 把一个 [`Target`] 变成可用的 [`Conn`]。
//!
//! ## 会话恢复
//!
//! 同一 connector 建立的所有 TLS 连接共用一个有界的 [`SessionCache`]，
//! 既从中恢复会话，也向其中写入新会话，因此重连同一 server name 通常能跳过完整握手。
//!
//! 对同一 server name 的并发首次连接互不协调：各自未命中缓存、各自完成完整握手
//! 并各自写入会话。
//!
//! # 示例
//!
//! ```no_run
//! # async fn run() -> hyper_agent::Result<()> {
//! use hyper_agent::connect::{Connector, Target};
//!
//! let connector = Connector::builder().max_cached_sessions(16).build()?;
//! let target = Target::from_uri(&"https://example.com".parse().unwrap())?;
//! let conn = connector.connect(&target).await?;
//! assert!(conn.is_tls());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use http::uri::{Scheme, Uri};
use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::common::origin::default_port;
use crate::error::Error;

// 公共导出：连接类型与会话缓存
pub use self::io::Conn;
pub use self::session::{SessionCache, SessionStore, DEFAULT_MAX_CACHED_SESSIONS};

use self::io::{Invalidate, Stream};

mod io;
mod session;

/// 打开到目标的传输，并在连接之间复用 TLS 会话。
///
/// 克隆 `Connector` 的开销很小，所有克隆共享同一个会话缓存。
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    tls: TlsConnector,
    sessions: Arc<SessionStore>,
    server_name: Option<String>,
    socket_path: Option<PathBuf>,
}

/// 配置 [`Connector`] 的构建器。
#[derive(Clone)]
pub struct Builder {
    max_cached_sessions: usize,
    server_name: Option<String>,
    socket_path: Option<PathBuf>,
    tls: Option<ClientConfig>,
}

/// 连接目标。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// `https` 使用 TLS，其余为明文 socket
    pub scheme: Scheme,
    /// socket 要连接的地址，IPv6 不带方括号
    pub hostname: String,
    /// authority 中的 host；URL 带端口时包含端口
    pub host: String,
    /// 端口；TLS 默认 443，否则默认 80
    pub port: Option<u16>,
    /// 覆盖由 `host` 推导出的 TLS server name
    pub servername: Option<String>,
}

// ===== impl Connector =====

impl Connector {
    /// 以默认配置创建 connector。
    pub fn new() -> crate::Result<Connector> {
        Builder::new().build()
    }

    /// 创建用于配置新 connector 的构建器。
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// 连接到 `target`。
    ///
    /// socket 就绪时 resolve：明文在 TCP 连接建立后，TLS 在握手完成后。
    /// 握手失败时，先淘汰该 server name 的缓存会话，再返回错误。
    pub async fn connect(&self, target: &Target) -> crate::Result<Conn> {
        if !target.is_tls() {
            let port = target.port.unwrap_or_else(|| default_port(&target.scheme));
            trace!("connecting to {}:{}", target.hostname, port);
            return self.open(&target.hostname, port).await.map(Conn::plain);
        }

        let server_name = self.server_name(target)?;
        let key = server_name.to_str().into_owned();
        let port = target.port.unwrap_or(443);
        trace!(
            "connecting to {}:{} (server name {:?})",
            target.hostname,
            port,
            key
        );

        let stream = self.open(&target.hostname, port).await?;
        match self.inner.tls.connect(server_name, stream).await {
            Ok(tls) => {
                trace!("TLS handshake with {:?} complete", key);
                let sessions = self.inner.sessions.clone();
                Ok(Conn::tls(Invalidate::new(tls, key, sessions)))
            }
            Err(err) => {
                debug!("TLS handshake with {:?} failed: {}", key, err);
                self.inner.sessions.invalidate(&key, &err);
                Err(Error::new_connect(err))
            }
        }
    }

    /// 当前缓存了会话的 server name，最早的在前。
    pub fn cached_sessions(&self) -> Vec<String> {
        self.inner.sessions.server_names()
    }

    /// `server_name` 有缓存会话时返回 true。
    pub fn has_session(&self, server_name: &str) -> bool {
        self.inner.sessions.contains(server_name)
    }

    /// 会话缓存的容量。
    pub fn max_cached_sessions(&self) -> usize {
        self.inner.sessions.capacity()
    }

    fn server_name(&self, target: &Target) -> crate::Result<ServerName<'static>> {
        let name = target
            .servername
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.inner.server_name.as_deref())
            .map(str::to_owned)
            .unwrap_or_else(|| server_name_from_host(&target.host).to_owned());
        ServerName::try_from(name).map_err(Error::new_invalid_server_name)
    }

    async fn open(&self, hostname: &str, port: u16) -> crate::Result<Stream> {
        #[cfg(unix)]
        {
            if let Some(ref path) = self.inner.socket_path {
                return tokio::net::UnixStream::connect(path)
                    .await
                    .map(Stream::Unix)
                    .map_err(Error::new_connect);
            }
        }

        let tcp = TcpStream::connect((hostname, port))
            .await
            .map_err(Error::new_connect)?;
        tcp.set_nodelay(true).map_err(Error::new_connect)?;
        Ok(Stream::Tcp(tcp))
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("sessions", &self.inner.sessions)
            .field("server_name", &self.inner.server_name)
            .field("socket_path", &self.inner.socket_path)
            .finish()
    }
}

// ===== impl Builder =====

impl Builder {
    /// 以默认配置创建构建器。
    pub fn new() -> Builder {
        Builder {
            max_cached_sessions: DEFAULT_MAX_CACHED_SESSIONS,
            server_name: None,
            socket_path: None,
            tls: None,
        }
    }

    /// 设置缓存多少个 TLS 会话；`0` 禁用会话恢复。
    ///
    /// 默认为 100。
    pub fn max_cached_sessions(&mut self, max: usize) -> &mut Builder {
        self.max_cached_sessions = max;
        self
    }

    /// 设置目标未指定 server name 时使用的 TLS server name。
    pub fn server_name(&mut self, name: impl Into<String>) -> &mut Builder {
        self.server_name = Some(name.into());
        self
    }

    /// 所有目标都经由 `path` 处的 Unix domain socket 连接。
    ///
    /// 在其他平台上无效。
    pub fn socket_path(&mut self, path: impl Into<PathBuf>) -> &mut Builder {
        self.socket_path = Some(path.into());
        self
    }

    /// 设置 rustls 配置（信任根、客户端证书、ALPN 等）。
    ///
    /// 其中的 `resumption` 会被本 connector 的会话缓存替换。
    pub fn tls_config(&mut self, config: ClientConfig) -> &mut Builder {
        self.tls = Some(config);
        self
    }

    /// 构建 connector。
    pub fn build(&self) -> crate::Result<Connector> {
        let mut config = match self.tls {
            Some(ref config) => config.clone(),
            None => default_tls_config()?,
        };
        let sessions = Arc::new(SessionStore::new(self.max_cached_sessions));
        // 覆盖调用者配置中的 resumption，会话一律进入本缓存
        config.resumption = Resumption::store(sessions.clone());

        Ok(Connector {
            inner: Arc::new(Inner {
                tls: TlsConnector::from(Arc::new(config)),
                sessions,
                server_name: self.server_name.clone(),
                socket_path: self.socket_path.clone(),
            }),
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("max_cached_sessions", &self.max_cached_sessions)
            .field("server_name", &self.server_name)
            .field("socket_path", &self.socket_path)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn default_tls_config() -> crate::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(Error::new_connect)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

// ===== impl Target =====

impl Target {
    /// 由绝对 URI 描述目标。
    pub fn from_uri(uri: &Uri) -> crate::Result<Target> {
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| Error::new_invalid_url(format!("{uri} has no scheme")))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::new_invalid_url(format!("{uri} has no host")))?;
        let port = uri.port_u16();

        Ok(Target {
            scheme,
            hostname: server_name_from_host(host).to_owned(),
            host: match port {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            },
            port,
            servername: None,
        })
    }

    /// 连接此目标需要协商 TLS 时返回 true。
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }
}

/// 从 authority 的 host 推导 TLS server name。
///
/// IPv6 字面量去掉方括号，`:port` 后缀被丢弃，其余原样返回。
///
/// ```
/// use hyper_agent::connect::server_name_from_host;
///
/// assert_eq!(server_name_from_host("example.com:8443"), "example.com");
/// assert_eq!(server_name_from_host("[::1]:3000"), "::1");
/// assert_eq!(server_name_from_host("example.com"), "example.com");
/// ```
pub fn server_name_from_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> Target {
        Target::from_uri(&url.parse().unwrap()).unwrap()
    }

    #[test]
    fn target_from_uri() {
        let t = target("https://example.com:8443/x");
        assert!(t.is_tls());
        assert_eq!(t.hostname, "example.com");
        assert_eq!(t.host, "example.com:8443");
        assert_eq!(t.port, Some(8443));
        assert_eq!(t.servername, None);

        let t = target("http://[::1]/");
        assert!(!t.is_tls());
        assert_eq!(t.hostname, "::1");
        assert_eq!(t.host, "[::1]");
        assert_eq!(t.port, None);
    }

    #[test]
    fn target_requires_absolute_uri() {
        let err = Target::from_uri(&"/path".parse().unwrap()).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn server_name_from_host_literals() {
        assert_eq!(server_name_from_host("a.example"), "a.example");
        assert_eq!(server_name_from_host("a.example:443"), "a.example");
        assert_eq!(server_name_from_host("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(server_name_from_host("[fe80::1]"), "fe80::1");
        assert_eq!(server_name_from_host("[fe80::1]:8080"), "fe80::1");
        assert_eq!(server_name_from_host("::1"), "::1");
    }

    #[test]
    fn server_name_precedence() {
        let connector = Connector::new().unwrap();
        let mut t = target("https://a.example:8443");
        assert_eq!(connector.server_name(&t).unwrap().to_str(), "a.example");

        let connector = Connector::builder()
            .server_name("default.example")
            .build()
            .unwrap();
        assert_eq!(
            connector.server_name(&t).unwrap().to_str(),
            "default.example"
        );

        t.servername = Some("override.example".into());
        assert_eq!(
            connector.server_name(&t).unwrap().to_str(),
            "override.example"
        );

        t.servername = Some(String::new());
        assert_eq!(
            connector.server_name(&t).unwrap().to_str(),
            "default.example"
        );
    }

    #[test]
    fn invalid_server_name() {
        let connector = Connector::new().unwrap();
        let mut t = target("https://a.example");
        t.servername = Some("not a name!".into());
        assert!(connector.server_name(&t).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn builder_capacity() {
        assert_eq!(
            Connector::new().unwrap().max_cached_sessions(),
            DEFAULT_MAX_CACHED_SESSIONS
        );
        let connector = Connector::builder().max_cached_sessions(0).build().unwrap();
        assert_eq!(connector.max_cached_sessions(), 0);
        assert!(connector.cached_sessions().is_empty());
    }
}
