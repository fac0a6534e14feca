//! RESP wire-protocol store backend.
//!
//! A deliberately small RESP2 client: the gateway needs GET, SET (with EX
//! and NX), DEL, RPUSH, PING, and AUTH, nothing more. One connection per
//! store role, established lazily and re-established with exponential
//! backoff after failures; sessions are never shared between roles or
//! inherited across workers. Every operation runs under the configured
//! store timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{RoleCredential, StoreConfig};
use crate::error::{Result, TollgateError};
use crate::store::{PolicyStore, StoreRole};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type Conn = BufStream<Box<dyn Transport>>;

/// Decoded RESP reply.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Simple(String),
    Bulk(Option<String>),
    Int(i64),
}

struct RoleConn {
    conn: Option<Conn>,
    backoff: Duration,
    next_attempt: Instant,
}

impl RoleConn {
    fn new() -> Self {
        Self {
            conn: None,
            backoff: INITIAL_BACKOFF,
            next_attempt: Instant::now(),
        }
    }

    fn note_failure(&mut self) {
        self.conn = None;
        self.next_attempt = Instant::now() + self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
    }

    fn note_success(&mut self) {
        self.backoff = INITIAL_BACKOFF;
    }
}

/// Store client speaking RESP over TCP or TLS.
pub struct RespStore {
    config: StoreConfig,
    tls: Option<TlsConnector>,
    roles: [Mutex<RoleConn>; 4],
}

fn role_index(role: StoreRole) -> usize {
    match role {
        StoreRole::Scan => 0,
        StoreRole::Approval => 1,
        StoreRole::Audit => 2,
        StoreRole::Health => 3,
    }
}

impl RespStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let tls = if config.tls {
            Some(build_tls_connector()?)
        } else {
            None
        };
        Ok(Self {
            config,
            tls,
            roles: [
                Mutex::new(RoleConn::new()),
                Mutex::new(RoleConn::new()),
                Mutex::new(RoleConn::new()),
                Mutex::new(RoleConn::new()),
            ],
        })
    }

    fn credential(&self, role: StoreRole) -> Result<&RoleCredential> {
        let roles = self
            .config
            .roles
            .as_ref()
            .ok_or_else(|| TollgateError::PolicyStore("store roles not configured".into()))?;
        Ok(match role {
            StoreRole::Scan => &roles.scan,
            StoreRole::Approval => &roles.approval,
            StoreRole::Audit => &roles.audit,
            StoreRole::Health => &roles.health,
        })
    }

    async fn open(&self, role: StoreRole) -> Result<Conn> {
        let address = self
            .config
            .address
            .as_deref()
            .ok_or_else(|| TollgateError::PolicyStore("store address not configured".into()))?;
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| TollgateError::PolicyStore(format!("connect {}: {}", address, e)))?;

        let stream: Box<dyn Transport> = match &self.tls {
            None => Box::new(tcp),
            Some(connector) => {
                let name = self
                    .config
                    .tls_server_name
                    .clone()
                    .or_else(|| address.rsplit_once(':').map(|(h, _)| h.to_string()))
                    .unwrap_or_else(|| address.to_string());
                let server_name = rustls::ServerName::try_from(name.as_str())
                    .map_err(|e| TollgateError::PolicyStore(format!("bad TLS name: {}", e)))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TollgateError::PolicyStore(format!("TLS handshake: {}", e)))?;
                Box::new(tls)
            }
        };

        let mut conn = BufStream::new(stream);
        let cred = self.credential(role)?;
        let reply = exchange(&mut conn, &["AUTH", &cred.username, &cred.password]).await?;
        match reply {
            Reply::Simple(ref s) if s == "OK" => {
                debug!("store connection authenticated (role {:?})", role);
                Ok(conn)
            }
            other => Err(TollgateError::PolicyStore(format!(
                "AUTH rejected: {:?}",
                other
            ))),
        }
    }

    /// Run one command on the role's connection, establishing it lazily.
    async fn command(&self, role: StoreRole, args: &[&str]) -> Result<Reply> {
        let mut slot = self.roles[role_index(role)].lock().await;

        if slot.conn.is_none() {
            if Instant::now() < slot.next_attempt {
                return Err(TollgateError::PolicyStore(
                    "store unavailable (reconnect backoff)".to_string(),
                ));
            }
            match timeout(self.config.timeout(), self.open(role)).await {
                Ok(Ok(conn)) => slot.conn = Some(conn),
                Ok(Err(e)) => {
                    slot.note_failure();
                    return Err(e);
                }
                Err(_) => {
                    slot.note_failure();
                    return Err(TollgateError::PolicyStore("connect timeout".to_string()));
                }
            }
        }

        let Some(conn) = slot.conn.as_mut() else {
            return Err(TollgateError::PolicyStore("no connection".to_string()));
        };
        match timeout(self.config.timeout(), exchange(conn, args)).await {
            Ok(Ok(reply)) => {
                slot.note_success();
                Ok(reply)
            }
            Ok(Err(e)) => {
                warn!("store command failed: {}", e);
                slot.note_failure();
                Err(e)
            }
            Err(_) => {
                warn!("store command timed out");
                slot.note_failure();
                Err(TollgateError::PolicyStore("operation timeout".to_string()))
            }
        }
    }
}

/// TTL in whole seconds; sub-second requests still get a 1s floor so a
/// configured expiry can never become "no expiry".
fn ttl_secs(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

#[async_trait]
impl PolicyStore for RespStore {
    async fn get(&self, role: StoreRole, key: &str) -> Result<Option<String>> {
        match self.command(role, &["GET", key]).await? {
            Reply::Bulk(v) => Ok(v),
            other => Err(unexpected("GET", other)),
        }
    }

    async fn put(
        &self,
        role: StoreRole,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let reply = match ttl {
            Some(ttl) => {
                self.command(role, &["SET", key, value, "EX", &ttl_secs(ttl)])
                    .await?
            }
            None => self.command(role, &["SET", key, value]).await?,
        };
        match reply {
            Reply::Simple(ref s) if s == "OK" => Ok(()),
            other => Err(unexpected("SET", other)),
        }
    }

    async fn delete(&self, role: StoreRole, key: &str) -> Result<bool> {
        match self.command(role, &["DEL", key]).await? {
            Reply::Int(n) => Ok(n > 0),
            other => Err(unexpected("DEL", other)),
        }
    }

    async fn set_if_absent(
        &self,
        role: StoreRole,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let reply = self
            .command(role, &["SET", key, value, "EX", &ttl_secs(ttl), "NX"])
            .await?;
        match reply {
            Reply::Simple(ref s) if s == "OK" => Ok(true),
            // Null bulk means the key was already held.
            Reply::Bulk(None) => Ok(false),
            other => Err(unexpected("SET NX", other)),
        }
    }

    async fn append(&self, role: StoreRole, key: &str, entry: &str) -> Result<()> {
        match self.command(role, &["RPUSH", key, entry]).await? {
            Reply::Int(_) => Ok(()),
            other => Err(unexpected("RPUSH", other)),
        }
    }

    async fn ping(&self) -> Result<()> {
        match self.command(StoreRole::Health, &["PING"]).await? {
            Reply::Simple(ref s) if s == "PONG" => Ok(()),
            other => Err(unexpected("PING", other)),
        }
    }
}

fn unexpected(cmd: &str, reply: Reply) -> TollgateError {
    TollgateError::PolicyStore(format!("unexpected {} reply: {:?}", cmd, reply))
}

fn build_tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs()
        .map_err(|e| TollgateError::PolicyStore(format!("load native certs: {}", e)))?;
    for cert in native_certs {
        root_store
            .add(&rustls::Certificate(cert.0))
            .map_err(|e| TollgateError::PolicyStore(format!("bad native cert: {}", e)))?;
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Write one command as a RESP array of bulk strings and read one reply.
async fn exchange(conn: &mut Conn, args: &[&str]) -> Result<Reply> {
    let mut buf = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    conn.write_all(&buf)
        .await
        .map_err(|e| TollgateError::PolicyStore(format!("write: {}", e)))?;
    conn.flush()
        .await
        .map_err(|e| TollgateError::PolicyStore(format!("flush: {}", e)))?;
    read_reply(conn).await
}

async fn read_line(conn: &mut Conn) -> Result<String> {
    let mut line = String::new();
    let n = conn
        .read_line(&mut line)
        .await
        .map_err(|e| TollgateError::PolicyStore(format!("read: {}", e)))?;
    if n == 0 {
        return Err(TollgateError::PolicyStore("connection closed".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_reply(conn: &mut Conn) -> Result<Reply> {
    let line = read_line(conn).await?;
    if line.is_empty() {
        return Err(TollgateError::PolicyStore("empty reply line".to_string()));
    }
    let (prefix, rest) = line.split_at(1);
    match prefix {
        "+" => Ok(Reply::Simple(rest.to_string())),
        "-" => Err(TollgateError::PolicyStore(format!("store error: {}", rest))),
        ":" => rest
            .parse::<i64>()
            .map(Reply::Int)
            .map_err(|_| TollgateError::PolicyStore(format!("bad integer reply: {}", rest))),
        "$" => {
            let len: i64 = rest
                .parse()
                .map_err(|_| TollgateError::PolicyStore(format!("bad bulk length: {}", rest)))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut data = vec![0u8; len as usize + 2];
            conn.read_exact(&mut data)
                .await
                .map_err(|e| TollgateError::PolicyStore(format!("bulk read: {}", e)))?;
            data.truncate(len as usize);
            let value = String::from_utf8(data)
                .map_err(|_| TollgateError::PolicyStore("non-UTF8 bulk value".to_string()))?;
            Ok(Reply::Bulk(Some(value)))
        }
        _ => Err(TollgateError::PolicyStore(format!(
            "unrecognized reply: {}",
            line
        ))),
    }
}
