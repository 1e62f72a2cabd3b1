//! Round-robin TCP reverse proxy in front of a multi-instance process type.
//!
//! Each accepted connection takes the next slot of the rotation, whether or
//! not the upstream behind that slot turns out to be reachable. A failed
//! upstream costs only the connection that picked it: the client receives a
//! fixed `500` response and the rotation carries on.

use crate::config::UPSTREAM_CONNECT_TIMEOUT;
use crate::error::ProxyError;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Response written to a client whose upstream could not be reached.
pub const UPSTREAM_ERROR_RESPONSE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
Content-Type: text/plain\r\n\
Content-Length: 20\r\n\
Connection: close\r\n\
\r\n\
Upstream Proxy Error";

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fixed, ordered set of upstream targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPool {
    targets: Vec<Upstream>,
}

impl ProxyPool {
    pub fn new(targets: Vec<Upstream>) -> Result<Self, ProxyError> {
        if targets.is_empty() {
            return Err(ProxyError::EmptyPool);
        }
        Ok(Self { targets })
    }

    /// `size` targets on `host`, starting at `first_port`.
    pub fn contiguous(host: &str, first_port: u16, size: usize) -> Result<Self, ProxyError> {
        let targets = (0..size)
            .map(|offset| {
                u16::try_from(usize::from(first_port) + offset)
                    .map(|port| Upstream::new(host, port))
                    .map_err(|_| ProxyError::PortRange { first_port, size })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(targets)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn targets(&self) -> &[Upstream] {
        &self.targets
    }
}

/// Pool plus the rotation cursor. The cursor only ever moves forward, one
/// step per connection, for the lifetime of the value.
#[derive(Debug)]
pub struct RoundRobin {
    pool: ProxyPool,
    cursor: AtomicU64,
}

impl RoundRobin {
    pub fn new(pool: ProxyPool) -> Self {
        Self {
            pool,
            cursor: AtomicU64::new(0),
        }
    }

    /// Claims the next slot: connection `i` gets `pool[i mod len]`.
    pub fn next_target(&self) -> (u64, &Upstream) {
        let sequence = self.cursor.fetch_add(1, Ordering::Relaxed);
        let slot = (sequence % self.pool.len() as u64) as usize;
        (sequence, &self.pool.targets[slot])
    }

    /// Number of connections handled so far.
    pub fn handled(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub connect_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            connect_timeout: UPSTREAM_CONNECT_TIMEOUT,
        }
    }
}

pub struct ReverseProxy {
    listener: TcpListener,
    rotation: Arc<RoundRobin>,
    options: ProxyOptions,
}

impl ReverseProxy {
    /// Binds the single public socket.
    pub async fn bind(
        addr: &str,
        pool: ProxyPool,
        options: ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            rotation: Arc::new(RoundRobin::new(pool)),
            options,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn rotation(&self) -> Arc<RoundRobin> {
        Arc::clone(&self.rotation)
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let local = self.local_addr().ok();
        info!(
            listen = ?local,
            upstreams = %display_targets(self.rotation.pool()),
            "Proxy forwarding"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(handled = self.rotation.handled(), "Proxy shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (inbound, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            // Typically fd exhaustion; the listener itself is still usable.
                            warn!(error = %err, "Proxy accept failed");
                            continue;
                        }
                    };
                    let (sequence, target) = self.rotation.next_target();
                    let target = target.clone();
                    debug!(%peer, %target, sequence, "Forwarding connection");
                    let timeout = self.options.connect_timeout;
                    tokio::spawn(async move {
                        if let Err(err) = forward(inbound, peer, &target, timeout).await {
                            warn!(%peer, error = %err, "Proxy Error");
                        }
                    });
                }
            }
        }
    }
}

fn display_targets(pool: &ProxyPool) -> String {
    pool.targets()
        .iter()
        .map(Upstream::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

async fn connect(target: &Upstream, timeout: Duration) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(timeout, TcpStream::connect((target.host.as_str(), target.port)))
        .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::UpstreamUnreachable {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::ConnectTimeout {
            target: target.to_string(),
        }),
    }
}

async fn forward(
    mut inbound: TcpStream,
    peer: SocketAddr,
    target: &Upstream,
    timeout: Duration,
) -> Result<(), ProxyError> {
    let mut outbound = match connect(target, timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            reject(&mut inbound).await;
            return Err(err);
        }
    };

    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);
    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((sent, received)) => {
            debug!(%peer, %target, sent, received, "Connection closed");
            Ok(())
        }
        // Resets from either side end the connection; nothing to report upstream.
        Err(err) if is_disconnect(&err) => Ok(()),
        Err(source) => Err(ProxyError::Io { peer, source }),
    }
}

/// Writes the fixed error response, then drains the request so closing the
/// socket does not reset the connection before the client reads the reply.
async fn reject(inbound: &mut TcpStream) {
    if inbound.write_all(UPSTREAM_ERROR_RESPONSE).await.is_err() {
        return;
    }
    let _ = inbound.shutdown().await;
    let mut sink = [0u8; 1024];
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Ok(read) = inbound.read(&mut sink).await {
            if read == 0 {
                break;
            }
        }
    })
    .await;
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rotation_is_strict_round_robin() {
        let rotation = RoundRobin::new(ProxyPool::contiguous("localhost", 5001, 3).unwrap());
        let ports: Vec<u16> = (0..7).map(|_| rotation.next_target().1.port).collect();
        assert_eq!(ports, vec![5001, 5002, 5003, 5001, 5002, 5003, 5001]);
        assert_eq!(rotation.handled(), 7);
    }

    #[test]
    fn rotation_is_shared_across_threads() {
        let rotation = Arc::new(RoundRobin::new(
            ProxyPool::contiguous("localhost", 6001, 4).unwrap(),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rotation = Arc::clone(&rotation);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| rotation.next_target().1.port)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                *counts.entry(port).or_insert(0) += 1;
            }
        }
        // 800 claims over 4 slots: every slot is hit exactly 200 times.
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|count| *count == 200));
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(ProxyPool::new(vec![]), Err(ProxyError::EmptyPool)));
        assert!(matches!(
            ProxyPool::contiguous("localhost", 65535, 2),
            Err(ProxyError::PortRange { .. })
        ));
    }

    #[test]
    fn error_response_length_matches_body() {
        let text = std::str::from_utf8(UPSTREAM_ERROR_RESPONSE).unwrap();
        let (_, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "Upstream Proxy Error");
        assert!(text.contains(&format!("Content-Length: {}", body.len())));
    }
}
