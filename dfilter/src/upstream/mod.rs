// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Upstream resolver I/O.
//!
//! Each configured resolver gets a pool of connected UDP sockets (optionally
//! bound to an egress device). Queries are re-id'd, answers matched, and
//! truncated responses retried over TCP.

pub mod interface;
pub mod retry;

pub use interface::{BindStrategy, InterfaceBinding, InterfaceManager, PathEvent};
pub use retry::{RetryManager, RetryReason};

use crate::MAX_LEN;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool::{
    managed::{self, BuildError, Manager, Pool, RecycleError},
    Runtime,
};
use domain::base::Message;
use log::warn;
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{error::Elapsed, timeout},
};

const MAX_ERROR_TOLERANCE: u8 = 2;
const WAIT_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));
const DEFAULT_POOL_SIZE: usize = 16;

/// A shorthand for returning upstream errors.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// All possible errors that may incur when talking to upstream resolvers.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The per-query deadline elapsed.
    #[error(transparent)]
    TimeError(#[from] Elapsed),

    /// IO Error
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Run error from the connection pool.
    #[error(transparent)]
    PoolRunError(#[from] managed::PoolError<std::io::Error>),

    /// Build error from the connection pool.
    #[error(transparent)]
    PoolBuildError(#[from] BuildError<std::io::Error>),

    /// Composing or parsing ran out of buffer.
    #[error(transparent)]
    ShortBuf(#[from] domain::base::ShortBuf),

    /// No resolver is configured.
    #[error("no upstream resolvers configured")]
    NoUpstreams,

    /// A configured VPN CIDR does not parse.
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// The peer closed the connection mid-exchange.
    #[error("upstream peer closed the connection")]
    PeerClosed,
}

/// The connection initiator. The primary reason for its existence is to
/// reduce the boilerplate of implementing the pool's Manager directly.
#[async_trait]
pub trait ConnInitiator: Send + Sync + 'static {
    /// The pooled connection type.
    type Connection: QHandle;

    /// Open one connection.
    async fn create(&self) -> std::io::Result<Self::Connection>;

    /// Short transport tag for logs.
    fn conn_type(&self) -> &'static str;
}

/// A local ConnInitiator wrapper carrying a per-connection error count.
pub struct ConnInitWrapper<T: ConnInitiator>(T);

#[async_trait]
impl<T: ConnInitiator> Manager for ConnInitWrapper<T> {
    type Type = (T::Connection, u8);

    type Error = std::io::Error;

    async fn create(&self) -> std::result::Result<Self::Type, Self::Error> {
        Ok((self.0.create().await?, 0))
    }

    async fn recycle(&self, obj: &mut Self::Type) -> managed::RecycleResult<Self::Error> {
        obj.0.reusable().await?;
        if obj.1 >= MAX_ERROR_TOLERANCE {
            warn!("the number of error(s) encountered exceeded the threshold");
            Err(RecycleError::StaticMessage(
                "the number of error(s) encountered exceeded the threshold",
            ))
        } else {
            Ok(())
        }
    }
}

/// One query/response exchange over an established connection.
#[async_trait]
pub trait QHandle: Send + Sync {
    /// Send the query and await its matching answer.
    async fn query(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>>;

    /// Whether the connection can be pooled again.
    async fn reusable(&self) -> managed::RecycleResult<std::io::Error> {
        Ok(())
    }
}

/// UDP connection initiator for one resolver, optionally bound to an egress
/// device (VPN interface steering).
#[derive(Clone)]
pub struct Udp {
    addr: SocketAddr,
    bind_device: Option<String>,
}

impl Udp {
    /// A creator for connected UDP sockets to `addr`.
    pub fn new(addr: SocketAddr, bind_device: Option<String>) -> Self {
        Self { addr, bind_device }
    }
}

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

#[async_trait]
impl ConnInitiator for Udp {
    type Connection = UdpSocket;

    async fn create(&self) -> std::io::Result<Self::Connection> {
        let socket = UdpSocket::bind(bind_addr(self.addr.is_ipv4())).await?;
        if let Some(device) = &self.bind_device {
            bind_to_device(&socket, device)?;
        }
        socket.connect(self.addr).await?;
        Ok(socket)
    }

    fn conn_type(&self) -> &'static str {
        "UDP"
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_to_device(socket: &UdpSocket, device: &str) -> std::io::Result<()> {
    use socket2::SockRef;
    SockRef::from(socket).bind_device(Some(device.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_to_device(_socket: &UdpSocket, device: &str) -> std::io::Result<()> {
    warn!("egress binding to '{}' unsupported on this platform", device);
    Ok(())
}

#[async_trait]
impl QHandle for UdpSocket {
    async fn query(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        // Randomnize the message id so upstream answers cannot be spoofed
        // against a predictable one.
        let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))?;
        msg.header_mut().set_random_id();
        let msg = msg.for_slice();

        self.send(msg.as_slice()).await?;

        loop {
            let mut buf = BytesMut::with_capacity(MAX_LEN);
            buf.resize(MAX_LEN, 0);
            let len = self.recv(&mut buf).await?;
            buf.resize(len, 0);

            // We ignore garbage since there is a timer on this whole thing.
            let answer = match Message::from_octets(buf.freeze()) {
                Ok(answer) => answer,
                Err(_) => continue,
            };
            if !answer.is_answer(&msg) {
                continue;
            }
            return Ok(answer);
        }
    }
}

// TCP exchange with the RFC length prefix, used when UDP answers truncate.
async fn query_tcp(addr: SocketAddr, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
    let mut stream = TcpStream::connect(addr).await?;

    let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))?;
    msg.header_mut().set_random_id();
    let msg = msg.for_slice();

    let len = u16::try_from(msg.as_slice().len())
        .map_err(|_| UpstreamError::PeerClosed)?
        .to_be_bytes();
    let mut payload = BytesMut::with_capacity(msg.as_slice().len() + 2);
    payload.extend_from_slice(&len);
    payload.extend_from_slice(msg.as_slice());
    stream.write_all(&payload).await?;
    stream.flush().await?;

    loop {
        let mut len = [0; 2];
        stream.read_exact(&mut len).await?;
        let len = u16::from_be_bytes(len);

        let mut buf = BytesMut::with_capacity(len.into());
        buf.resize(len.into(), 0);
        stream.read_exact(&mut buf).await?;

        let answer = match Message::from_octets(buf.freeze()) {
            Ok(answer) => answer,
            Err(_) => continue,
        };
        if !answer.is_answer(&msg) {
            continue;
        }
        return Ok(answer);
    }
}

struct Resolver {
    addr: SocketAddr,
    pool: Pool<ConnInitWrapper<Udp>>,
}

/// The configured resolver set, in failover order.
pub struct Upstreams {
    resolvers: Vec<Resolver>,
    timeout: Duration,
    tcp_fallback: bool,
}

impl Upstreams {
    /// Build pools for `addrs`, applying any per-resolver egress device from
    /// `devices`. Order is failover order.
    pub fn new(
        addrs: &[SocketAddr],
        devices: &HashMap<SocketAddr, String>,
        timeout: Duration,
        tcp_fallback: bool,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(UpstreamError::NoUpstreams);
        }
        let mut resolvers = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let initiator = Udp::new(*addr, devices.get(addr).cloned());
            let pool = Pool::builder(ConnInitWrapper(initiator))
                .max_size(DEFAULT_POOL_SIZE)
                .wait_timeout(WAIT_TIMEOUT)
                .runtime(Runtime::Tokio1)
                .build()?;
            resolvers.push(Resolver { addr: *addr, pool });
        }
        Ok(Self {
            resolvers,
            timeout,
            tcp_fallback,
        })
    }

    /// Number of resolvers configured.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Whether no resolver is configured.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Address of resolver `index`.
    pub fn addr(&self, index: usize) -> Option<SocketAddr> {
        self.resolvers.get(index).map(|r| r.addr)
    }

    /// Send `msg` through resolver `index`, with the per-query timeout and
    /// the TCP retry on truncation.
    pub async fn query(&self, index: usize, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let resolver = self
            .resolvers
            .get(index)
            .ok_or(UpstreamError::NoUpstreams)?;

        let mut conn = resolver.pool.get().await?;
        let answer = match timeout(self.timeout, conn.0.query(msg)).await {
            Ok(Ok(answer)) => {
                conn.1 = 0;
                answer
            }
            Ok(Err(e)) => {
                conn.1 += 1;
                return Err(e);
            }
            Err(e) => {
                conn.1 += 1;
                return Err(UpstreamError::TimeError(e));
            }
        };

        if self.tcp_fallback && answer.header().tc() {
            warn!("upstream {} truncated the answer, retrying over TCP", resolver.addr);
            return timeout(self.timeout, query_tcp(resolver.addr, msg)).await?;
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{build_query, Server};
    use domain::base::Rtype;
    use std::net::Ipv4Addr;

    async fn spawn_mock(answer: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(Server::new(socket, answer, 300).run());
        addr
    }

    #[tokio::test]
    async fn query_roundtrip_through_pool() {
        let addr = spawn_mock(Ipv4Addr::new(9, 9, 9, 9)).await;
        let upstreams = Upstreams::new(
            &[addr],
            &HashMap::new(),
            Duration::from_secs(2),
            false,
        )
        .unwrap();

        let query = build_query("example.com", Rtype::A, 1234);
        let answer = upstreams.query(0, &query).await.unwrap();
        assert!(answer.header().qr());
        assert_eq!(
            answer.first_question().unwrap().qname().to_string(),
            query.first_question().unwrap().qname().to_string()
        );
    }

    #[tokio::test]
    async fn timeout_is_typed() {
        // An address nothing answers on.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let upstreams = Upstreams::new(
            &[addr],
            &HashMap::new(),
            Duration::from_millis(100),
            false,
        )
        .unwrap();

        let query = build_query("example.com", Rtype::A, 1);
        match upstreams.query(0, &query).await {
            Err(UpstreamError::TimeError(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_resolver_list_rejected() {
        let result = Upstreams::new(&[], &HashMap::new(), Duration::from_secs(1), false);
        assert!(matches!(result, Err(UpstreamError::NoUpstreams)));
    }
}
