//! Out-of-band TCP exchange of addressing info.
//!
//! Before any datagram can be addressed, the two endpoints swap one
//! [`AddressingInfo`] record over a TCP connection on a well-known port. The
//! listener binds the wildcard address, accepts exactly one connection,
//! sends its record and then receives the peer's. The connector connects,
//! receives and then sends. Both sides agreeing on this order is what keeps
//! the exchange from deadlocking.
//!
//! Each exchange uses one connection, which is closed when the exchange
//! returns, successfully or not. Short reads and writes are retried until
//! the whole record has moved; a zero-length transfer is end of stream.

pub mod error;
pub mod record;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub use error::ChannelError;
pub use record::{AddressingInfo, RECORD_LEN};

/// Which side of the exchange this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accept one connection on `port` of the wildcard address.
    Listener { port: u16 },
    /// Connect to `peer`.
    Connector { peer: SocketAddr },
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Listener { port } => write!(f, "listener(:{port})"),
            Role::Connector { peer } => write!(f, "connector({peer})"),
        }
    }
}

/// Run one exchange in the given role.
///
/// This binds and accepts in one step. Callers that need to observe the
/// bound-but-waiting phase use [`SideChannelListener`] directly.
pub async fn exchange(role: Role, local: &AddressingInfo) -> Result<AddressingInfo, ChannelError> {
    match role {
        Role::Listener { port } => {
            let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            SideChannelListener::bind(addr).await?.exchange(local).await
        }
        Role::Connector { peer } => connect_exchange(peer, local).await,
    }
}

/// A bound side-channel listener that serves a single exchange.
#[derive(Debug)]
pub struct SideChannelListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl SideChannelListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ChannelError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ChannelError::Bind { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| ChannelError::Bind { addr, source })?;

        tracing::info!(%local_addr, "side channel listening");

        Ok(Self { inner, local_addr })
    }

    /// The address actually bound (the port may differ if 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection, send `local`, then receive the peer's record.
    ///
    /// The listener is consumed: no second connection is ever accepted.
    pub async fn exchange(self, local: &AddressingInfo) -> Result<AddressingInfo, ChannelError> {
        let (mut stream, _) = self.inner.accept().await.map_err(ChannelError::Accept)?;
        drop(self.inner);
        let peer = stream.peer_addr().map_err(ChannelError::PeerAddr)?;
        tracing::info!(%peer, "side channel peer connected");

        let result = send_then_recv(&mut stream, local).await;
        let _ = stream.shutdown().await;
        result
    }
}

/// Connect to `peer`, receive its record, then send `local`.
pub async fn connect_exchange(
    peer: SocketAddr,
    local: &AddressingInfo,
) -> Result<AddressingInfo, ChannelError> {
    tracing::info!(%peer, "side channel connecting");
    let mut stream = TcpStream::connect(peer)
        .await
        .map_err(|source| ChannelError::Connect { addr: peer, source })?;

    let result = recv_then_send(&mut stream, local).await;
    let _ = stream.shutdown().await;
    result
}

async fn send_then_recv<S>(stream: &mut S, local: &AddressingInfo) -> Result<AddressingInfo, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_record(stream, local).await?;
    recv_record(stream).await
}

async fn recv_then_send<S>(stream: &mut S, local: &AddressingInfo) -> Result<AddressingInfo, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = recv_record(stream).await?;
    send_record(stream, local).await?;
    Ok(remote)
}

/// Write one record, retrying short writes.
pub async fn send_record<W>(stream: &mut W, info: &AddressingInfo) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let raw = info.encode();
    let mut sent = 0;
    while sent < raw.len() {
        let n = stream.write(&raw[sent..]).await?;
        if n == 0 {
            return Err(ChannelError::UnexpectedEof {
                transferred: sent,
                expected: raw.len(),
            });
        }
        sent += n;
    }
    stream.flush().await?;
    Ok(())
}

/// Read one record, retrying short reads.
pub async fn recv_record<R>(stream: &mut R) -> Result<AddressingInfo, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; RECORD_LEN];
    let mut received = 0;
    while received < raw.len() {
        let n = stream.read(&mut raw[received..]).await?;
        if n == 0 {
            return Err(ChannelError::UnexpectedEof {
                transferred: received,
                expected: RECORD_LEN,
            });
        }
        received += n;
    }
    Ok(AddressingInfo::decode(&raw))
}
