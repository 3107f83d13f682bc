use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Correlates a signal registration, its logical address and every outgoing
/// connection the inside peer opens for it.
pub type SignalId = u32;

const TAG_INCOMING: u8 = b'1';
const TAG_OUTGOING: u8 = b'2';
const TAG_SIGNAL: u8 = b'3';

/// Sent on a signal stream to ask the inside peer for one new connection.
pub const NUDGE: u8 = b'0';

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown connection type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unexpected byte {0:#04x} on signal stream")]
    UnexpectedNudge(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer went away cleanly before the next frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// First byte of every physical connection directed at the outside peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// A plain session initiated by the inside peer.
    Incoming,
    /// A connection opened in answer to a nudge; followed by the signal id.
    Outgoing,
    /// Registration of a new signal channel.
    Signal,
}

impl ConnectionType {
    pub const fn tag(self) -> u8 {
        match self {
            ConnectionType::Incoming => TAG_INCOMING,
            ConnectionType::Outgoing => TAG_OUTGOING,
            ConnectionType::Signal => TAG_SIGNAL,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            TAG_INCOMING => Ok(ConnectionType::Incoming),
            TAG_OUTGOING => Ok(ConnectionType::Outgoing),
            TAG_SIGNAL => Ok(ConnectionType::Signal),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Incoming => "incoming",
            ConnectionType::Outgoing => "outgoing",
            ConnectionType::Signal => "signal",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn write_connection_type<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    kind: ConnectionType,
) -> Result<(), ProtocolError> {
    w.write_u8(kind.tag()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_connection_type<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> Result<ConnectionType, ProtocolError> {
    let tag = r.read_u8().await?;
    ConnectionType::from_tag(tag)
}

pub async fn write_signal_id<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    id: SignalId,
) -> Result<(), ProtocolError> {
    w.write_u32(id).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_signal_id<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> Result<SignalId, ProtocolError> {
    Ok(r.read_u32().await?)
}

pub async fn write_nudge<W: AsyncWrite + Unpin + ?Sized>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_u8(NUDGE).await?;
    w.flush().await?;
    Ok(())
}

/// Waits for one nudge. Cancel safe: a single byte is either consumed or not.
pub async fn read_nudge<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<(), ProtocolError> {
    match r.read_u8().await? {
        NUDGE => Ok(()),
        other => Err(ProtocolError::UnexpectedNudge(other)),
    }
}
