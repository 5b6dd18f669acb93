//! Hand-encoded MQTT 3.1.1 frames and the bare connection that carries them.
//!
//! Only the scenarios that need byte-level control use this module: wills torn
//! down by a socket reset, DISCONNECT raced against an immediate close,
//! filters a conformant client library refuses to send, and malformed
//! frames. Everything else goes through [`crate::client`].
//!
//! Frames built here use a single-byte remaining length, so the body must
//! stay under 128 bytes.

use crate::endpoint::{BrokerEndpoint, TransportKind};
use crate::error::{ConformanceError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

const PROTOCOL_NAME: [u8; 6] = [0x00, 0x04, b'M', b'Q', b'T', b'T'];
const PROTOCOL_LEVEL: u8 = 0x04;
const KEEP_ALIVE_SECS: u16 = 60;
const MAX_SINGLE_BYTE_LENGTH: usize = 127;

pub const CLEAN_SESSION: u8 = 0x02;
pub const WILL_FLAG: u8 = 0x04;

pub const CONNECT: u8 = 0x10;
pub const CONNACK: u8 = 0x20;
pub const SUBSCRIBE: u8 = 0x82;
pub const SUBACK: u8 = 0x90;
pub const DISCONNECT: u8 = 0xE0;

/// SUBACK return code for a rejected filter.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Subscribe,
    Disconnect,
}

/// An encoded frame plus the fields it was built from.
#[derive(Clone, Debug)]
pub struct RawPacket {
    kind: PacketKind,
    bytes: Bytes,
    client_id: Option<String>,
    will_topic: Option<String>,
    will_payload: Option<Bytes>,
    flags: u8,
}

impl RawPacket {
    /// Wraps bytes as-is; used for deliberately malformed frames.
    pub fn verbatim(kind: PacketKind, bytes: &'static [u8]) -> Self {
        Self {
            kind,
            bytes: Bytes::from_static(bytes),
            client_id: None,
            will_topic: None,
            will_payload: None,
            flags: 0,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_deref()
    }

    pub fn will_payload(&self) -> Option<&[u8]> {
        self.will_payload.as_deref()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }
}

fn put_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

fn frame(header: u8, body: Vec<u8>) -> Result<Bytes> {
    if body.len() > MAX_SINGLE_BYTE_LENGTH {
        return Err(ConformanceError::FrameTooLarge(body.len()));
    }
    let mut packet = Vec::with_capacity(2 + body.len());
    packet.push(header);
    packet.push(body.len() as u8);
    packet.extend_from_slice(&body);
    Ok(Bytes::from(packet))
}

fn connect_body(client_id: &str, flags: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&PROTOCOL_NAME);
    body.push(PROTOCOL_LEVEL);
    body.push(flags);
    body.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    put_prefixed(&mut body, client_id.as_bytes());
    body
}

/// CONNECT with clean session and a QoS 0, non-retained will.
pub fn build_connect_with_will(client_id: &str, will_topic: &str, will_payload: &[u8]) -> Result<RawPacket> {
    let flags = CLEAN_SESSION | WILL_FLAG;
    let mut body = connect_body(client_id, flags);
    put_prefixed(&mut body, will_topic.as_bytes());
    put_prefixed(&mut body, will_payload);

    Ok(RawPacket {
        kind: PacketKind::Connect,
        bytes: frame(CONNECT, body)?,
        client_id: Some(client_id.to_string()),
        will_topic: Some(will_topic.to_string()),
        will_payload: Some(Bytes::copy_from_slice(will_payload)),
        flags,
    })
}

pub fn build_connect(client_id: &str, clean_session: bool) -> Result<RawPacket> {
    let flags = if clean_session { CLEAN_SESSION } else { 0x00 };
    Ok(RawPacket {
        kind: PacketKind::Connect,
        bytes: frame(CONNECT, connect_body(client_id, flags))?,
        client_id: Some(client_id.to_string()),
        will_topic: None,
        will_payload: None,
        flags,
    })
}

/// SUBSCRIBE with a single filter. The filter is sent unvalidated.
pub fn build_subscribe(packet_id: u16, filter: &str, qos: u8) -> Result<RawPacket> {
    let mut body = Vec::with_capacity(5 + filter.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    put_prefixed(&mut body, filter.as_bytes());
    body.push(qos);

    Ok(RawPacket {
        kind: PacketKind::Subscribe,
        bytes: frame(SUBSCRIBE, body)?,
        client_id: None,
        will_topic: None,
        will_payload: None,
        flags: SUBSCRIBE & 0x0F,
    })
}

pub fn build_disconnect() -> RawPacket {
    RawPacket {
        kind: PacketKind::Disconnect,
        bytes: Bytes::from_static(&[DISCONNECT, 0x00]),
        client_id: None,
        will_topic: None,
        will_payload: None,
        flags: 0,
    }
}

/// CONNACK with return code 0 in the fourth octet.
pub fn connack_accepted(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0] == CONNACK && bytes[3] == 0x00
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

pub fn parse_suback(bytes: &[u8]) -> Option<Suback> {
    if bytes.len() < 4 || bytes[0] != SUBACK {
        return None;
    }
    let remaining = bytes[1] as usize;
    if remaining < 2 || bytes.len() < 2 + remaining {
        return None;
    }
    Some(Suback {
        packet_id: u16::from_be_bytes([bytes[2], bytes[3]]),
        return_codes: bytes[4..2 + remaining].to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Closed,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseWait {
    pub closed: bool,
    pub received: Vec<u8>,
}

#[derive(Debug)]
pub enum RawConnection {
    Tcp(TcpStream),
    WebSocket(Box<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

impl RawConnection {
    pub async fn connect(endpoint: &BrokerEndpoint, budget: Duration) -> Result<Self> {
        match endpoint.transport {
            TransportKind::Tcp => {
                let stream = tokio::time::timeout(budget, TcpStream::connect(endpoint.socket_addr()))
                    .await
                    .map_err(|_| ConformanceError::timed_out("dial", budget))??;
                stream.set_nodelay(true)?;
                Ok(RawConnection::Tcp(stream))
            }
            TransportKind::WebSocket => {
                let mut request = endpoint.url.as_str().into_client_request()?;
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
                let (stream, _) = tokio::time::timeout(budget, tokio_tungstenite::connect_async(request))
                    .await
                    .map_err(|_| ConformanceError::timed_out("websocket handshake", budget))??;
                Ok(RawConnection::WebSocket(Box::new(stream)))
            }
        }
    }

    pub async fn send(&mut self, packet: &RawPacket) -> Result<()> {
        debug!(kind = ?packet.kind(), len = packet.bytes().len(), "raw write");
        match self {
            RawConnection::Tcp(stream) => stream.write_all(packet.bytes()).await?,
            RawConnection::WebSocket(ws) => ws.send(Message::Binary(packet.bytes().to_vec())).await?,
        }
        Ok(())
    }

    /// One bounded read. A clean EOF or a transport error both count as closed.
    pub async fn read_some(&mut self, deadline: Duration) -> ReadOutcome {
        match self {
            RawConnection::Tcp(stream) => {
                let mut buf = vec![0u8; 4096];
                match tokio::time::timeout(deadline, stream.read(&mut buf)).await {
                    Ok(Ok(0)) | Ok(Err(_)) => ReadOutcome::Closed,
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        ReadOutcome::Data(buf)
                    }
                    Err(_) => ReadOutcome::Silent,
                }
            }
            RawConnection::WebSocket(ws) => {
                let read = async {
                    loop {
                        match ws.next().await {
                            Some(Ok(Message::Binary(data))) => return ReadOutcome::Data(data),
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return ReadOutcome::Closed,
                            Some(Ok(_)) => continue,
                        }
                    }
                };
                tokio::time::timeout(deadline, read).await.unwrap_or(ReadOutcome::Silent)
            }
        }
    }

    /// Reads until the peer closes or `deadline` passes, keeping whatever
    /// arrived on the way.
    pub async fn await_close(&mut self, deadline: Duration) -> CloseWait {
        let until = tokio::time::Instant::now() + deadline;
        let mut received = Vec::new();
        loop {
            let left = until.saturating_duration_since(tokio::time::Instant::now());
            match self.read_some(left).await {
                ReadOutcome::Data(data) => received.extend_from_slice(&data),
                ReadOutcome::Closed => return CloseWait { closed: true, received },
                ReadOutcome::Silent => return CloseWait { closed: false, received },
            }
        }
    }

    /// Writes `packet` and drops the socket straight away: no flush-wait,
    /// no shutdown handshake. The broker sees the frame and the close as
    /// close together as the OS allows.
    pub async fn write_then_close(mut self, packet: &RawPacket) -> Result<()> {
        self.send(packet).await?;
        drop(self);
        Ok(())
    }

    /// Closes with SO_LINGER=0 so the broker gets a RST instead of a FIN.
    pub fn reset(self) -> Result<()> {
        match &self {
            RawConnection::Tcp(stream) => socket2::SockRef::from(stream).set_linger(Some(Duration::ZERO))?,
            RawConnection::WebSocket(ws) => {
                if let MaybeTlsStream::Plain(stream) = ws.get_ref() {
                    socket2::SockRef::from(stream).set_linger(Some(Duration::ZERO))?;
                }
            }
        }
        drop(self);
        Ok(())
    }
}
