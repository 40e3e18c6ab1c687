//! Request/response framing and the RPC server.
//!
//! Wire format, little endian:
//! `u32 frame_len | u8 kind | u64 request_id | {request: u64 from_node,
//! u16 route_len, route} | {response: u8 status} | u32 body_len | body |
//! u32 crc32(body)`.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use wrn_core::{Result, WrenError};

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

/// Hard cap on a cluster frame (bodies are already size-budgeted above).
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Typed RPC status. Not-leader statuses tell the caller to refresh its
/// leader map and retry once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
    NotChannelLeader = 2,
    NotUserLeader = 3,
    NotFound = 4,
}

impl Status {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            2 => Self::NotChannelLeader,
            3 => Self::NotUserLeader,
            4 => Self::NotFound,
            _ => Self::Error,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RequestFrame {
    pub id: u64,
    pub from: u64,
    pub route: String,
    pub body: Bytes,
}

#[derive(Debug)]
pub(crate) struct ResponseFrame {
    pub id: u64,
    pub status: Status,
    pub body: Bytes,
}

#[derive(Debug)]
pub(crate) enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

pub(crate) fn encode_request(frame: &RequestFrame) -> Bytes {
    let route = frame.route.as_bytes();
    let mut buf = BytesMut::with_capacity(31 + route.len() + frame.body.len());
    let frame_len = 1 + 8 + 8 + 2 + route.len() + 4 + frame.body.len() + 4;
    buf.put_u32_le(frame_len as u32);
    buf.put_u8(KIND_REQUEST);
    buf.put_u64_le(frame.id);
    buf.put_u64_le(frame.from);
    buf.put_u16_le(route.len() as u16);
    buf.put_slice(route);
    buf.put_u32_le(frame.body.len() as u32);
    buf.put_slice(&frame.body);
    buf.put_u32_le(crc32fast::hash(&frame.body));
    buf.freeze()
}

pub(crate) fn encode_response(frame: &ResponseFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + frame.body.len());
    let frame_len = 1 + 8 + 1 + 4 + frame.body.len() + 4;
    buf.put_u32_le(frame_len as u32);
    buf.put_u8(KIND_RESPONSE);
    buf.put_u64_le(frame.id);
    buf.put_u8(frame.status.as_u8());
    buf.put_u32_le(frame.body.len() as u32);
    buf.put_slice(&frame.body);
    buf.put_u32_le(crc32fast::hash(&frame.body));
    buf.freeze()
}

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len < 13 || frame_len > MAX_FRAME_SIZE {
        return Err(WrenError::Protocol(format!(
            "cluster frame length {frame_len} out of range"
        )));
    }
    let mut frame = vec![0u8; frame_len];
    reader.read_exact(&mut frame).await?;

    let kind = frame[0];
    let id = u64::from_le_bytes([
        frame[1], frame[2], frame[3], frame[4], frame[5], frame[6], frame[7], frame[8],
    ]);
    let mut pos = 9;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        if *pos + n > frame.len() {
            return Err(WrenError::Protocol("truncated cluster frame".into()));
        }
        let out = &frame[*pos..*pos + n];
        *pos += n;
        Ok(out)
    };

    match kind {
        KIND_REQUEST => {
            let from = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap_or_default());
            let route_len =
                u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap_or_default()) as usize;
            let route = String::from_utf8(take(&mut pos, route_len)?.to_vec())
                .map_err(|e| WrenError::Protocol(format!("invalid route: {e}")))?;
            let body_len =
                u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap_or_default()) as usize;
            let body = Bytes::copy_from_slice(take(&mut pos, body_len)?);
            let crc = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap_or_default());
            let actual = crc32fast::hash(&body);
            if crc != actual {
                return Err(WrenError::CrcMismatch {
                    expected: crc,
                    actual,
                });
            }
            Ok(Some(Frame::Request(RequestFrame {
                id,
                from,
                route,
                body,
            })))
        },
        KIND_RESPONSE => {
            let status = Status::from_u8(take(&mut pos, 1)?[0]);
            let body_len =
                u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap_or_default()) as usize;
            let body = Bytes::copy_from_slice(take(&mut pos, body_len)?);
            let crc = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap_or_default());
            let actual = crc32fast::hash(&body);
            if crc != actual {
                return Err(WrenError::CrcMismatch {
                    expected: crc,
                    actual,
                });
            }
            Ok(Some(Frame::Response(ResponseFrame { id, status, body })))
        },
        other => Err(WrenError::Protocol(format!(
            "unknown cluster frame kind {other}"
        ))),
    }
}

/// A route handler: `(from_node, body) -> (status, body)`. Handlers run on
/// the connection task and must only enqueue work, never block on it.
pub type RouteHandler = Arc<dyn Fn(u64, Bytes) -> (Status, Bytes) + Send + Sync>;

/// Route table shared between the RPC server and its connections.
#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<String, RouteHandler>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, path: &str, handler: RouteHandler) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(path.to_string(), handler);
        }
    }

    #[must_use]
    pub fn handle(&self, from: u64, route: &str, body: Bytes) -> (Status, Bytes) {
        let handler = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(route).cloned());
        match handler {
            Some(handler) => handler(from, body),
            None => {
                tracing::warn!(target: "wren::cluster", route, "no handler for route");
                (Status::NotFound, Bytes::new())
            },
        }
    }
}

/// The node-to-node RPC listener.
pub struct RpcServer;

impl RpcServer {
    /// Bind and serve until the process exits. Returns once bound.
    pub async fn start(addr: SocketAddr, router: Arc<Router>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = serve_conn(stream, router).await {
                                tracing::debug!(
                                    target: "wren::cluster",
                                    peer = %peer_addr,
                                    error = %e,
                                    "cluster connection closed"
                                );
                            }
                        });
                    },
                    Err(e) => {
                        tracing::warn!(
                            target: "wren::cluster",
                            error = %e,
                            "cluster accept failed"
                        );
                    },
                }
            }
        });
        tracing::info!(target: "wren::cluster", addr = %local, "cluster RPC listening");
        Ok(local)
    }
}

async fn serve_conn<S>(mut stream: S, router: Arc<Router>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = read_frame(&mut stream).await? {
        match frame {
            Frame::Request(req) => {
                let (status, body) = router.handle(req.from, &req.route, req.body);
                let resp = encode_response(&ResponseFrame {
                    id: req.id,
                    status,
                    body,
                });
                stream.write_all(&resp).await?;
            },
            Frame::Response(_) => {
                // Peers never push responses on inbound connections.
            },
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_frame_roundtrip() {
        let frame = RequestFrame {
            id: 42,
            from: 7,
            route: "/wk/userAction".into(),
            body: Bytes::from_static(b"payload"),
        };
        let encoded = encode_request(&frame);
        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        match decoded {
            Frame::Request(req) => {
                assert_eq!(req.id, 42);
                assert_eq!(req.from, 7);
                assert_eq!(req.route, "/wk/userAction");
                assert_eq!(req.body, Bytes::from_static(b"payload"));
            },
            Frame::Response(_) => panic!("expected request"),
        }
    }

    #[tokio::test]
    async fn test_response_frame_roundtrip() {
        let frame = ResponseFrame {
            id: 9,
            status: Status::NotChannelLeader,
            body: Bytes::new(),
        };
        let encoded = encode_response(&frame);
        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        match read_frame(&mut cursor).await.unwrap().unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.id, 9);
                assert_eq!(resp.status, Status::NotChannelLeader);
            },
            Frame::Request(_) => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn test_corrupted_body_is_rejected() {
        let frame = RequestFrame {
            id: 1,
            from: 1,
            route: "/x".into(),
            body: Bytes::from_static(b"data"),
        };
        let mut encoded = encode_request(&frame).to_vec();
        // Flip a body byte; the crc check must catch it.
        let body_offset = 4 + 1 + 8 + 8 + 2 + 2 + 4;
        encoded[body_offset] ^= 0xFF;
        let mut cursor = std::io::Cursor::new(encoded);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WrenError::CrcMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_dispatches_routes() {
        let router = Arc::new(Router::new());
        router.route(
            "/wk/echo",
            Arc::new(|from, body| {
                assert_eq!(from, 3);
                (Status::Ok, body)
            }),
        );
        let addr = RpcServer::start("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = encode_request(&RequestFrame {
            id: 5,
            from: 3,
            route: "/wk/echo".into(),
            body: Bytes::from_static(b"ping"),
        });
        stream.write_all(&req).await.unwrap();
        match read_frame(&mut stream).await.unwrap().unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.id, 5);
                assert_eq!(resp.status, Status::Ok);
                assert_eq!(resp.body, Bytes::from_static(b"ping"));
            },
            Frame::Request(_) => panic!("expected response"),
        }
    }
}
