//! Retrieval protocol - one request, one response, one stream.
//!
//! The requester writes a short token, either `list_files` or a CID. The
//! responder dispatches as soon as the token is whole, so a requester may keep
//! its write side open. The answer is a JSON map of the responder's local
//! files, or the raw file bytes, followed by a close. There is no length prefix:
//! end-of-stream terminates the response, so a stream must never carry more
//! than one exchange. A CID request answered with zero bytes means the peer
//! does not have the file.

use super::P2PError;
use crate::crypto::{ContentId, CID_LEN};
use crate::storage::FileStore;

use libp2p::StreamProtocol;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL: StreamProtocol = StreamProtocol::new("/obscure-fs/1.0.0");

/// Largest request frame a responder will read
pub const MAX_REQUEST_FRAME: usize = 256;

pub const LIST_FILES: &str = "list_files";

/// How long a responder waits for the requester to finish its frame
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ListFiles,
    Fetch(ContentId),
}

impl Request {
    /// Parse a request frame, once, at the stream boundary
    pub fn parse(frame: &[u8]) -> Result<Self, P2PError> {
        let token = std::str::from_utf8(frame)
            .map_err(|_| P2PError::Protocol("request frame is not UTF-8".into()))?
            .trim();

        if token.is_empty() {
            return Err(P2PError::Protocol("empty request frame".into()));
        }
        if token == LIST_FILES {
            return Ok(Request::ListFiles);
        }

        ContentId::parse(token)
            .map(Request::Fetch)
            .map_err(|e| P2PError::Protocol(e.to_string()))
    }

    pub fn to_frame(&self) -> Vec<u8> {
        match self {
            Request::ListFiles => LIST_FILES.as_bytes().to_vec(),
            Request::Fetch(cid) => cid.as_str().as_bytes().to_vec(),
        }
    }
}

/// What a responder did with one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    Listing { entries: usize },
    File { cid: ContentId, bytes: u64 },
    Miss { cid: ContentId },
}

/// Read one request frame.
///
/// The frame ends at a newline, at end-of-stream, at [`MAX_REQUEST_FRAME`]
/// bytes, or as soon as the bytes read so far form a whole token.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, P2PError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; MAX_REQUEST_FRAME];
    let mut filled = 0;

    while filled < MAX_REQUEST_FRAME {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if frame_complete(&buffer[..filled]) {
            break;
        }
    }

    let frame = &buffer[..filled];
    let frame = match frame.iter().position(|b| *b == b'\n') {
        Some(end) => &frame[..end],
        None => frame,
    };
    Request::parse(frame)
}

fn frame_complete(frame: &[u8]) -> bool {
    frame.contains(&b'\n')
        || frame == LIST_FILES.as_bytes()
        || (frame.len() >= CID_LEN && frame[..CID_LEN].iter().all(u8::is_ascii_hexdigit))
}

/// Responder side: answer one request on `stream`, then close it
pub async fn serve_stream<S>(mut stream: S, store: &FileStore) -> Result<Served, P2PError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
        Err(_) => {
            let _ = stream.shutdown().await;
            return Err(P2PError::Timeout);
        }
    };

    tracing::debug!(?request, "Received request");

    let served = match request {
        Request::ListFiles => {
            let listing = store.listing();
            let body = serde_json::to_vec(&listing)
                .map_err(|e| P2PError::Protocol(format!("failed to encode file list: {}", e)))?;
            stream.write_all(&body).await?;
            Served::Listing {
                entries: listing.len(),
            }
        }
        Request::Fetch(cid) => match store.get(&cid) {
            Ok(path) => match tokio::fs::read(&path).await {
                Ok(data) if cid.verify(&data) => {
                    stream.write_all(&data).await?;
                    Served::File {
                        cid,
                        bytes: data.len() as u64,
                    }
                }
                Ok(_) => {
                    tracing::warn!(cid = %cid, path = %path.display(), "Registered file no longer matches its CID");
                    Served::Miss { cid }
                }
                Err(e) => {
                    tracing::warn!(cid = %cid, path = %path.display(), error = %e, "Registered file unreadable");
                    Served::Miss { cid }
                }
            },
            Err(_) => Served::Miss { cid },
        },
    };

    stream.shutdown().await?;
    Ok(served)
}

/// Requester side: send one request and read the whole response
pub async fn send_request<S>(mut stream: S, request: &Request) -> Result<Vec<u8>, P2PError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.to_frame()).await?;
    // Half-close so responders that read to end-of-stream answer too
    stream.shutdown().await?;

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;
    Ok(body)
}

/// Fetch a file's bytes; `None` means this peer does not have it
pub async fn fetch<S>(stream: S, cid: &ContentId) -> Result<Option<Vec<u8>>, P2PError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = send_request(stream, &Request::Fetch(cid.clone())).await?;
    Ok(if body.is_empty() { None } else { Some(body) })
}

/// Fetch a peer's CID → location listing
pub async fn list_files<S>(stream: S) -> Result<BTreeMap<String, String>, P2PError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = send_request(stream, &Request::ListFiles).await?;
    if body.is_empty() {
        return Err(P2PError::Protocol("peer closed stream without a listing".into()));
    }

    serde_json::from_slice(&body).map_err(|e| P2PError::Protocol(format!("malformed listing: {}", e)))
}
