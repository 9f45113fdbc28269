//! Framed TCP client.
//!
//! One request in flight at a time. Any I/O failure, protocol error or
//! timeout closes the socket; later calls fail with `TcpClientError::Closed`.
//! Frames the server pushes while a request is in flight are queued for
//! [`TcpClient::recv_push`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{ProtocolError, TcpClientError};
use crate::net::codec::{read_frame, write_frame, RequestFrame, ResponseFrame, Status};

const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug)]
pub struct TcpClient {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    local: SocketAddr,
    timeout: Duration,
    max_frame_len: usize,
    pushed: VecDeque<Vec<u8>>,
}

impl TcpClient {
    /// Connect within `timeout`. The same timeout bounds every request.
    pub async fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, TcpClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TcpClientError::Timeout(timeout))?
            .map_err(TcpClientError::Connect)?;
        let peer = stream.peer_addr().map_err(TcpClientError::Connect)?;
        let local = stream.local_addr().map_err(TcpClientError::Connect)?;
        // Request/response traffic; do not let Nagle hold back small frames.
        stream.set_nodelay(true).map_err(TcpClientError::Connect)?;

        tracing::debug!(peer_addr = %peer, "TCP client connected");
        Ok(Self {
            stream: Some(stream),
            peer,
            local,
            timeout,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            pushed: VecDeque::new(),
        })
    }

    /// Largest response body accepted.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Address the server sees this client as.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Send one request and wait for its response.
    pub async fn request(&mut self, command: &str, payload: &[u8]) -> Result<ResponseFrame, TcpClientError> {
        // Encoding errors are the caller's fault and leave the connection usable.
        let bytes = RequestFrame::new(command, payload.to_vec()).encode()?;
        let stream = self.stream.as_mut().ok_or(TcpClientError::Closed)?;

        let exchanged = exchange(stream, &bytes, self.max_frame_len, &mut self.pushed);
        let result = match tokio::time::timeout(self.timeout, exchanged).await {
            Ok(result) => result,
            Err(_) => Err(TcpClientError::Timeout(self.timeout)),
        };
        self.close_on_error(result)
    }

    /// Next frame the server pushed, waiting up to the client timeout if none is queued.
    pub async fn recv_push(&mut self) -> Result<Vec<u8>, TcpClientError> {
        if let Some(payload) = self.pushed.pop_front() {
            return Ok(payload);
        }
        let stream = self.stream.as_mut().ok_or(TcpClientError::Closed)?;

        let result = match tokio::time::timeout(self.timeout, read_response(stream, self.max_frame_len)).await {
            Ok(Ok(frame)) if frame.status == Status::Push => Ok(frame.payload),
            Ok(Ok(frame)) => Err(ProtocolError::UnexpectedStatus(frame.status as u8).into()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TcpClientError::Timeout(self.timeout)),
        };
        self.close_on_error(result)
    }

    fn close_on_error<T>(&mut self, result: Result<T, TcpClientError>) -> Result<T, TcpClientError> {
        if let Err(e) = &result {
            tracing::debug!(peer_addr = %self.peer, error = %e, "TCP client closing after failure");
            self.stream = None;
        }
        result
    }

    /// Close the write side and drop the socket.
    pub async fn close(mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

async fn exchange(
    stream: &mut TcpStream,
    request: &[u8],
    max_frame_len: usize,
    pushed: &mut VecDeque<Vec<u8>>,
) -> Result<ResponseFrame, TcpClientError> {
    write_frame(stream, request)
        .await
        .map_err(|e| TcpClientError::Protocol(e.into()))?;
    loop {
        let frame = read_response(stream, max_frame_len).await?;
        if frame.status != Status::Push {
            return Ok(frame);
        }
        pushed.push_back(frame.payload);
    }
}

async fn read_response(stream: &mut TcpStream, max_frame_len: usize) -> Result<ResponseFrame, TcpClientError> {
    match read_frame(stream, max_frame_len).await? {
        Some(body) => Ok(ResponseFrame::decode(&body)?),
        None => Err(TcpClientError::Closed),
    }
}
