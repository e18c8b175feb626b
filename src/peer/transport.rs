use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::constants::{IDLE_TIMEOUT, MAX_MESSAGE_SIZE};
use crate::mse::CipherPair;
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer byte stream, either raw TCP or RC4-wrapped after an MSE
/// handshake. The framing layer above cannot tell the difference.
pub enum PeerStream {
    Plain(TcpStream),
    Encrypted {
        stream: TcpStream,
        ciphers: CipherPair,
    },
}

impl PeerStream {
    /// Reads some bytes, decrypting when needed, and appends them to `buf`.
    /// Returns the number of bytes appended; zero means EOF.
    async fn read_some(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            PeerStream::Plain(stream) => stream.read_buf(buf).await,
            PeerStream::Encrypted { stream, ciphers } => {
                let mut chunk = [0u8; 16 * 1024];
                let n = stream.read(&mut chunk).await?;
                ciphers.decrypt(&mut chunk[..n]);
                buf.put_slice(&chunk[..n]);
                Ok(n)
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            PeerStream::Plain(stream) => stream.write_all(data).await,
            PeerStream::Encrypted { stream, ciphers } => {
                let mut owned = data.to_vec();
                ciphers.encrypt(&mut owned);
                stream.write_all(&owned).await
            }
        }
    }
}

/// Framed message transport over a [`PeerStream`].
///
/// Owns the read buffer; messages are cut at frame boundaries and decoded
/// into [`Message`] values.
pub struct PeerTransport {
    stream: PeerStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: PeerStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Builds a transport whose read buffer starts with bytes already
    /// consumed during connection setup (the MSE initial payload).
    pub fn with_preloaded(stream: PeerStream, preloaded: &[u8]) -> Self {
        let mut transport = Self::new(stream);
        transport.read_buf.put_slice(preloaded);
        transport
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.stream.write_all(&handshake.encode()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(IDLE_TIMEOUT, self.stream.read_some(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        let frame = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&frame)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.stream.write_all(&message.encode()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    /// Receives one framed message, waiting as long as the idle timeout.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        loop {
            if let Some(frame_len) = self.buffered_frame_len()? {
                if self.read_buf.len() >= frame_len {
                    let frame = self.read_buf.split_to(frame_len);
                    return Message::decode(frame.freeze());
                }
            }
            let n = timeout(IDLE_TIMEOUT, self.stream.read_some(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
    }

    // Total frame length (prefix included) once the prefix is buffered.
    fn buffered_frame_len(&self) -> Result<Option<usize>, PeerError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let body = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;
        if body > MAX_MESSAGE_SIZE {
            return Err(PeerError::Protocol(format!("frame of {} bytes", body)));
        }
        Ok(Some(4 + body))
    }
}
