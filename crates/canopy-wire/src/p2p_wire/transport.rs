//! Framing of messages over a byte stream. We first read the header, that has a constant
//! size, learn the payload length from it and only then read the payload. Magic, size and
//! checksum are checked before the payload gets decoded.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bitcoin::consensus::deserialize;
use bitcoin::consensus::deserialize_partial;
use bitcoin::consensus::encode;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use canopy_common::impl_error_from;
use log::debug;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;

use super::message::checksum;
use super::message::serialize_message;
use super::message::MessageHeader;
use super::message::HEADER_SIZE;
use super::network::Network;

#[derive(Debug)]
/// Enum that deals with transport errors
pub enum TransportError {
    /// I/O error
    Io(io::Error),

    /// The payload couldn't be decoded
    Serde(encode::Error),

    /// Message started with the magic of another network
    MagicBitsMismatch,

    /// Payload length above what the network allows
    MessageTooBig(u32),

    /// Payload doesn't hash to the checksum in the header
    ChecksumMismatch,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(err) => write!(f, "IO error: {err:?}"),
            TransportError::Serde(err) => write!(f, "serde error: {err:?}"),
            TransportError::MagicBitsMismatch => write!(f, "wrong magic bits"),
            TransportError::MessageTooBig(len) => write!(f, "payload of {len} bytes is too big"),
            TransportError::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

impl std::error::Error for TransportError {}

impl_error_from!(TransportError, io::Error, Io);
impl_error_from!(TransportError, encode::Error, Serde);

pub struct ReadTransport<R: AsyncRead + Unpin + Send> {
    reader: R,
    network: Network,
}

pub struct WriteTransport<W: AsyncWrite + Unpin + Send> {
    writer: W,
    network: Network,
}

pub type StreamReadTransport<S> = ReadTransport<BufReader<ReadHalf<S>>>;
pub type StreamWriteTransport<S> = WriteTransport<WriteHalf<S>>;

/// Splits a connection into its reading and writing halves, so each can live in its own task
pub fn split<S>(stream: S, network: Network) -> (StreamReadTransport<S>, StreamWriteTransport<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);

    (
        ReadTransport::new(BufReader::new(reader), network),
        WriteTransport::new(writer, network),
    )
}

/// Opens a TCP connection, giving up after `timeout`
pub async fn connect(address: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    debug!("connecting to {address}");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection to {address} timed out"),
            )
        })??;

    stream.set_nodelay(true)?;
    Ok(stream)
}

impl<R> ReadTransport<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, network: Network) -> Self {
        ReadTransport { reader, network }
    }

    /// Read the next message from the transport.
    pub async fn read_message(&mut self) -> Result<NetworkMessage, TransportError> {
        let mut data: Vec<u8> = vec![0; HEADER_SIZE];
        self.reader.read_exact(&mut data).await?;

        let header: MessageHeader = deserialize_partial(&data)?.0;
        if header.magic != self.network.magic() {
            return Err(TransportError::MagicBitsMismatch);
        }

        if header.length > self.network.params().max_message_payload {
            return Err(TransportError::MessageTooBig(header.length));
        }

        data.resize(HEADER_SIZE + header.length as usize, 0);
        self.reader.read_exact(&mut data[HEADER_SIZE..]).await?;

        if checksum(&data[HEADER_SIZE..]) != header.checksum {
            return Err(TransportError::ChecksumMismatch);
        }

        let message: RawNetworkMessage = deserialize(&data)?;
        Ok(message.payload().clone())
    }
}

impl<W> WriteTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, network: Network) -> Self {
        WriteTransport { writer, network }
    }

    /// Write a message to the transport.
    pub async fn write_message(&mut self, message: NetworkMessage) -> Result<(), TransportError> {
        let data = serialize_message(self.network, message);
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Shutdown the transport.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
