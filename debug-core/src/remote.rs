// Remote transport
//
// Server side: listen, accept, send the handshake line and hand the socket
// to an Interface. Client side: connect with retries, check the handshake
// and relay the operator's terminal to the socket.

use crate::error::{DebugError, DebugResult};
use crate::interface::{Interface, InterfaceKind, Output, OutputQueue};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Default port for the command connection; control sessions use the next one
pub const DEFAULT_PORT: u16 = 8989;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// First line the server sends on every connection
pub const HANDSHAKE: &str = "RDEBUG-Handshake";

#[derive(Debug)]
pub struct RemoteServer {
    listener: TcpListener,
}

impl RemoteServer {
    pub async fn bind(host: &str, port: u16) -> DebugResult<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("Listening for debugger connections on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> DebugResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next client and wrap it in an Interface
    pub async fn accept(&self, channel: (Output, OutputQueue)) -> DebugResult<Interface> {
        let (mut stream, addr) = self.listener.accept().await?;
        info!("Accepted debugger connection from {}", addr);

        stream.write_all(HANDSHAKE.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let (reader, writer) = stream.into_split();
        Ok(Interface::new(InterfaceKind::Remote(addr), reader, writer, channel))
    }
}

#[derive(Debug)]
pub struct RemoteClient {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RemoteClient {
    /// Connect to a debugger server, retrying up to `retries` extra times
    pub async fn connect(host: &str, port: u16, retries: u32, delay: Duration) -> DebugResult<Self> {
        let mut attempt = 0;

        let stream = loop {
            debug!("Connecting to {}:{} (attempt {})", host, port, attempt + 1);
            match TcpStream::connect((host, port)).await {
                Ok(stream) => break stream,
                Err(e) if attempt < retries => {
                    warn!("Connection to {}:{} failed: {}, retrying", host, port, e);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(DebugError::Io(e)),
            }
        };

        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            addr,
            reader: BufReader::new(reader),
            writer,
        };

        client.handshake().await?;
        info!("Connected to debugger at {}", addr);
        Ok(client)
    }

    async fn handshake(&mut self) -> DebugResult<()> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(DebugError::ConnectionClosed);
        }

        let line = line.trim_end();
        if line != HANDSHAKE {
            warn!("Invalid handshake from {}: {:?}", self.addr, line);
            return Err(DebugError::InvalidHandshake(line.to_string()));
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Copy `input` to the server and the server's output to `output` until
    /// the server closes the connection. When `input` ends first the write
    /// side is shut down and the remaining server output is drained.
    pub async fn relay<I, O>(self, mut input: I, mut output: O) -> DebugResult<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let Self {
            mut reader,
            mut writer,
            ..
        } = self;

        // The pinned copy borrows `output` until the block ends
        {
            let from_server = tokio::io::copy(&mut reader, &mut output);
            tokio::pin!(from_server);

            let to_server = async {
                tokio::io::copy(&mut input, &mut writer).await?;
                writer.shutdown().await
            };

            tokio::select! {
                result = &mut from_server => {
                    result?;
                    info!("Server closed the connection");
                }
                result = to_server => {
                    result?;
                    debug!("Input ended, draining server output");
                    (&mut from_server).await?;
                }
            }
        }

        output.flush().await?;
        Ok(())
    }
}
