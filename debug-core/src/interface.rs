// Operator I/O channel
//
// An Interface is an ordered queue of incoming command lines plus an output
// sink. A reader task turns the transport into lines and a writer task
// drains the output queue, so the console and a remote socket only differ in
// the streams they hand over.

use crate::error::{DebugError, DebugResult};
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Incoming lines buffered ahead of the control loop
const COMMAND_QUEUE_SIZE: usize = 32;

/// How long `close` waits for pending output before abandoning the peer
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceKind {
    Console,
    Remote(SocketAddr),
    /// In-process streams (scripts, tests)
    Local,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceKind::Console => write!(f, "console"),
            InterfaceKind::Remote(addr) => write!(f, "remote {}", addr),
            InterfaceKind::Local => write!(f, "local"),
        }
    }
}

/// Sending half of an interface's output. Cheap to clone and usable from
/// any thread, including a debuggee thread that is about to block.
#[derive(Debug, Clone)]
pub struct Output {
    tx: mpsc::UnboundedSender<String>,
}

impl Output {
    /// Queue `text` for the operator, adding a trailing newline if missing.
    /// Returns false once the interface has been closed.
    pub fn print(&self, text: impl Into<String>) -> bool {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }

        if self.tx.send(text).is_err() {
            debug!("Output closed, dropping message");
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of an interface's output
#[derive(Debug)]
pub struct OutputQueue {
    rx: mpsc::UnboundedReceiver<String>,
}

impl OutputQueue {
    /// Wait for the next message; None once every Output is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

pub fn output_channel() -> (Output, OutputQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Output { tx }, OutputQueue { rx })
}

#[derive(Debug)]
pub struct Interface {
    kind: InterfaceKind,
    commands: mpsc::Receiver<DebugResult<String>>,
    output: Output,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl Interface {
    /// Wrap a pair of streams. Output queued on `channel` before this call
    /// is written first.
    pub fn new<R, W>(kind: InterfaceKind, reader: R, writer: W, channel: (Output, OutputQueue)) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (output, queue) = channel;
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let reader = tokio::spawn(reader_task(reader, command_tx));
        let writer = tokio::spawn(writer_task(writer, queue, shutdown_rx));

        info!("Interface opened ({})", kind);

        Self {
            kind,
            commands,
            output,
            reader,
            writer,
            shutdown,
        }
    }

    /// Local console on stdin/stdout
    pub fn console(channel: (Output, OutputQueue)) -> Self {
        Self::new(InterfaceKind::Console, tokio::io::stdin(), tokio::io::stdout(), channel)
    }

    pub fn kind(&self) -> &InterfaceKind {
        &self.kind
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn print(&self, text: impl Into<String>) -> bool {
        self.output.print(text)
    }

    /// Next command line, or None at end of stream
    pub async fn read_command(&mut self) -> DebugResult<Option<String>> {
        match self.commands.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Flush pending output and shut the transport down. Consumes the
    /// interface so it can only happen once. A peer that stops reading is
    /// abandoned after `CLOSE_TIMEOUT`, dropping whatever was still queued.
    pub async fn close(self) {
        let Self {
            kind,
            commands,
            reader,
            mut writer,
            shutdown,
            ..
        } = self;

        drop(commands);
        reader.abort();
        shutdown.send(()).ok();

        match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Output writer for {} failed: {}", kind, e),
            Err(_) => {
                warn!("Output for {} not drained after {:?}, dropping it", kind, CLOSE_TIMEOUT);
                writer.abort();
            }
        }

        info!("Interface closed ({})", kind);
    }
}

async fn reader_task<R>(reader: R, command_tx: mpsc::Sender<DebugResult<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let next = match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("Input stream ended");
                break;
            }
            Ok(_) => Ok(decode_line(&buf)),
            Err(e) => Err(DebugError::Io(e)),
        };

        let failed = next.is_err();
        if command_tx.send(next).await.is_err() || failed {
            break;
        }
    }
}

/// Strip the line ending; bytes that are not UTF-8 become U+FFFD so a
/// garbled line fails as an unknown command instead of ending the session
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let text = String::from_utf8_lossy(line);
    if let std::borrow::Cow::Owned(_) = &text {
        warn!("Input line is not valid UTF-8: {:?}", text);
    }
    text.into_owned()
}

async fn writer_task<W>(mut writer: W, mut queue: OutputQueue, mut shutdown: oneshot::Receiver<()>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            message = queue.recv() => {
                let Some(message) = message else {
                    break;
                };

                // Batch whatever else is already queued into one write
                buf.extend_from_slice(message.as_bytes());
                while let Some(more) = queue.try_recv() {
                    buf.extend_from_slice(more.as_bytes());
                }

                if let Err(e) = write_buf(&mut writer, &mut buf).await {
                    warn!("Failed to write output: {}", e);
                    return;
                }
            }

            _ = &mut shutdown => {
                while let Some(more) = queue.try_recv() {
                    buf.extend_from_slice(more.as_bytes());
                }

                if let Err(e) = write_buf(&mut writer, &mut buf).await {
                    warn!("Failed to flush output: {}", e);
                    return;
                }
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down output stream: {}", e);
    }
}

async fn write_buf<W>(writer: &mut W, buf: &mut BytesMut) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if buf.is_empty() {
        return Ok(());
    }

    writer.write_all(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}
