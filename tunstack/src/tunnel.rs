//! The tunnel transport.
//!
//! The server opens with one line, `remote|local|mtu`, and from then on both
//! directions carry raw IPv4 frames, each preceded by its length as a
//! big-endian `u16`. A reader task turns the inbound byte stream into frames
//! and hands them over a channel, so the stack itself only ever runs on the
//! task that called [`run`].

use std::{
    io,
    net::SocketAddrV4,
    rc::Rc,
    time::{Duration, Instant},
};
use thiserror::Error as ThisError;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinError,
    time::{self, MissedTickBehavior},
};
use tunstack_core::{
    config::{Handshake, HandshakeError, StackConfig},
    protocols::{
        ipv4::Ipv4Address,
        tcp::{tcb::Completion, ConnectionId, TcpConnection, TcpError, TcpHandler},
    },
    Message, Stack,
};

/// How often the stack is ticked
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Inbound frames buffered between the reader task and the stack
const FRAME_QUEUE: usize = 256;
/// The request sent by the fetch demo
pub const FETCH_REQUEST: &str = "GET / HTTP/1.0\r\n\r\n";

#[derive(Debug, ThisError)]
pub enum TunnelError {
    #[error("Tunnel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Bad handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("The tunnel closed before the handshake")]
    NoHandshake,
    #[error("A frame of {0} bytes does not fit a length prefix")]
    FrameTooLong(usize),
    #[error("Fetch failed: {0}")]
    Fetch(#[from] TcpError),
    #[error("The frame reader stopped: {0}")]
    Reader(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelOptions {
    pub link_overhead: u16,
    pub buffer_until_push: bool,
    pub fetch: Option<SocketAddrV4>,
}

/// Reads the handshake line and turns it into the stack's configuration.
pub async fn read_handshake<R>(
    reader: &mut BufReader<R>,
    options: &TunnelOptions,
) -> Result<StackConfig, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        Err(TunnelError::NoHandshake)?
    }
    let handshake: Handshake = line.parse()?;
    let mut config = handshake.into_config(options.link_overhead)?;
    config.tcp.buffer_until_push = options.buffer_until_push;
    Ok(config)
}

/// Runs the stack over the tunnel until the server closes it.
pub async fn run<R, W>(reader: R, mut writer: W, options: TunnelOptions) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let config = read_handshake(&mut reader, &options).await?;
    tracing::info!(
        "Tunnel up: we are {}, server is {}, MTU {}",
        config.local,
        config.peer,
        config.mtu
    );
    let mut stack = Stack::new(config);

    if let Some(target) = options.fetch {
        let id = fetch(&mut stack, target)?;
        tracing::info!("Fetching from {}", id.remote);
    }

    let (tx, mut rx) = mpsc::channel(FRAME_QUEUE);
    let reader_task = tokio::spawn(read_frames(reader, tx));
    let mut interval = time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        write_frames(&mut writer, stack.take_frames()).await?;
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    stack.set_now(Instant::now());
                    stack.on_frame(&frame);
                }
                None => break,
            },
            now = interval.tick() => stack.tick(now.into_std()),
        }
    }

    write_frames(&mut writer, stack.take_frames()).await?;
    reader_task.await??;
    tracing::info!("Tunnel closed");
    Ok(())
}

/// Forwards each length-prefixed frame to `tx` until the stream ends.
async fn read_frames<R>(mut reader: BufReader<R>, tx: mpsc::Sender<Vec<u8>>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let len = match reader.read_u16().await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut frame = vec![0; len as usize];
        reader.read_exact(&mut frame).await?;
        if tx.send(frame).await.is_err() {
            return Ok(());
        }
    }
}

/// Writes each frame behind its length.
pub async fn write_frames<W>(writer: &mut W, frames: Vec<Vec<u8>>) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() {
        return Ok(());
    }
    for frame in frames {
        let len: u16 = frame
            .len()
            .try_into()
            .map_err(|_| TunnelError::FrameTooLong(frame.len()))?;
        writer.write_u16(len).await?;
        writer.write_all(&frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Opens a connection to `target` and requests `/`, printing whatever comes
/// back.
pub fn fetch(stack: &mut Stack, target: SocketAddrV4) -> Result<ConnectionId, TcpError> {
    let handler: TcpHandler = Rc::new(|text: Message, connection: &mut TcpConnection<'_>| {
        tracing::debug!("{} bytes from {}", text.len(), connection.id().remote);
        print!("{text}");
    });
    let on_connect: Completion = Box::new(move |result| match result {
        Ok(()) => tracing::info!("Connected to {}", target),
        Err(e) => tracing::warn!("Could not connect to {}: {}", target, e),
    });
    let id = stack.tcp_connect(
        Ipv4Address::from(target.ip().octets()),
        target.port(),
        handler,
        Some(on_connect),
    )?;
    stack.connection(id).send(FETCH_REQUEST)?;
    Ok(id)
}
