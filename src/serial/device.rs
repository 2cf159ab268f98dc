//! Open Device Handle
//!
//! A [`Device`] is a cheap, cloneable handle to one open serial line. The
//! transport itself is owned by a background task that reads inbound bytes,
//! frames them, and performs writes on request. The task ends, and the
//! device counts as closed, on EOF, on the first I/O error, on
//! [`Device::close`], or once every handle is dropped.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};

use super::framing::{FrameDecoder, Framing};
use super::DeviceIdentity;

const READ_BUFFER_SIZE: usize = 4096;
const WRITE_QUEUE_CAPACITY: usize = 64;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Error type for device operations
#[derive(Debug)]
pub enum DeviceError {
    /// I/O failure on the open line
    Io(io::Error),
    /// The device could not be opened
    Open(String),
    /// The device is already closed
    Closed,
    /// The write queue is full
    Busy,
}

impl DeviceError {
    /// Short machine-readable kind, used in `error <kind> <message>` diagnostics
    pub fn kind(&self) -> String {
        match self {
            DeviceError::Io(e) => format!("{:?}", e.kind()),
            DeviceError::Open(_) => "Open".to_string(),
            DeviceError::Closed => "Closed".to_string(),
            DeviceError::Busy => "Busy".to_string(),
        }
    }

    /// Human-readable detail without the kind
    pub fn message(&self) -> String {
        match self {
            DeviceError::Io(e) => e.to_string(),
            DeviceError::Open(msg) => msg.clone(),
            DeviceError::Closed => "device is closed".to_string(),
            DeviceError::Busy => "write queue is full".to_string(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io(e) => write!(f, "I/O error: {}", e),
            DeviceError::Open(msg) => write!(f, "Open failed: {}", msg),
            DeviceError::Closed => write!(f, "Device closed"),
            DeviceError::Busy => write!(f, "Device busy: write queue is full"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<io::Error> for DeviceError {
    fn from(e: io::Error) -> Self {
        DeviceError::Io(e)
    }
}

/// Something that happened on an open device
#[derive(Debug)]
pub enum DeviceEvent {
    /// One inbound frame (a line without its delimiter, or a raw chunk)
    Data(Bytes),
    /// An I/O failure; the device closes right after reporting it
    Error(DeviceError),
}

struct WriteRequest {
    data: Bytes,
    /// Absent for fire-and-forget writes
    reply: Option<oneshot::Sender<Result<(), DeviceError>>>,
}

impl WriteRequest {
    fn respond(self, result: Result<(), DeviceError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

struct Shared {
    id: u64,
    identity: DeviceIdentity,
    framing: Framing,
    writes: mpsc::Sender<WriteRequest>,
    shutdown: Arc<Notify>,
    closed: watch::Receiver<bool>,
    events: Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
}

/// Handle to an open serial device
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("identity", &self.shared.identity)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Device {
    /// Take ownership of an open transport and start its I/O task
    pub fn spawn<T>(identity: DeviceIdentity, transport: T, framing: Framing) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let (writes_tx, writes_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());

        let io = IoTask {
            id,
            identity: identity.clone(),
            framing: framing.clone(),
            writes: writes_rx,
            events: events_tx,
            shutdown: shutdown.clone(),
            closed: closed_tx,
        };
        tokio::spawn(io.run(transport));

        Self {
            shared: Arc::new(Shared {
                id,
                identity,
                framing,
                writes: writes_tx,
                shutdown,
                closed: closed_rx,
                events: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Process-unique id of this open instance
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn framing(&self) -> &Framing {
        &self.shared.framing
    }

    pub fn is_open(&self) -> bool {
        !*self.shared.closed.borrow()
    }

    /// Take the inbound event stream. Only the first caller gets it.
    ///
    /// The stream ends once the device is closed.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.shared.events.lock().take()
    }

    /// Write one frame, appending the delimiter in line mode.
    ///
    /// Resolves once the bytes were handed to the transport.
    pub async fn write(&self, frame: &[u8]) -> Result<(), DeviceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = WriteRequest {
            data: self.shared.framing.encode(frame),
            reply: Some(reply_tx),
        };
        self.shared
            .writes
            .send(request)
            .await
            .map_err(|_| DeviceError::Closed)?;
        reply_rx.await.map_err(|_| DeviceError::Closed)?
    }

    /// Queue one frame without waiting for the transport.
    ///
    /// Fails with [`DeviceError::Busy`] when the write queue is full. A later
    /// I/O failure is reported on the event stream instead of to the caller.
    pub fn try_write(&self, frame: &[u8]) -> Result<(), DeviceError> {
        let request = WriteRequest {
            data: self.shared.framing.encode(frame),
            reply: None,
        };
        self.shared.writes.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => DeviceError::Busy,
            TrySendError::Closed(_) => DeviceError::Closed,
        })
    }

    /// Force the device closed. Safe to call any number of times.
    pub fn close(&self) {
        if self.is_open() {
            debug!("Device {}: close requested", self.shared.identity);
        }
        self.shared.shutdown.notify_one();
    }

    /// Wait until the device is closed
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.clone();
        // An error means the I/O task is gone, which is closed as well.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

struct IoTask {
    id: u64,
    identity: DeviceIdentity,
    framing: Framing,
    writes: mpsc::Receiver<WriteRequest>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    shutdown: Arc<Notify>,
    closed: watch::Sender<bool>,
}

impl IoTask {
    async fn run<T>(self, transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let IoTask {
            id,
            identity,
            framing,
            mut writes,
            events,
            shutdown,
            closed,
        } = self;
        let (reader, writer) = tokio::io::split(transport);

        // Reads and writes progress independently; whichever side ends first,
        // or a close request, drops the other along with any in-flight write.
        tokio::select! {
            _ = shutdown.notified() => debug!("Device {}: closing", identity),
            _ = read_frames(&identity, reader, framing.decoder(), &events) => {}
            _ = write_frames(&identity, writer, &mut writes, &events) => {}
        }

        // Fail anything still queued rather than leaving writers hanging.
        writes.close();
        while let Ok(request) = writes.try_recv() {
            request.respond(Err(DeviceError::Closed));
        }

        closed.send_replace(true);
        debug!("Device {} (#{}): closed", identity, id);
    }
}

async fn read_frames<R>(
    identity: &DeviceIdentity,
    mut reader: R,
    mut decoder: FrameDecoder,
    events: &mpsc::UnboundedSender<DeviceEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Device {}: end of stream", identity);
                return;
            }
            Ok(n) => {
                trace!("Device {}: read {} bytes", identity, n);
                for frame in decoder.push(&buf[..n]) {
                    let _ = events.send(DeviceEvent::Data(frame));
                }
            }
            Err(e) => {
                warn!("Device {}: read failed: {}", identity, e);
                let _ = events.send(DeviceEvent::Error(DeviceError::Io(e)));
                return;
            }
        }
    }
}

async fn write_frames<W>(
    identity: &DeviceIdentity,
    mut writer: W,
    writes: &mut mpsc::Receiver<WriteRequest>,
    events: &mpsc::UnboundedSender<DeviceEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = writes.recv().await {
        let result = async {
            writer.write_all(&request.data).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                trace!("Device {}: wrote {} bytes", identity, request.data.len());
                request.respond(Ok(()));
            }
            Err(e) => {
                warn!("Device {}: write failed: {}", identity, e);
                request.respond(Err(DeviceError::Io(io::Error::new(e.kind(), e.to_string()))));
                let _ = events.send(DeviceEvent::Error(DeviceError::Io(e)));
                return;
            }
        }
    }
    debug!("Device {}: all handles dropped", identity);
}
