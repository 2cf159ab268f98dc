//! In-memory stand-ins for the broker and for serial hardware, shared by
//! the unit tests of several modules.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::broker::{
    BrokerConnector, BrokerError, BrokerLink, BrokerMessage, Credentials, InboundSender, Payload,
    SessionHandle,
};
use crate::config::PortConfig;
use crate::scanner::OpenHandler;
use crate::serial::{Device, DeviceError, DeviceIdentity, DeviceOpener, Framing, SerialSettings};

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Everything a [`FakeLink`] was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Authenticate(String),
    Subscribe { topic: String, id: String },
    Unsubscribe(String),
    Publish { topic: String, payload: Bytes },
    Close,
}

pub struct FakeLink {
    calls: Mutex<Vec<LinkCall>>,
    inbound: InboundSender,
    closed: watch::Sender<bool>,
    pub reject_auth: AtomicBool,
    pub reject_subscribe: AtomicBool,
    pub fail_publish: AtomicBool,
}

impl FakeLink {
    pub fn new(inbound: InboundSender) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            inbound,
            closed,
            reject_auth: AtomicBool::new(false),
            reject_subscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
        })
    }

    /// A link whose inbound messages go nowhere
    pub fn detached() -> Arc<Self> {
        let (inbound, _) = tokio::sync::mpsc::unbounded_channel();
        Self::new(inbound)
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    /// Payloads published to `topic`, in order
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                LinkCall::Publish { topic: t, payload } if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deliver a message as if the broker had sent it
    pub fn inject(&self, subscription_id: &str, topic: &str, payload: &[u8]) {
        let _ = self.inbound.send(BrokerMessage {
            subscription_id: subscription_id.to_string(),
            topic: topic.to_string(),
            payload: Payload::decode(Bytes::copy_from_slice(payload)),
        });
    }

    /// Simulate the broker connection dropping
    pub fn drop_link(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_down(&self) -> bool {
        *self.closed.borrow()
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrokerLink for FakeLink {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        self.record(LinkCall::Authenticate(credentials.user.clone()));
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("bad credentials".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, subscription_id: &str) -> Result<(), BrokerError> {
        if self.is_down() {
            return Err(BrokerError::ConnectionLost("down".to_string()));
        }
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("not authorized".to_string()));
        }
        self.record(LinkCall::Subscribe {
            topic: topic.to_string(),
            id: subscription_id.to_string(),
        });
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BrokerError> {
        if self.is_down() {
            return Err(BrokerError::ConnectionLost("down".to_string()));
        }
        self.record(LinkCall::Unsubscribe(subscription_id.to_string()));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.is_down() || self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost("down".to_string()));
        }
        self.record(LinkCall::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.record(LinkCall::Close);
        self.closed.send_replace(true);
    }
}

/// Scripted result of one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Fail,
    Succeed,
    RejectAuth,
}

pub struct FakeConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    fallback: ConnectOutcome,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeConnector {
    /// Play `script`, then answer every further attempt with `fallback`
    pub fn new(script: Vec<ConnectOutcome>, fallback: ConnectOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            attempts: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// Links handed out so far, oldest first
    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    pub async fn wait_for_link(&self, index: usize) -> Arc<FakeLink> {
        wait_until(|| self.links.lock().len() > index).await;
        self.links.lock()[index].clone()
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self, inbound: InboundSender) -> Result<SessionHandle, BrokerError> {
        self.attempts.lock().push(Instant::now());
        let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
        match outcome {
            ConnectOutcome::Fail => Err(BrokerError::ConnectionLost("refused".to_string())),
            ConnectOutcome::Succeed | ConnectOutcome::RejectAuth => {
                let link = FakeLink::new(inbound);
                if outcome == ConnectOutcome::RejectAuth {
                    link.reject_auth.store(true, Ordering::SeqCst);
                }
                self.links.lock().push(link.clone());
                Ok(link)
            }
        }
    }
}

/// A transport whose reads fail straight away
pub struct FailingTransport {
    pub kind: io::ErrorKind,
    pub message: &'static str,
}

impl AsyncRead for FailingTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(self.kind, self.message)))
    }
}

impl AsyncWrite for FailingTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(self.kind, self.message)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Device on an in-memory line; the returned stream is the far end
pub fn line_device(path: &str, framing: Framing) -> (Device, DuplexStream) {
    let (local, remote) = duplex(1024);
    let device = Device::spawn(DeviceIdentity::new(PathBuf::from(path)), local, framing);
    (device, remote)
}

/// Opens in-memory devices and keeps their far ends
#[derive(Default)]
pub struct FakeOpener {
    attempts: Mutex<Vec<DeviceIdentity>>,
    remotes: Mutex<Vec<(DeviceIdentity, DuplexStream)>>,
    failing: Mutex<HashSet<PathBuf>>,
}

impl FakeOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> Vec<DeviceIdentity> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, identity: &DeviceIdentity) -> usize {
        self.attempts.lock().iter().filter(|i| *i == identity).count()
    }

    /// Make opens of `path` (canonical) fail until cleared
    pub fn fail(&self, path: &Path, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(path.to_path_buf());
        } else {
            set.remove(path);
        }
    }

    /// Take the far end of the most recent open of `identity`
    pub fn take_remote(&self, identity: &DeviceIdentity) -> Option<DuplexStream> {
        let mut remotes = self.remotes.lock();
        let index = remotes.iter().rposition(|(i, _)| i == identity)?;
        Some(remotes.remove(index).1)
    }
}

#[async_trait]
impl DeviceOpener for FakeOpener {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        _settings: &SerialSettings,
        framing: Framing,
    ) -> Result<Device, DeviceError> {
        self.attempts.lock().push(identity.clone());
        if self.failing.lock().contains(identity.path()) {
            return Err(DeviceError::Open("busy".to_string()));
        }
        let (local, remote) = duplex(1024);
        self.remotes.lock().push((identity.clone(), remote));
        Ok(Device::spawn(identity.clone(), local, framing))
    }
}

/// Open handler that records devices and can be told to reject them
#[derive(Default)]
pub struct RecordingHandler {
    opened: Mutex<Vec<(Device, PortConfig)>>,
    pub reject: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> Vec<Device> {
        self.opened.lock().iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn opened_ports(&self) -> Vec<PortConfig> {
        self.opened.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl OpenHandler for RecordingHandler {
    async fn device_opened(
        &self,
        device: &Device,
        port: &PortConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.reject.load(Ordering::SeqCst) {
            return Err("rejected by test".into());
        }
        self.opened.lock().push((device.clone(), port.clone()));
        Ok(())
    }
}
