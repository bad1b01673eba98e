//! Test doubles for the external collaborators `hcm` excludes by design
//! (spec §1 Non-goals): a scriptable `Connector` and a channel-backed
//! `TransactionSink` that lets a test `.await` the next lifecycle callback
//! instead of polling for it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hcm::{Connector, ConnectionHandle, ConnectionInfo, StopReason, Transport, TransactionSink, TransportError};
use tokio::sync::mpsc;

/// One scripted outcome for a single `Connector::connect` call.
#[derive(Clone, Copy)]
pub enum Outcome {
    ConnectAfter(Duration),
    FailAfter(Duration),
}

/// A `Connector` whose successive `connect()` calls follow a fixed script;
/// the last entry repeats for any call past the end of the script. Each
/// successful connect hands back one half of an in-memory duplex pipe
/// (`tokio::io::duplex`), standing in for a real socket.
pub struct ScriptedConnector {
    script: Vec<Outcome>,
    calls: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Outcome>) -> Self {
        ScriptedConnector { script, calls: AtomicUsize::new(0) }
    }

    pub fn immediate() -> Self {
        Self::new(vec![Outcome::ConnectAfter(Duration::ZERO)])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _info: &ConnectionInfo) -> Result<Box<dyn Transport>, TransportError> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = *self.script.get(idx).unwrap_or_else(|| self.script.last().unwrap());
        match outcome {
            Outcome::ConnectAfter(delay) => {
                tokio::time::sleep(delay).await;
                let (a, _b) = tokio::io::duplex(4096);
                Ok(Box::new(a))
            }
            Outcome::FailAfter(delay) => {
                tokio::time::sleep(delay).await;
                Err(TransportError::Connect("scripted failure".into()))
            }
        }
    }
}

/// What happened to a transaction, recorded in submission order.
pub enum SinkEvent {
    Started(ConnectionHandle),
    Stopped(StopReason),
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl TransactionSink for ChannelSink {
    fn on_start(&mut self, handle: ConnectionHandle) {
        let _ = self.tx.send(SinkEvent::Started(handle));
    }

    fn on_stop(&mut self, reason: StopReason) {
        let _ = self.tx.send(SinkEvent::Stopped(reason));
    }
}

/// A fresh `TransactionSink` plus the receiver a test awaits for its events.
pub fn channel_sink() -> (Box<dyn TransactionSink>, mpsc::UnboundedReceiver<SinkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(ChannelSink { tx }), rx)
}

pub fn host(name: &str, tls: bool) -> ConnectionInfo {
    ConnectionInfo::new(name, if tls { 443 } else { 80 }, tls)
}

/// Drains `rx` until a `Started` event arrives, panicking on a `Stopped` or a
/// closed channel — useful when a test expects a transaction to dispatch.
pub async fn expect_started(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> ConnectionHandle {
    match rx.recv().await.expect("sink channel closed before Started") {
        SinkEvent::Started(handle) => handle,
        SinkEvent::Stopped(reason) => panic!("expected Started, got Stopped({reason:?})"),
    }
}

pub async fn expect_stopped(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> StopReason {
    match rx.recv().await.expect("sink channel closed before Stopped") {
        SinkEvent::Stopped(reason) => reason,
        SinkEvent::Started(_) => panic!("expected Stopped, got Started"),
    }
}
