//! Persisted state is an external collaborator: this crate only forwards
//! terminal `Request` snapshots over a channel to whoever wants them,
//! instead of owning storage itself.

use oa_proto::Request;

pub trait PersistSink: Send + Sync {
    fn persist_request(&self, req: &Request);
}

/// Discards everything. The default when no persistence is configured.
pub struct NullSink;

impl PersistSink for NullSink {
    fn persist_request(&self, _req: &Request) {}
}

/// Forwards a clone of every persisted request over an unbounded channel.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<Request>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PersistSink for ChannelSink {
    fn persist_request(&self, req: &Request) {
        let _ = self.tx.send(req.clone());
    }
}
