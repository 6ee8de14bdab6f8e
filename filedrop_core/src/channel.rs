//! Ordered, reliable data channel abstraction.
//!
//! A channel is split in two halves: the [`DataChannel`] used to send and
//! an [`Inbox`] of everything the peer sent, in order. Text frames carry
//! control messages, binary frames carry file chunks.

use anyhow::{Result, anyhow};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

pub type Inbox = mpsc::UnboundedReceiver<ChannelMessage>;

/// Sending half of an open data channel.
pub trait DataChannel: Send + Sync + 'static {
    fn send_text(&self, text: &str) -> impl Future<Output = Result<()>> + Send;

    fn send_binary(&self, data: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Bytes queued locally but not yet handed to the network.
    fn buffered_amount(&self) -> impl Future<Output = usize> + Send;

    fn is_open(&self) -> bool;

    /// Idempotent.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A channel that just opened, with its inbox.
pub struct OpenChannel<C> {
    pub channel: C,
    pub inbox: Inbox,
}

impl<C> std::fmt::Debug for OpenChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenChannel").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LoopbackLink {
    open: AtomicBool,
    to_a: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    to_b: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
}

/// In-process channel end created by [`loopback_pair`].
///
/// The buffered amount is simulated: it stays at whatever
/// [`LoopbackChannel::set_buffered_amount`] last stored.
#[derive(Debug, Clone)]
pub struct LoopbackChannel {
    link: Arc<LoopbackLink>,
    is_a: bool,
    buffered: Arc<AtomicUsize>,
    text_sent: Arc<AtomicUsize>,
    binary_sent: Arc<AtomicUsize>,
}

/// Two connected channel ends; what one sends arrives in the other's inbox.
pub fn loopback_pair() -> (OpenChannel<LoopbackChannel>, OpenChannel<LoopbackChannel>) {
    let (to_a, inbox_a) = mpsc::unbounded_channel();
    let (to_b, inbox_b) = mpsc::unbounded_channel();
    let link = Arc::new(LoopbackLink {
        open: AtomicBool::new(true),
        to_a: Mutex::new(Some(to_a)),
        to_b: Mutex::new(Some(to_b)),
    });

    let end = |is_a| LoopbackChannel {
        link: link.clone(),
        is_a,
        buffered: Arc::new(AtomicUsize::new(0)),
        text_sent: Arc::new(AtomicUsize::new(0)),
        binary_sent: Arc::new(AtomicUsize::new(0)),
    };

    (
        OpenChannel {
            channel: end(true),
            inbox: inbox_a,
        },
        OpenChannel {
            channel: end(false),
            inbox: inbox_b,
        },
    )
}

impl LoopbackChannel {
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Number of text frames sent from this end
    pub fn text_frames_sent(&self) -> usize {
        self.text_sent.load(Ordering::SeqCst)
    }

    /// Number of binary frames sent from this end
    pub fn binary_frames_sent(&self) -> usize {
        self.binary_sent.load(Ordering::SeqCst)
    }

    fn deliver(&self, msg: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("Loopback channel is closed"));
        }
        let slot = if self.is_a {
            &self.link.to_b
        } else {
            &self.link.to_a
        };
        let guard = slot
            .lock()
            .map_err(|_| anyhow!("Loopback channel lock poisoned"))?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| anyhow!("Loopback peer dropped its inbox")),
            None => Err(anyhow!("Loopback channel is closed")),
        }
    }
}

impl DataChannel for LoopbackChannel {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.deliver(ChannelMessage::Text(text.to_string()))?;
        self.text_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.deliver(ChannelMessage::Binary(data))?;
        self.binary_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.link.open.swap(false, Ordering::SeqCst) {
            // Dropping both senders ends both inboxes.
            for slot in [&self.link.to_a, &self.link.to_b] {
                if let Ok(mut guard) = slot.lock() {
                    guard.take();
                }
            }
        }
        Ok(())
    }
}
