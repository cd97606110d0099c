pub mod datagram_socket;
pub mod recv_buf;
pub mod registry;
pub mod virtual_channel;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::transport::virtual_channel::VirtualChannel;

/// Outcome of one read invocation on the multiplexing registry. Exactly one datagram is read per
///  invocation; repeated readability re-invokes the read (level-triggered contract).
#[derive(Debug)]
pub enum ReadProgress {
    /// no datagram was available - no state change
    NoDatagram,
    /// the datagram was appended to an already existing channel's inbound queue
    Existing,
    /// the datagram came from an unseen (or no longer open) remote address, creating this channel
    NewChannel(Arc<VirtualChannel>),
}

/// This trait decouples the multiplexing registry from the upper protocol pipeline: the registry
///  reports newly created virtual channels through it, and the pipeline takes it from there
///  (attaching a consumer, auth, routing, ...).
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of the registry loop.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelEventHandler: Send + Sync + 'static {
    async fn channel_created(&self, channel: Arc<VirtualChannel>);
}
