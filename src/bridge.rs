use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Surface of the message-broker bridge used for interop with a separate messaging system. This
///  core only calls into the bridge and never depends on its internals - reconnection, redelivery
///  and queue topology are entirely the collaborator's business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerBridge: Send + Sync + 'static {
    /// Hand a message to the broker. `true` iff the broker accepted it; a `false` is final from
    ///  this core's point of view - whatever buffering or retry happens is inside the bridge.
    async fn publish(&self, message: &str) -> bool;
}

/// Callback through which the bridge delivers consumed messages into this core.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BridgeConsumer: Send + Sync + 'static {
    /// `true` iff the message was processed; `false` asks the bridge to redeliver it.
    async fn consume(&self, body: &[u8]) -> bool;
}
