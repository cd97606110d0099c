use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::BrokerBridge;
use crate::protocol::envelope::Envelope;
use crate::qos::send_tracker::SendTracker;
use crate::qos::{QosConfig, QosEventListener, RetryAttemptObserver, RetrySender};
use crate::transport::registry::{RegistryHandle, UdpMultiplexer};
use crate::transport::ChannelEventHandler;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub qos: QosConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            qos: QosConfig::default(),
        }
    }
}

/// Resolves a message's recipient to the remote address of the virtual channel it is currently
///  reachable on. Session bookkeeping (login, logout, address changes) is the upper layer's
///  business; this is the one seam the retry path needs from it.
#[cfg_attr(test, automock)]
pub trait PeerResolver: Send + Sync + 'static {
    fn resolve(&self, user_id: &str) -> Option<SocketAddr>;
}

/// The sweep's write path: serialize the envelope and put it on the wire through the registry.
struct RegistryRetrySender {
    handle: RegistryHandle,
    resolver: Arc<dyn PeerResolver>,
}

#[async_trait]
impl RetrySender for RegistryRetrySender {
    async fn resend(&self, envelope: &Envelope) -> bool {
        let to = match self.resolver.resolve(&envelope.to) {
            Some(to) => to,
            None => {
                warn!("no reachable peer for {:?} - resend of {:?} failed", envelope.to, envelope.fingerprint);
                return false;
            }
        };

        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        self.handle.write(&buf, to)
    }
}

/// The owning instance tying the transport and delivery-assurance lifecycles together: binds the
///  multiplexing registry, runs its loop on a spawned task, and starts the send tracker wired to
///  the registry's write path. Everything is constructed and torn down explicitly - there is no
///  process-wide state.
pub struct ImServer {
    handle: RegistryHandle,
    tracker: Arc<SendTracker>,
    bridge: Option<Arc<dyn BrokerBridge>>,
    reactor: JoinHandle<anyhow::Result<()>>,
}

impl ImServer {
    pub async fn start(
        config: ServerConfig,
        handler: Arc<dyn ChannelEventHandler>,
        resolver: Arc<dyn PeerResolver>,
    ) -> anyhow::Result<ImServer> {
        let mux = UdpMultiplexer::bind(config.bind_addr).await?;
        let handle = mux.handle();

        let tracker = Arc::new(SendTracker::new(
            config.qos,
            Arc::new(RegistryRetrySender {
                handle: handle.clone(),
                resolver,
            }),
        )?);
        tracker.start(true);

        let reactor = tokio::spawn(mux.run(handler));

        info!("IM server core up on {:?}", handle.local_addr()?);

        Ok(ImServer {
            handle,
            tracker,
            bridge: None,
            reactor,
        })
    }

    pub fn set_qos_listener(&self, listener: Arc<dyn QosEventListener>) {
        self.tracker.set_listener(listener);
    }

    pub fn set_attempt_observer(&self, observer: Arc<dyn RetryAttemptObserver>) {
        self.tracker.set_attempt_observer(observer);
    }

    pub fn set_bridge(&mut self, bridge: Arc<dyn BrokerBridge>) {
        self.bridge = Some(bridge);
    }

    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    pub fn tracker(&self) -> &Arc<SendTracker> {
        &self.tracker
    }

    /// Send an envelope to a peer. A QoS envelope additionally enters the tracking table -
    ///  regardless of this first send's outcome, since a failed send is exactly what the sweep
    ///  is there to catch.
    pub fn send(&self, envelope: Envelope, to: SocketAddr) -> bool {
        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        let success = self.handle.write(&buf, to);

        if envelope.qos {
            self.tracker.put(envelope);
        }
        success
    }

    /// The ack arrival path: the peer confirmed receiving the message with this fingerprint.
    pub fn on_ack(&self, fingerprint: &str) {
        self.tracker.on_ack(fingerprint);
    }

    pub async fn publish_to_bridge(&self, message: &str) -> bool {
        match &self.bridge {
            Some(bridge) => bridge.publish(message).await,
            None => {
                warn!("no broker bridge configured - dropping message");
                false
            }
        }
    }

    /// Tear down: tracker first (in-flight fingerprints stay unresolved by design), then the
    ///  registry loop, which closes all channels on its way out.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.tracker.stop();
        self.handle.shutdown();
        self.reactor.await??;

        info!("IM server core shut down");
        Ok(())
    }
}
