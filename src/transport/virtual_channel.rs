use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;
use tracing::trace;

use crate::transport::registry::RegistryHandle;

/// A virtualized per-peer connection on top of the registry's shared UDP socket. There is no OS
///  handle behind it - just the remote address, an inbound queue the registry appends to from
///  its read path, and a lifecycle flag.
///
/// The channel holds a [RegistryHandle] rather than the registry itself: removal is requested
///  through the handle and executed on the registry's own task, and the handle keeps nothing
///  alive beyond the shared socket.
pub struct VirtualChannel {
    id: u64,
    remote_addr: SocketAddr,
    registry: RegistryHandle,
    inbound: Mutex<VecDeque<BytesMut>>,
    readable: Notify,
    open: AtomicBool,
    registered: AtomicBool,
}

impl VirtualChannel {
    pub(crate) fn new(id: u64, remote_addr: SocketAddr, registry: RegistryHandle) -> VirtualChannel {
        VirtualChannel {
            id,
            remote_addr,
            registry,
            inbound: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            open: AtomicBool::new(true),
            registered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Called by the upper pipeline when it attaches a consumer. From this point on, appended
    ///  datagrams trigger a read notification; anything queued earlier is picked up by the first
    ///  [next_inbound] call.
    pub fn register(&self) {
        self.registered.store(true, Ordering::Release);
        self.readable.notify_one();
    }

    /// Called from the registry's read path only.
    pub(crate) fn push_inbound(&self, buf: BytesMut) {
        trace!("queueing {} inbound bytes for {:?}", buf.len(), self.remote_addr);

        self.inbound.lock()
            .expect("inbound queue lock poisoned")
            .push_back(buf);

        if self.is_registered() {
            self.readable.notify_one();
        }
    }

    /// Next inbound datagram, in arrival order. Returns `None` once the channel is closed and
    ///  its queue is drained.
    pub async fn next_inbound(&self) -> Option<BytesMut> {
        loop {
            if let Some(buf) = self.inbound.lock()
                .expect("inbound queue lock poisoned")
                .pop_front()
            {
                return Some(buf);
            }
            if !self.is_open() {
                return None;
            }
            self.readable.notified().await;
        }
    }

    /// Send a datagram to this channel's peer. An empty payload is a no-op success; a failed
    ///  send is reported as `false` and not retried at this layer.
    pub fn send(&self, payload: &[u8]) -> bool {
        self.registry.write(payload, self.remote_addr)
    }

    /// Close the channel and request its removal from the registry. The removal itself always
    ///  happens on the registry's own task, so this is safe to call from anywhere.
    pub fn close(self: &Arc<Self>) {
        self.mark_closed();
        self.registry.remove_channel(self.clone());
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.readable.notify_one();
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VirtualChannel{{id:{}, remote:{:?}, open:{}}}", self.id, self.remote_addr, self.is_open())
    }
}
