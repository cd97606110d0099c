//! Server-side transport core for a mobile instant-messaging protocol. Clients are NAT-bound,
//!  intermittently reachable and talk to the server over plain UDP, so this crate provides the
//!  two pieces of machinery that turn that into something an IM server can build on:
//!
//! * A *multiplexing registry* that virtualizes per-peer "connections" on top of a single bound
//!   UDP socket. The upper pipeline (login handling, routing, ...) gets connection-oriented
//!   semantics - a channel per remote address with an inbound queue and a lifecycle - while all
//!   traffic shares one socket. Channels are created lazily on the first datagram from an unseen
//!   address and torn down through the registry's own task, never from the outside.
//! * A *QoS send tracker* that turns best-effort datagram delivery into an explicit
//!   acknowledge-or-declare-lost guarantee. Every outbound message flagged as QoS is tracked by
//!   its fingerprint and periodically swept: retried while the retry budget lasts, and reported
//!   lost in a single batch once it is exhausted. An ack from the peer resolves the fingerprint
//!   as delivered; delivery and loss are mutually exclusive terminal outcomes.
//!
//! ## Design notes
//!
//! * The registry runs on a single tokio task that owns the address map outright. Creation
//!   happens during its read path, removal requests from other tasks are submitted as commands
//!   and executed (and re-validated) on that task - the map needs no locking.
//! * The tracker's tables are shared between arbitrary senders, the ack path and the sweep
//!   timer, so they live behind a lock inside the tracker; callers never synchronize externally.
//! * Retries are bounded and spaced: a message younger than the grace window is never retried in
//!   that sweep cycle, and the retry counter counts *attempts made*, not confirmed sends.
//! * There is no per-message timeout or cancellation - the grace window and the retry budget are
//!   the only temporal controls, and stopping the tracker just stops processing.
//!
//! Login/auth semantics, message routing and the broker bridge's internals are explicitly out of
//!  scope; the bridge is visible only through its `publish` / `consume` surface.

pub mod bridge;
pub mod protocol;
pub mod qos;
pub mod server;
pub mod transport;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
