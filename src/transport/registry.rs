use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::transport::datagram_socket::DatagramSocket;
use crate::transport::recv_buf::RecvBufSizer;
use crate::transport::virtual_channel::VirtualChannel;
use crate::transport::{ChannelEventHandler, ReadProgress};

#[derive(Debug)]
pub(crate) enum RegistryCommand {
    RemoveChannel(Arc<VirtualChannel>),
    Shutdown,
}

/// Clonable, thread-safe handle to a [UdpMultiplexer]. It carries the registry's outbound write
///  path (the socket is shared and safe to send on from any task) and the command channel
///  through which everything that must happen on the registry's own task is submitted.
#[derive(Clone)]
pub struct RegistryHandle {
    socket: Arc<dyn DatagramSocket>,
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    pub(crate) fn new(socket: Arc<dyn DatagramSocket>, commands: mpsc::UnboundedSender<RegistryCommand>) -> RegistryHandle {
        RegistryHandle { socket, commands }
    }

    /// One non-blocking datagram send. An empty payload is a no-op success. A send is successful
    ///  iff the OS confirms that bytes were written; anything else is outright failure - UDP
    ///  sends are atomic per datagram, so there is nothing to retry at this layer. Delivery
    ///  retry, where required, is the QoS tracker's job.
    ///
    /// Once the registry has shut down, writes report failure even though the shared socket
    ///  handle is kept alive by the remaining [RegistryHandle] clones.
    pub fn write(&self, payload: &[u8], to: SocketAddr) -> bool {
        if self.commands.is_closed() {
            debug!("write to {:?} after the registry shut down - reporting failure", to);
            return false;
        }
        if payload.is_empty() {
            return true;
        }

        match self.socket.try_send_to(payload, to) {
            Ok(bytes_written) => bytes_written > 0,
            Err(e) => {
                error!("error sending UDP datagram to {:?}: {}", to, e);
                false
            }
        }
    }

    /// Submit removal of a channel to the registry's task. Never removes directly: the registry's
    ///  address map is only ever touched on its own task, which also re-validates that the map
    ///  still points at this exact channel instance before removing it.
    pub fn remove_channel(&self, channel: Arc<VirtualChannel>) {
        if self.commands.send(RegistryCommand::RemoveChannel(channel)).is_err() {
            debug!("channel removal requested after the registry shut down - ignoring");
        }
    }

    pub fn shutdown(&self) {
        if self.commands.send(RegistryCommand::Shutdown).is_err() {
            debug!("shutdown requested after the registry shut down - ignoring");
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// The UDP multiplexing registry: owns the single bound socket, demultiplexes inbound datagrams
///  onto per-peer [VirtualChannel]s (creating them lazily), and multiplexes outbound datagrams
///  from any task onto the socket via [RegistryHandle::write].
///
/// The address map is deliberately unsynchronized: the registry is owned by value by the task
///  running [run], and both channel creation (in the read path) and removal (via submitted
///  commands) happen there. External callers go through the [RegistryHandle].
pub struct UdpMultiplexer {
    socket: Arc<dyn DatagramSocket>,
    channels: FxHashMap<SocketAddr, Arc<VirtualChannel>>,
    next_channel_id: u64,
    recv_buf: RecvBufSizer,
    command_tx: mpsc::UnboundedSender<RegistryCommand>,
    command_rx: mpsc::UnboundedReceiver<RegistryCommand>,
    active: bool,
}

impl UdpMultiplexer {
    pub async fn bind(local_addr: SocketAddr) -> anyhow::Result<UdpMultiplexer> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self::with_socket(Arc::new(socket)))
    }

    pub fn with_socket(socket: Arc<dyn DatagramSocket>) -> UdpMultiplexer {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        UdpMultiplexer {
            socket,
            channels: FxHashMap::default(),
            next_channel_id: 0,
            recv_buf: RecvBufSizer::default(),
            command_tx,
            command_rx,
            active: true,
        }
    }

    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle::new(self.socket.clone(), self.command_tx.clone())
    }

    pub fn is_active(&self) -> bool {
        self.active && self.socket.local_addr().is_ok()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Connecting is meaningless for a listening multiplexer - there is no single peer.
    pub fn connect(&self, _to: SocketAddr) -> anyhow::Result<()> {
        bail!("connect is unsupported on a listening UDP multiplexer");
    }

    pub fn disconnect(&self) -> anyhow::Result<()> {
        bail!("disconnect is unsupported on a listening UDP multiplexer");
    }

    /// One read invocation: a single non-blocking receive into an adaptively sized buffer.
    ///
    /// * no datagram available -> [ReadProgress::NoDatagram], no state change
    /// * datagram from an address with an open channel -> appended to that channel's inbound
    ///   queue (waking its consumer if one is attached), [ReadProgress::Existing]
    /// * datagram from an unseen address, or one whose channel is no longer open -> a fresh
    ///   channel replaces the map entry and receives the bytes, [ReadProgress::NewChannel]
    ///
    /// I/O errors other than "would block" are returned to the caller (the reactor's error path).
    pub fn read_once(&mut self) -> anyhow::Result<ReadProgress> {
        let mut buf = BytesMut::zeroed(self.recv_buf.next_size());

        let (num_read, from) = match self.socket.try_recv_from(&mut buf) {
            Ok(x) => x,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadProgress::NoDatagram);
            }
            Err(e) => {
                return Err(e.into());
            }
        };

        self.recv_buf.record(num_read);
        buf.truncate(num_read);

        match self.channels.get(&from) {
            Some(channel) if channel.is_open() => {
                channel.push_inbound(buf);
                Ok(ReadProgress::Existing)
            }
            previous => {
                if previous.is_some() {
                    debug!("channel for {:?} is closed - replacing it", from);
                }

                let channel = Arc::new(VirtualChannel::new(self.next_channel_id, from, self.handle()));
                self.next_channel_id += 1;

                self.channels.insert(from, channel.clone());
                channel.push_inbound(buf);

                Ok(ReadProgress::NewChannel(channel))
            }
        }
    }

    /// The registry's reactor loop: drains readability level-triggered, reports new channels to
    ///  the handler, and executes submitted commands in order. Returns after a shutdown command
    ///  (or all handles are dropped), having closed every channel and released the socket.
    pub async fn run(mut self, handler: Arc<dyn ChannelEventHandler>) -> anyhow::Result<()> {
        trace!("starting UDP multiplexer loop on {:?}", self.socket.local_addr());

        let socket = self.socket.clone();
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(RegistryCommand::RemoveChannel(channel)) => self.remove_channel(&channel),
                        Some(RegistryCommand::Shutdown) | None => break,
                    }
                }
                r = socket.readable() => {
                    if let Err(e) = r {
                        error!("datagram socket failed: {}", e);
                        self.close();
                        return Err(e.into());
                    }

                    loop {
                        match self.read_once() {
                            Ok(ReadProgress::NoDatagram) => break,
                            Ok(ReadProgress::Existing) => {}
                            Ok(ReadProgress::NewChannel(channel)) => {
                                debug!("new virtual channel for {:?}", channel.remote_addr());
                                handler.channel_created(channel).await;
                            }
                            Err(e) => {
                                error!("error receiving from datagram socket: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.close();
        Ok(())
    }

    /// Removal always re-validates: the map entry may have been replaced by a newer channel for
    ///  the same address since the removal was submitted, and that newer channel must survive.
    fn remove_channel(&mut self, channel: &Arc<VirtualChannel>) {
        if let Some(current) = self.channels.get(&channel.remote_addr()) {
            if Arc::ptr_eq(current, channel) {
                self.channels.remove(&channel.remote_addr());
                debug!("removed virtual channel for {:?}", channel.remote_addr());
            }
            else {
                debug!("skipping removal for {:?}: map entry was already replaced", channel.remote_addr());
            }
        }
    }

    /// Close every tracked channel, then give up the socket. Closing one channel never blocks
    ///  closing the rest.
    fn close(&mut self) {
        for channel in self.channels.values() {
            if !channel.is_open() {
                warn!("channel for {:?} was already closed", channel.remote_addr());
            }
            channel.mark_closed();
        }
        self.channels.clear();
        self.active = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::datagram_socket::MockDatagramSocket;
    use crate::transport::MockChannelEventHandler;
    use rstest::rstest;
    use std::str::FromStr;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    /// scripts the socket's receive side: one datagram per entry, then `WouldBlock`
    fn mock_recv_script(socket: &mut MockDatagramSocket, script: Vec<(&'static str, &'static [u8])>) {
        let script = std::sync::Mutex::new(std::collections::VecDeque::from(script));
        socket.expect_try_recv_from()
            .returning(move |buf| {
                match script.lock().unwrap().pop_front() {
                    Some((from, payload)) => {
                        buf[..payload.len()].copy_from_slice(payload);
                        Ok((payload.len(), addr(from)))
                    }
                    None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram")),
                }
            });
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_no_datagram() {
        let mut socket = MockDatagramSocket::new();
        mock_recv_script(&mut socket, vec![]);

        let mut mux = UdpMultiplexer::with_socket(Arc::new(socket));
        assert!(matches!(mux.read_once().unwrap(), ReadProgress::NoDatagram));
        assert_eq!(mux.num_channels(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_creates_channel_lazily_then_reuses_it() {
        let mut socket = MockDatagramSocket::new();
        mock_recv_script(&mut socket, vec![("10.0.0.1:4000", b"one" as &[u8]), ("10.0.0.1:4000", b"two")]);

        let mut mux = UdpMultiplexer::with_socket(Arc::new(socket));

        // two datagrams from the same unseen address, before any upper-layer consumption:
        //  same channel instance, created exactly once
        let channel = match mux.read_once().unwrap() {
            ReadProgress::NewChannel(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        assert!(matches!(mux.read_once().unwrap(), ReadProgress::Existing));
        assert_eq!(mux.num_channels(), 1);

        channel.register();
        assert_eq!(channel.next_inbound().await.unwrap().as_ref(), b"one");
        assert_eq!(channel.next_inbound().await.unwrap().as_ref(), b"two");
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_replaces_closed_channel() {
        let mut socket = MockDatagramSocket::new();
        mock_recv_script(&mut socket, vec![("10.0.0.1:4000", b"one" as &[u8]), ("10.0.0.1:4000", b"two")]);

        let mut mux = UdpMultiplexer::with_socket(Arc::new(socket));

        let first = match mux.read_once().unwrap() {
            ReadProgress::NewChannel(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        first.mark_closed();

        let second = match mux.read_once().unwrap() {
            ReadProgress::NewChannel(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(mux.num_channels(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_propagates_fatal_error() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_try_recv_from()
            .times(1)
            .returning(|_| Err(io::Error::new(io::ErrorKind::Other, "nic on fire")));

        let mut mux = UdpMultiplexer::with_socket(Arc::new(socket));
        assert!(mux.read_once().is_err());
    }

    #[rstest]
    #[case::empty_payload_is_noop_success(b"".as_slice(), None, true)]
    #[case::confirmed_send(b"data".as_slice(), Some(Ok(4)), true)]
    #[case::zero_bytes_written_is_failure(b"data".as_slice(), Some(Ok(0)), false)]
    #[case::os_error_is_failure(b"data".as_slice(), Some(Err(io::ErrorKind::PermissionDenied)), false)]
    #[tokio::test]
    async fn test_write(#[case] payload: &'static [u8], #[case] send_result: Option<Result<usize, io::ErrorKind>>, #[case] expected: bool) {
        let mut socket = MockDatagramSocket::new();
        match send_result {
            None => {
                // the socket must not be touched at all
            }
            Some(result) => {
                socket.expect_try_send_to()
                    .times(1)
                    .returning(move |_, _| result.map_err(io::Error::from));
            }
        }

        let mux = UdpMultiplexer::with_socket(Arc::new(socket));
        assert_eq!(mux.handle().write(payload, addr("10.0.0.9:1234")), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn test_write_after_registry_is_gone_reports_failure() {
        // no expectations on the mock: the socket must not be touched after shutdown
        let mux = UdpMultiplexer::with_socket(Arc::new(MockDatagramSocket::new()));
        let handle = mux.handle();
        drop(mux);

        assert!(!handle.write(b"late", addr("10.0.0.9:1234")));
    }

    #[rstest]
    fn test_connect_and_disconnect_are_unsupported() {
        let mux = UdpMultiplexer::with_socket(Arc::new(MockDatagramSocket::new()));
        assert!(mux.connect(addr("10.0.0.1:1")).is_err());
        assert!(mux.disconnect().is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_removal_revalidates_channel_instance() {
        let mut socket = MockDatagramSocket::new();
        mock_recv_script(&mut socket, vec![("10.0.0.1:4000", b"one" as &[u8]), ("10.0.0.1:4000", b"two")]);

        let mut mux = UdpMultiplexer::with_socket(Arc::new(socket));

        let stale = match mux.read_once().unwrap() {
            ReadProgress::NewChannel(c) => c,
            other => panic!("unexpected: {:?}", other),
        };
        stale.mark_closed();
        let replacement = match mux.read_once().unwrap() {
            ReadProgress::NewChannel(c) => c,
            other => panic!("unexpected: {:?}", other),
        };

        // the stale channel's removal arrives after the entry was replaced: the replacement
        //  must survive
        mux.remove_channel(&stale);
        assert_eq!(mux.num_channels(), 1);

        mux.remove_channel(&replacement);
        assert_eq!(mux.num_channels(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_loop_against_real_sockets() {
        let mux = UdpMultiplexer::bind(addr("127.0.0.1:0")).await.unwrap();
        let handle = mux.handle();
        let local_addr = handle.local_addr().unwrap();
        assert!(mux.is_active());

        let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
        let mut handler = MockChannelEventHandler::new();
        handler.expect_channel_created()
            .returning(move |channel| {
                channel.register();
                channel_tx.send(channel).unwrap();
            });

        let loop_task = tokio::spawn(mux.run(Arc::new(handler)));

        let client = UdpSocket::bind(addr("127.0.0.1:0")).await.unwrap();
        client.send_to(b"hello", local_addr).await.unwrap();

        let channel = channel_rx.recv().await.unwrap();
        assert_eq!(channel.next_inbound().await.unwrap().as_ref(), b"hello");

        // a second datagram from the same client address reuses the channel
        client.send_to(b"again", local_addr).await.unwrap();
        assert_eq!(channel.next_inbound().await.unwrap().as_ref(), b"again");

        // outbound through the handle reaches the client
        assert!(handle.write(b"pong", channel.remote_addr()));
        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, local_addr);

        handle.shutdown();
        loop_task.await.unwrap().unwrap();

        // the registry closed its channels on the way out, and the handle no longer writes
        assert!(!channel.is_open());
        assert!(!handle.write(b"late", channel.remote_addr()));
    }
}
