//! In-process transport.
//!
//! Local channels talk to each other inside one process, addressed by
//! `local://name`. A server binds a name in a global registry; a client
//! connecting to that name gets paired with a freshly created child channel
//! that the server accepts like any other connection. Messages are handed
//! over as-is, without serialization.
//!
//! ```text
//!   client ── write ──► peer inbound queue ── peer loop ──► child pipeline
//!   child  ── write ──► peer inbound queue ── peer loop ──► client pipeline
//! ```
//!
//! The connect completes once the child is registered with its loop; closing
//! either side closes the other.

use crate::channel::{Channel, WeakChannel};
use crate::transport::{ChannelMetadata, Transport};
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::event_loop::SingleThreadEventLoop;
use chassis_core::executor::EventExecutor;
use chassis_core::message::{message, Message};
use chassis_core::options::ChannelConfig;
use chassis_core::outbound::OutboundBuffer;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::io;
use tracing::{debug, trace, warn};

/// Bound local servers by name.
static LOCAL_REGISTRY: Lazy<DashMap<String, WeakChannel>> = Lazy::new(DashMap::new);

/// Local transports have no disconnect distinct from close.
const METADATA: ChannelMetadata = ChannelMetadata::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Life {
    Open,
    Bound,
    Connected,
    Closed,
}

fn local_name(endpoint: &Endpoint) -> Result<&str> {
    match endpoint {
        Endpoint::Local(name) if !name.is_empty() => Ok(name.as_str()),
        other => Err(ChannelError::invalid_argument(format!(
            "not a local address: {other}"
        ))),
    }
}

fn is_local_loop(event_loop: &dyn EventExecutor) -> bool {
    event_loop.as_any().is::<SingleThreadEventLoop>()
}

/// Names a channel that connects without binding first.
fn ephemeral_address(channel: &Channel) -> Endpoint {
    Endpoint::local(format!("E{}", channel.id().as_short_text()))
}

struct LocalState {
    life: Life,
    /// Set on accepted children until their first registration completes the
    /// pairing.
    accepted: bool,
    peer: WeakChannel,
    local: Option<Endpoint>,
    remote: Option<Endpoint>,
    inbound: VecDeque<Message>,
    read_in_progress: bool,
}

/// One end of an in-process connection.
pub struct LocalTransport {
    state: Mutex<LocalState>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LocalState {
                life: Life::Open,
                accepted: false,
                peer: WeakChannel::default(),
                local: None,
                remote: None,
                inbound: VecDeque::new(),
                read_in_progress: false,
            }),
        }
    }

    /// Server-side end paired with `peer`.
    fn accepted(peer: &Channel, local: Endpoint, remote: Option<Endpoint>) -> Self {
        Self {
            state: Mutex::new(LocalState {
                life: Life::Bound,
                accepted: true,
                peer: peer.downgrade(),
                local: Some(local),
                remote,
                inbound: VecDeque::new(),
                read_in_progress: false,
            }),
        }
    }

    /// The channel on the other end, if connected.
    pub fn peer(&self) -> Option<Channel> {
        self.state.lock().peer.upgrade()
    }

    /// Number of delivered messages not read yet.
    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// Hand queued inbound messages to `channel`'s pipeline, if it asked for
    /// them. Runs on `channel`'s loop.
    fn finish_peer_read(channel: &Channel) {
        let Some(transport) = channel.transport_as::<LocalTransport>() else {
            return;
        };
        let drained: Vec<Message> = {
            let mut state = transport.state.lock();
            if !state.read_in_progress || state.inbound.is_empty() {
                return;
            }
            state.read_in_progress = false;
            state.inbound.drain(..).collect()
        };
        deliver(channel, drained);
    }

    /// Schedule `peer` to pick up what was just queued for it.
    fn wake_peer(peer: &Channel) -> Result<()> {
        let event_loop = peer.event_loop()?;
        let target = peer.clone();
        event_loop.execute(Box::new(move || LocalTransport::finish_peer_read(&target)))
    }

    /// Close `peer` from its own loop after this side closed.
    fn close_peer(peer: Channel) {
        match peer.event_loop() {
            Ok(event_loop) => {
                let target = peer.clone();
                let submitted = event_loop.execute(Box::new(move || {
                    // Let the peer read what was delivered before the close.
                    LocalTransport::finish_peer_read(&target);
                    let ops = target.unsafe_ops();
                    ops.close(ops.void_promise());
                }));
                if let Err(e) = submitted {
                    warn!("[Local] Could not close peer {}: {}", peer, e);
                    peer.unsafe_ops().close_forcibly();
                }
            }
            Err(_) => peer.unsafe_ops().close_forcibly(),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(channel: &Channel, messages: Vec<Message>) {
    let pipeline = channel.pipeline();
    for msg in messages {
        pipeline.fire_channel_read(msg);
    }
    pipeline.fire_channel_read_complete();
}

impl Transport for LocalTransport {
    fn metadata(&self) -> ChannelMetadata {
        METADATA
    }

    fn is_compatible(&self, event_loop: &dyn EventExecutor) -> bool {
        is_local_loop(event_loop)
    }

    fn is_open(&self) -> bool {
        self.state.lock().life != Life::Closed
    }

    fn is_active(&self) -> bool {
        self.state.lock().life == Life::Connected
    }

    fn local_address(&self) -> Option<Endpoint> {
        self.state.lock().local.clone()
    }

    fn remote_address(&self) -> Option<Endpoint> {
        self.state.lock().remote.clone()
    }

    fn do_register(&self, channel: &Channel) -> Result<()> {
        let peer = {
            let mut state = self.state.lock();
            if !state.accepted || state.life != Life::Bound {
                return Ok(());
            }
            state.accepted = false;
            state.life = Life::Connected;
            state.peer.upgrade()
        };
        let Some(peer) = peer else {
            return Err(ChannelError::Closed);
        };
        trace!("[Local] {} paired with {}", channel, peer);

        let event_loop = peer.event_loop()?;
        let client = peer.clone();
        event_loop.execute(Box::new(move || {
            if let Some(transport) = client.transport_as::<LocalTransport>() {
                let mut state = transport.state.lock();
                if state.life == Life::Bound {
                    state.life = Life::Connected;
                }
            }
            client.invalidate_remote_address();
            client.unsafe_ops().finish_connect(Ok(()));
        }))
    }

    fn do_bind(&self, _channel: &Channel, local: &Endpoint) -> Result<()> {
        local_name(local)?;
        let mut state = self.state.lock();
        if state.life != Life::Open {
            return Err(ChannelError::illegal_state("already bound"));
        }
        state.local = Some(local.clone());
        state.life = Life::Bound;
        Ok(())
    }

    fn do_connect(&self, channel: &Channel, remote: &Endpoint, local: Option<&Endpoint>) -> Result<()> {
        let name = local_name(remote)?;
        {
            let state = self.state.lock();
            match state.life {
                Life::Connected => return Err(ChannelError::illegal_state("already connected")),
                Life::Closed => return Err(ChannelError::Closed),
                Life::Open | Life::Bound => {}
            }
        }
        if self.state.lock().life == Life::Open {
            let local = local.cloned().unwrap_or_else(|| ephemeral_address(channel));
            self.do_bind(channel, &local)?;
        }

        let server = LOCAL_REGISTRY
            .get(name)
            .and_then(|entry| entry.value().upgrade())
            .filter(Channel::is_active);
        let Some(server) = server else {
            // Nobody listens: the connect fails and the channel is closed.
            self.state.lock().life = Life::Closed;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )
            .into());
        };

        let server_address = server
            .local_address()
            .unwrap_or_else(|| remote.clone());
        let child = Channel::with_parent(
            &server,
            LocalTransport::accepted(channel, server_address, self.local_address()),
            ChannelConfig::default(),
        );
        {
            let mut state = self.state.lock();
            state.peer = child.downgrade();
            state.remote = Some(remote.clone());
        }
        channel.invalidate_local_address();
        debug!("[Local] {} connecting to {}", channel, remote);
        LocalServerTransport::serve(&server, child)
    }

    fn do_disconnect(&self, channel: &Channel) -> Result<()> {
        self.do_close(channel)
    }

    fn do_close(&self, _channel: &Channel) -> Result<()> {
        let peer = {
            let mut state = self.state.lock();
            if state.life == Life::Closed {
                return Ok(());
            }
            state.life = Life::Closed;
            state.read_in_progress = false;
            std::mem::take(&mut state.peer)
        };
        if let Some(peer) = peer.upgrade() {
            if peer.is_open() {
                LocalTransport::close_peer(peer);
            }
        }
        Ok(())
    }

    fn do_begin_read(&self, channel: &Channel) -> Result<()> {
        let drained: Vec<Message> = {
            let mut state = self.state.lock();
            if state.read_in_progress {
                return Ok(());
            }
            if state.inbound.is_empty() {
                state.read_in_progress = true;
                return Ok(());
            }
            state.inbound.drain(..).collect()
        };
        deliver(channel, drained);
        Ok(())
    }

    fn do_write(&self, _channel: &Channel, buffer: &OutboundBuffer) -> Result<()> {
        let peer = {
            let state = self.state.lock();
            match state.life {
                Life::Connected => state.peer.upgrade(),
                Life::Closed => return Err(ChannelError::Closed),
                Life::Open | Life::Bound => return Err(ChannelError::NotYetConnected),
            }
        };
        let peer = peer.ok_or(ChannelError::Closed)?;
        let peer_transport = peer
            .transport_as::<LocalTransport>()
            .ok_or_else(|| ChannelError::illegal_state("peer is not a local channel"))?;

        let mut written = 0usize;
        while let Some(entry) = buffer.pop_flushed() {
            {
                let mut peer_state = peer_transport.state.lock();
                if peer_state.life == Life::Closed {
                    drop(peer_state);
                    buffer.requeue_flushed(entry);
                    return Err(ChannelError::Closed);
                }
                peer_state.inbound.push_back(entry.message);
            }
            if !entry.promise.is_void() {
                entry.promise.try_success();
            }
            written += 1;
        }
        if written > 0 {
            LocalTransport::wake_peer(&peer)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ServerState {
    life: Life,
    local: Option<Endpoint>,
    pending: VecDeque<Channel>,
    accept_in_progress: bool,
}

/// Listening end: accepts local connections and emits each one as a
/// `Channel` message through its pipeline.
pub struct LocalServerTransport {
    state: Mutex<ServerState>,
}

impl LocalServerTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                life: Life::Open,
                local: None,
                pending: VecDeque::new(),
                accept_in_progress: false,
            }),
        }
    }

    /// True if a live server is bound under `name`.
    pub fn is_bound(name: &str) -> bool {
        LOCAL_REGISTRY
            .get(name)
            .is_some_and(|entry| entry.value().upgrade().is_some())
    }

    /// Queue an accepted `child` on `server`'s loop.
    fn serve(server: &Channel, child: Channel) -> Result<()> {
        let event_loop = server.event_loop()?;
        let target = server.clone();
        event_loop.execute(Box::new(move || {
            let Some(transport) = target.transport_as::<LocalServerTransport>() else {
                return;
            };
            let accepted: Vec<Channel> = {
                let mut state = transport.state.lock();
                state.pending.push_back(child);
                if !state.accept_in_progress {
                    return;
                }
                state.accept_in_progress = false;
                state.pending.drain(..).collect()
            };
            LocalServerTransport::deliver_children(&target, accepted);
        }))
    }

    fn deliver_children(server: &Channel, children: Vec<Channel>) {
        deliver(server, children.into_iter().map(message).collect());
    }
}

impl Default for LocalServerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalServerTransport {
    fn metadata(&self) -> ChannelMetadata {
        METADATA
    }

    fn is_compatible(&self, event_loop: &dyn EventExecutor) -> bool {
        is_local_loop(event_loop)
    }

    fn is_open(&self) -> bool {
        self.state.lock().life != Life::Closed
    }

    fn is_active(&self) -> bool {
        self.state.lock().life == Life::Bound
    }

    fn local_address(&self) -> Option<Endpoint> {
        self.state.lock().local.clone()
    }

    fn remote_address(&self) -> Option<Endpoint> {
        None
    }

    fn do_bind(&self, channel: &Channel, local: &Endpoint) -> Result<()> {
        let name = local_name(local)?;
        {
            let state = self.state.lock();
            if state.life != Life::Open {
                return Err(ChannelError::illegal_state("already bound"));
            }
        }
        match LOCAL_REGISTRY.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("address already in use: {local}"),
                    )
                    .into());
                }
                entry.insert(channel.downgrade());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(channel.downgrade());
            }
        }
        let mut state = self.state.lock();
        state.local = Some(local.clone());
        state.life = Life::Bound;
        debug!("[Local] Server bound to {}", local);
        Ok(())
    }

    fn do_disconnect(&self, channel: &Channel) -> Result<()> {
        self.do_close(channel)
    }

    fn do_close(&self, channel: &Channel) -> Result<()> {
        let (was_bound, local, pending) = {
            let mut state = self.state.lock();
            if state.life == Life::Closed {
                return Ok(());
            }
            let was_bound = state.life == Life::Bound;
            state.life = Life::Closed;
            let pending: Vec<Channel> = state.pending.drain(..).collect();
            (was_bound, state.local.clone(), pending)
        };
        if was_bound {
            if let Some(Endpoint::Local(name)) = &local {
                LOCAL_REGISTRY.remove_if(name, |_, bound| {
                    bound.upgrade().map_or(true, |bound| &bound == channel)
                });
            }
        }
        for child in pending {
            child.unsafe_ops().close_forcibly();
        }
        Ok(())
    }

    fn do_begin_read(&self, channel: &Channel) -> Result<()> {
        let accepted: Vec<Channel> = {
            let mut state = self.state.lock();
            if state.accept_in_progress {
                return Ok(());
            }
            if state.pending.is_empty() {
                state.accept_in_progress = true;
                return Ok(());
            }
            state.pending.drain(..).collect()
        };
        LocalServerTransport::deliver_children(channel, accepted);
        Ok(())
    }

    fn do_write(&self, _channel: &Channel, _buffer: &OutboundBuffer) -> Result<()> {
        Err(ChannelError::illegal_state("a server channel does not write"))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chassis_core::global::GlobalEventExecutor;

    #[test]
    fn test_only_single_thread_loops_are_compatible() {
        let transport = LocalTransport::new();
        let event_loop = SingleThreadEventLoop::new("local-compat").unwrap();
        assert!(transport.is_compatible(event_loop.as_ref()));
        let global = GlobalEventExecutor::instance();
        assert!(!transport.is_compatible(global.as_ref()));
        event_loop.shutdown_gracefully();
    }

    #[test]
    fn test_non_local_addresses_are_rejected() {
        let tcp: Endpoint = "127.0.0.1:9000".parse::<std::net::SocketAddr>().unwrap().into();
        assert!(local_name(&tcp).is_err());
        assert!(local_name(&Endpoint::local("")).is_err());
        assert_eq!(local_name(&Endpoint::local("svc")).unwrap(), "svc");
    }

    #[test]
    fn test_fresh_transport_is_open_but_inactive() {
        let transport = LocalTransport::new();
        assert!(transport.is_open());
        assert!(!transport.is_active());
        assert!(!transport.metadata().has_disconnect());
        assert!(transport.local_address().is_none());
    }
}
