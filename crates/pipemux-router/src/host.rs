use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use pipemux_frame::{Frame, FrameConfig, FrameError, FrameKind};
use pipemux_transport::{IoRunner, IpcStream, PlatformHandle};
use tracing::{debug, info, warn};

use crate::control::BrokerMessage;
use crate::error::Result;
use crate::registry::ProcessId;
use crate::router::CONTROL_ROUTE;
use crate::sync::lock;
use crate::transport::{Transport, TransportDelegate};

/// The broker: assigns process ids, introduces processes to each other, and
/// matches up the two ends of every cross-process pipe.
///
/// One [`BrokerHost`] per child carries the control traffic. Introductions
/// mint a fresh socketpair and ship one end to each child; after that the
/// broker never touches the pair again. The first `CONNECT_MESSAGE_PIPE`
/// request for a pipe id parks; the second (from a different process)
/// triggers the introduction and tells both sides where the other end
/// lives.
pub struct Broker {
    runner: IoRunner,
    config: FrameConfig,
    state: Mutex<BrokerState>,
}

struct BrokerState {
    hosts: HashMap<ProcessId, Arc<BrokerHost>>,
    /// Accepted children that have not said HELLO yet.
    joining: Vec<Arc<BrokerHost>>,
    /// pipe id → the process that parked the first request.
    pending_pipes: HashMap<u64, ProcessId>,
    /// Process pairs that already share a transport.
    linked: HashSet<(ProcessId, ProcessId)>,
    next_process_id: u64,
}

impl Broker {
    pub fn new(runner: IoRunner, config: FrameConfig) -> Arc<Self> {
        Arc::new(Self {
            runner,
            config,
            state: Mutex::new(BrokerState {
                hosts: HashMap::new(),
                joining: Vec::new(),
                pending_pipes: HashMap::new(),
                linked: HashSet::new(),
                next_process_id: 0,
            }),
        })
    }

    /// Adopt a freshly-accepted child connection.
    ///
    /// The child is anonymous until its HELLO arrives; the broker keeps the
    /// host alive either way and drops it when its control transport fails.
    pub fn accept_child(self: &Arc<Self>, stream: IpcStream) -> Result<Arc<BrokerHost>> {
        let host = Arc::new(BrokerHost {
            broker: Arc::downgrade(self),
            transport: Transport::new(stream, self.config.clone(), self.runner.clone()),
            process_id: Mutex::new(None),
        });
        lock(&self.state).joining.push(Arc::clone(&host));

        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(host.clone() as Arc<dyn TransportDelegate>));
        host.transport.start(delegate)?;

        info!("child connected");
        Ok(host)
    }

    /// Registered (post-HELLO) children.
    pub fn child_count(&self) -> usize {
        lock(&self.state).hosts.len()
    }

    /// Pipe requests still waiting for their other end.
    pub fn pending_pipe_count(&self) -> usize {
        lock(&self.state).pending_pipes.len()
    }

    fn on_hello(&self, host: &BrokerHost, requested: ProcessId) {
        let mut state = lock(&self.state);
        let position = state
            .joining
            .iter()
            .position(|h| std::ptr::eq(Arc::as_ptr(h), host));
        let Some(position) = position else {
            drop(state);
            warn!("HELLO from an already-registered child; failing it");
            host.fail();
            return;
        };
        let host = state.joining.remove(position);

        let id = if !requested.is_unknown() && !state.hosts.contains_key(&requested) {
            requested
        } else {
            loop {
                state.next_process_id += 1;
                let candidate = ProcessId(state.next_process_id);
                if !state.hosts.contains_key(&candidate) {
                    break candidate;
                }
            }
        };

        *lock(&host.process_id) = Some(id);
        state.hosts.insert(id, Arc::clone(&host));
        info!(child = %id, "child registered");

        if let Err(error) = host.send(BrokerMessage::Hello { process_id: id }, Vec::new()) {
            warn!(child = %id, %error, "HELLO reply lost");
        }
    }

    fn on_pipe_request(&self, child: ProcessId, pipe_id: u64) {
        let mut state = lock(&self.state);
        let Some(other) = state.pending_pipes.remove(&pipe_id) else {
            debug!(pipe_id, owner = %child, "pipe end parked, waiting for its peer");
            state.pending_pipes.insert(pipe_id, child);
            return;
        };

        if other == child {
            warn!(pipe_id, "both ends of a pipe requested by one process; ignoring");
            state.pending_pipes.insert(pipe_id, other);
            return;
        }

        let (Some(host_a), Some(host_b)) = (
            state.hosts.get(&other).cloned(),
            state.hosts.get(&child).cloned(),
        ) else {
            // The parked process died in between; this request parks instead.
            debug!(pipe_id, "parked peer vanished; re-parking");
            state.pending_pipes.insert(pipe_id, child);
            return;
        };

        if let Err(error) = Self::introduce(&mut state, other, &host_a, child, &host_b) {
            warn!(%error, "introduction failed");
            return;
        }

        info!(pipe_id, a = %other, b = %child, "pipe ends matched");
        if let Err(error) = host_a.send(
            BrokerMessage::ConnectMessagePipe {
                pipe_id,
                peer: child,
            },
            Vec::new(),
        ) {
            warn!(child = %other, %error, "pipe announcement lost");
        }
        if let Err(error) = host_b.send(
            BrokerMessage::ConnectMessagePipe {
                pipe_id,
                peer: other,
            },
            Vec::new(),
        ) {
            warn!(child = %child, %error, "pipe announcement lost");
        }
    }

    /// Ship a fresh transport pair to `a` and `b` unless they already share
    /// one. Announcements for a pipe always queue behind its introduction on
    /// each control channel, so children see CONNECT_TO_PROCESS first.
    fn introduce(
        state: &mut BrokerState,
        a: ProcessId,
        host_a: &Arc<BrokerHost>,
        b: ProcessId,
        host_b: &Arc<BrokerHost>,
    ) -> Result<()> {
        let key = if a <= b { (a, b) } else { (b, a) };
        if !state.linked.insert(key) {
            return Ok(());
        }

        let (end_a, end_b) = IpcStream::pair()?;
        host_a.send(
            BrokerMessage::ConnectToProcess { peer: b },
            vec![end_a.into_handle()],
        )?;
        host_b.send(
            BrokerMessage::ConnectToProcess { peer: a },
            vec![end_b.into_handle()],
        )?;
        info!(a = %a, b = %b, "processes introduced");
        Ok(())
    }

    fn evict_host(&self, host: &BrokerHost) {
        let mut state = lock(&self.state);
        let pid = *lock(&host.process_id);
        match pid {
            Some(pid) => {
                state.hosts.remove(&pid);
                state.pending_pipes.retain(|_, owner| *owner != pid);
                info!(child = %pid, "child disconnected");
            }
            None => {
                state
                    .joining
                    .retain(|h| !std::ptr::eq(Arc::as_ptr(h), host));
                debug!("unregistered child disconnected");
            }
        }
    }
}

/// The broker's half of one child's control channel.
///
/// Owns the control transport; drops out of the broker's tables when that
/// transport fails. Never owns the child process itself, and never tracks
/// the data channels it ships.
pub struct BrokerHost {
    broker: Weak<Broker>,
    transport: Transport,
    process_id: Mutex<Option<ProcessId>>,
}

impl BrokerHost {
    pub fn process_id(&self) -> Option<ProcessId> {
        *lock(&self.process_id)
    }

    fn send(&self, message: BrokerMessage, handles: Vec<PlatformHandle>) -> Result<()> {
        self.transport.send(Frame::internal_with_handles(
            CONTROL_ROUTE,
            message.encode(),
            handles,
        ))
    }

    /// Control-protocol violation: cut this child loose.
    fn fail(&self) {
        self.transport.shutdown();
        if let Some(broker) = self.broker.upgrade() {
            broker.evict_host(self);
        }
    }
}

impl TransportDelegate for BrokerHost {
    fn on_frame(&self, frame: Frame) {
        if frame.kind != FrameKind::Internal || frame.route_id != CONTROL_ROUTE {
            warn!(route_id = frame.route_id, "non-control frame on control channel");
            self.fail();
            return;
        }

        match BrokerMessage::decode(&frame.payload) {
            Ok(BrokerMessage::Hello { process_id }) => {
                if let Some(broker) = self.broker.upgrade() {
                    broker.on_hello(self, process_id);
                }
            }
            Ok(BrokerMessage::ConnectMessagePipe { pipe_id, peer }) if peer.is_unknown() => {
                let pid = *lock(&self.process_id);
                let Some(pid) = pid else {
                    warn!(pipe_id, "pipe request before HELLO");
                    self.fail();
                    return;
                };
                if let Some(broker) = self.broker.upgrade() {
                    broker.on_pipe_request(pid, pipe_id);
                }
            }
            Ok(message) => {
                warn!(?message, "host-only message from child");
                self.fail();
            }
            Err(error) => {
                warn!(%error, "malformed broker message");
                self.fail();
            }
        }
    }

    fn on_error(&self, error: FrameError) {
        debug!(%error, "child control channel down");
        if let Some(broker) = self.broker.upgrade() {
            broker.evict_host(self);
        }
    }
}
