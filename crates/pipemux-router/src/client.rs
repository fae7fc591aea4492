use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use pipemux_frame::{Frame, FrameError, FrameKind};
use pipemux_transport::{IpcStream, UnixDomainSocket};
use tracing::{debug, info, warn};

use crate::control::BrokerMessage;
use crate::dispatcher::PipeDispatcher;
use crate::error::{Result, RouterError};
use crate::registry::{ProcessId, Registry};
use crate::router::CONTROL_ROUTE;
use crate::sync::lock;
use crate::transport::{Transport, TransportDelegate};

struct ClientState {
    process_id: Option<ProcessId>,
    /// Endpoints waiting for the broker to announce their peer.
    parked: HashMap<u64, Arc<PipeDispatcher>>,
    failed: bool,
}

/// A child process's connection to the broker.
///
/// Handles the HELLO exchange, reacts to introductions by standing up
/// channels in the [`Registry`], and attaches parked pipe endpoints when the
/// broker announces where their other end lives. Data traffic never crosses
/// this object — only control messages do.
pub struct BrokerClient {
    registry: Arc<Registry>,
    transport: Transport,
    state: Mutex<ClientState>,
    state_cv: Condvar,
}

impl BrokerClient {
    /// Connect to a broker socket and complete the HELLO exchange.
    pub fn connect(
        path: impl AsRef<Path>,
        registry: Arc<Registry>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let stream = UnixDomainSocket::connect(path)?;
        Self::from_stream(stream, registry, ProcessId::UNKNOWN, timeout)
    }

    /// Join a broker over an existing control stream.
    ///
    /// `requested` proposes a process id; [`ProcessId::UNKNOWN`] asks the
    /// broker to assign one. Blocks until the broker's HELLO reply.
    pub fn from_stream(
        stream: IpcStream,
        registry: Arc<Registry>,
        requested: ProcessId,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(Self {
            transport: Transport::new(stream, registry.config().clone(), registry.runner().clone()),
            registry,
            state: Mutex::new(ClientState {
                process_id: None,
                parked: HashMap::new(),
                failed: false,
            }),
            state_cv: Condvar::new(),
        });

        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(client.clone() as Arc<dyn TransportDelegate>));
        client.transport.start(delegate)?;
        client.transport.send(Frame::internal(
            CONTROL_ROUTE,
            BrokerMessage::Hello {
                process_id: requested,
            }
            .encode(),
        ))?;

        client.wait_for(timeout, |state| state.process_id.is_some())?;
        Ok(client)
    }

    /// This process's broker-assigned id (`None` only before HELLO settles).
    pub fn process_id(&self) -> Option<ProcessId> {
        lock(&self.state).process_id
    }

    /// Open the local end of pipe `pipe_id`.
    ///
    /// Parks an endpoint, asks the broker for an introduction, and blocks
    /// until the other end registers somewhere and the broker says where.
    /// The returned endpoint is bound and ready for traffic.
    pub fn create_pipe(&self, pipe_id: u64, timeout: Duration) -> Result<Arc<PipeDispatcher>> {
        if pipe_id == CONTROL_ROUTE {
            return Err(RouterError::ReservedRoute);
        }

        let endpoint = PipeDispatcher::new();
        {
            let mut state = lock(&self.state);
            if state.failed {
                return Err(RouterError::ControlFailed);
            }
            if state.parked.contains_key(&pipe_id) {
                return Err(RouterError::RouteExists(pipe_id));
            }
            state.parked.insert(pipe_id, Arc::clone(&endpoint));
        }

        self.transport.send(Frame::internal(
            CONTROL_ROUTE,
            BrokerMessage::ConnectMessagePipe {
                pipe_id,
                peer: ProcessId::UNKNOWN,
            }
            .encode(),
        ))?;

        if let Err(error) = self.wait_for(timeout, |state| !state.parked.contains_key(&pipe_id)) {
            lock(&self.state).parked.remove(&pipe_id);
            return Err(error);
        }
        Ok(endpoint)
    }

    /// Block until `predicate` holds, the control channel fails, or `timeout`
    /// elapses.
    fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&ClientState) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.failed {
                return Err(RouterError::ControlFailed);
            }
            if predicate(&state) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RouterError::Timeout);
            }
            let (guard, _) = self
                .state_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
        }
    }

    fn fail_control(&self) {
        self.transport.shutdown();
        {
            let mut state = lock(&self.state);
            state.failed = true;
            state.parked.clear();
        }
        self.state_cv.notify_all();
    }
}

impl TransportDelegate for BrokerClient {
    fn on_frame(&self, frame: Frame) {
        if frame.kind != FrameKind::Internal || frame.route_id != CONTROL_ROUTE {
            warn!(route_id = frame.route_id, "non-control frame from broker");
            self.fail_control();
            return;
        }

        let message = match BrokerMessage::decode(&frame.payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "malformed broker message");
                self.fail_control();
                return;
            }
        };

        match message {
            BrokerMessage::Hello { process_id } => {
                info!(%process_id, "joined broker");
                lock(&self.state).process_id = Some(process_id);
                self.state_cv.notify_all();
            }
            BrokerMessage::ConnectToProcess { peer } => {
                let mut handles = frame.handles;
                if handles.len() != 1 {
                    warn!(
                        count = handles.len(),
                        "introduction must carry exactly one transport handle"
                    );
                    self.fail_control();
                    return;
                }
                let stream = IpcStream::from_handle(handles.remove(0));
                if let Err(error) = self.registry.register_peer(peer, stream) {
                    warn!(%peer, %error, "introduction rejected");
                }
            }
            BrokerMessage::ConnectMessagePipe { pipe_id, peer } => {
                if peer.is_unknown() {
                    warn!(pipe_id, "pipe announcement without a peer process");
                    self.fail_control();
                    return;
                }
                let endpoint = lock(&self.state).parked.get(&pipe_id).cloned();
                let Some(endpoint) = endpoint else {
                    debug!(pipe_id, "announcement for an endpoint no longer parked");
                    return;
                };
                match self.registry.channel(peer) {
                    Some(channel) => {
                        if let Err(error) = endpoint.bind(channel, pipe_id) {
                            warn!(pipe_id, %error, "failed to bind announced pipe");
                        }
                    }
                    None => {
                        // The broker always introduces before announcing.
                        warn!(pipe_id, %peer, "announcement for an unknown process");
                        self.fail_control();
                        return;
                    }
                }
                lock(&self.state).parked.remove(&pipe_id);
                self.state_cv.notify_all();
            }
        }
    }

    fn on_error(&self, error: FrameError) {
        debug!(%error, "broker control channel down");
        self.fail_control();
    }
}
