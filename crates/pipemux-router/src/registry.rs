use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use pipemux_frame::FrameConfig;
use pipemux_transport::{IoRunner, IpcStream};
use tracing::{debug, info};

use crate::error::{Result, RouterError};
use crate::router::RoutedChannel;
use crate::sync::lock;

/// Identifier of a peer process, unique within one broker's scope.
///
/// `0` is never assigned; it marks "unknown" in control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub const UNKNOWN: ProcessId = ProcessId(0);

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local table of channels to remote peers.
///
/// One [`RoutedChannel`] per peer process, created when the broker
/// introduces that peer and evicted when the channel retires (transport
/// down, last route gone). The registry holds the channel's only long-lived
/// reference; dispatchers hold theirs just between bind and close.
pub struct Registry {
    runner: IoRunner,
    config: FrameConfig,
    channels: Mutex<HashMap<ProcessId, Arc<RoutedChannel>>>,
}

impl Registry {
    pub fn new(runner: IoRunner) -> Arc<Self> {
        Self::with_config(runner, FrameConfig::default())
    }

    pub fn with_config(runner: IoRunner, config: FrameConfig) -> Arc<Self> {
        Arc::new(Self {
            runner,
            config,
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn runner(&self) -> &IoRunner {
        &self.runner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Stand up a channel to `peer` over `stream`.
    ///
    /// The channel's retirement hook evicts it from this table.
    pub fn register_peer(
        self: &Arc<Self>,
        peer: ProcessId,
        stream: IpcStream,
    ) -> Result<Arc<RoutedChannel>> {
        let mut channels = lock(&self.channels);
        if channels.contains_key(&peer) {
            return Err(RouterError::PeerExists(peer));
        }

        let registry: Weak<Registry> = Arc::downgrade(self);
        let channel = RoutedChannel::new(
            stream,
            self.config.clone(),
            self.runner.clone(),
            Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.evict(peer);
                }
            }),
        )?;
        channels.insert(peer, Arc::clone(&channel));
        info!(%peer, "channel to peer process up");
        Ok(channel)
    }

    /// The channel to `peer`, if one is up.
    pub fn channel(&self, peer: ProcessId) -> Option<Arc<RoutedChannel>> {
        lock(&self.channels).get(&peer).cloned()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.channels).len()
    }

    fn evict(&self, peer: ProcessId) {
        if lock(&self.channels).remove(&peer).is_some() {
            debug!(%peer, "channel to peer process retired");
        }
    }
}
