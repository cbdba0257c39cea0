//! Directory of channels by logical id.

use super::channel::{Channel, LinkState, Side, lock};
use super::endpoint::{BindInfo, Endpoint, EndpointInner};
use super::message::{BusHandler, Command};
use crate::config::{BindRecord, BusConfig};
use crate::error::Result;
use crate::irq::{SlowPath, ensure_worker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct RegistryInner {
    config: BusConfig,
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
}

/// Lock-guarded map from logical id to channel.
///
/// Created once per bus and passed to everything that registers an
/// endpoint. Cloning is cheap and shares the same directory.
#[derive(Clone)]
pub struct BusRegistry {
    inner: Arc<RegistryInner>,
}

impl BusRegistry {
    /// Create an empty registry.
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                channels: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Settings applied to every channel.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register one side of the channel `record.logical_id`.
    ///
    /// If the peer is already registered, `handler` immediately receives a
    /// synthetic [`Command::Bound`] and a `Bound` message is posted to the
    /// peer. Either side may register first; the resulting state is the
    /// same. Worker context only.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`](crate::Error::InvalidArgument) for a
    ///   malformed record
    /// - [`Error::AlreadyBound`](crate::Error::AlreadyBound) if an open
    ///   endpoint holds this direction already
    pub fn register<H>(&self, record: BindRecord, handler: H) -> Result<(Endpoint, BindInfo)>
    where
        H: BusHandler + 'static,
    {
        ensure_worker("register")?;
        record.validate()?;
        let side = Arc::new(Side::new(&record, &self.inner.config, Box::new(handler))?);

        let (channel, peer) = {
            let mut channels = lock(&self.inner.channels);
            let channel = Arc::clone(channels.entry(record.logical_id).or_insert_with(|| {
                Arc::new(Channel::new(record.logical_id, self.inner.config.clone()))
            }));
            let peer = channel.attach(record.direction, Arc::clone(&side))?;
            (channel, peer)
        };

        let (ring, extra) = side.regions();
        let info = BindInfo::new(ring, extra);
        let endpoint = Endpoint::new(EndpointInner {
            channel,
            direction: record.direction,
            side: Arc::clone(&side),
            registry: self.clone(),
        });

        match peer.filter(|p| !p.is_closed()) {
            Some(peer) => {
                side.notify(Command::Bound);
                side.push_command(Command::Bound)?;
                peer.kick();
                tracing::info!(parent: &side.span, "endpoint bound");
            }
            None => tracing::debug!(parent: &side.span, "endpoint waiting for peer"),
        }
        Ok((endpoint, info))
    }

    /// State of the channel `logical_id`; [`LinkState::Closed`] if unknown.
    pub fn state(&self, logical_id: u32) -> LinkState {
        lock(&self.inner.channels)
            .get(&logical_id)
            .map_or(LinkState::Closed, |c| c.state())
    }

    /// Whether a channel exists for `logical_id`.
    pub fn contains(&self, logical_id: u32) -> bool {
        lock(&self.inner.channels).contains_key(&logical_id)
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Whether no channel is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `channel` from the directory if it is still the current entry
    /// and no side is open.
    ///
    /// The state is read under the directory lock, which `register` also
    /// holds while attaching, so a side attached concurrently keeps the
    /// channel alive.
    pub(crate) fn release_if_closed(&self, channel: &Arc<Channel>) {
        let mut channels = lock(&self.inner.channels);
        let current = channels
            .get(&channel.logical_id)
            .is_some_and(|c| Arc::ptr_eq(c, channel));
        if current && channel.state() == LinkState::Closed {
            channels.remove(&channel.logical_id);
            tracing::debug!(endpoint = format_args!("{:#x}", channel.logical_id), "channel released");
        }
    }
}

impl SlowPath for BusRegistry {}

impl std::fmt::Debug for BusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusRegistry")
            .field("channels", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Direction, Message, ReplyWriter};
    use crate::error::Error;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<Command>>>;

    fn recorder(log: &Log) -> impl FnMut(&Message<'_>, &mut ReplyWriter<'_>) -> i32 + Send + 'static {
        let log = Arc::clone(log);
        move |msg, _reply| {
            if let Some(cmd) = msg.command() {
                log.lock().unwrap().push(cmd);
            }
            0
        }
    }

    #[test]
    fn test_first_registrant_is_pending() {
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        let log = Log::default();
        let (up, info) = registry
            .register(BindRecord::new(1, Direction::UpToDown), recorder(&log))
            .unwrap();
        assert_eq!(up.state(), LinkState::Pending);
        assert_eq!(registry.state(1), LinkState::Pending);
        assert_ne!(info.ring_base, 0);
        assert_eq!(info.extra_size, 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(up.post(Command::ResetControl), Err(Error::Unbound(1)));
    }

    #[test]
    fn test_double_bind_rejected() {
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        let (_a, _) = registry
            .register(BindRecord::new(2, Direction::DownToUp), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
            .unwrap();
        let err = registry
            .register(BindRecord::new(2, Direction::DownToUp), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
            .unwrap_err();
        assert_eq!(
            err,
            Error::AlreadyBound {
                id: 2,
                direction: Direction::DownToUp
            }
        );
    }

    #[test]
    fn test_malformed_record_rejected() {
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        let record = BindRecord::new(3, Direction::UpToDown).with_ring(256, 0);
        assert!(matches!(
            registry.register(record, |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!registry.contains(3));
    }

    #[test]
    fn test_register_refused_in_interrupt() {
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        let _irq = crate::irq::enter(0);
        assert_eq!(
            registry
                .register(BindRecord::new(4, Direction::UpToDown), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
                .unwrap_err(),
            Error::InInterrupt("register")
        );
    }

    #[test]
    fn test_channel_released_after_both_close() {
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        let (up, _) = registry
            .register(BindRecord::new(5, Direction::UpToDown), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
            .unwrap();
        let (down, _) = registry
            .register(BindRecord::new(5, Direction::DownToUp), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
            .unwrap();
        assert_eq!(registry.state(5), LinkState::Bound);

        up.unbind().unwrap();
        assert_eq!(down.state(), LinkState::HalfClosed);
        assert!(registry.contains(5));

        drop(down);
        assert!(!registry.contains(5));
        assert!(registry.is_empty());
        drop(up);
    }

    #[test]
    fn test_reregister_after_unbind() {
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        let (up, _) = registry
            .register(BindRecord::new(6, Direction::UpToDown), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
            .unwrap();
        let (_down, _) = registry
            .register(BindRecord::new(6, Direction::DownToUp), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
            .unwrap();
        drop(up);

        let log = Log::default();
        let (up, _) = registry
            .register(BindRecord::new(6, Direction::UpToDown), recorder(&log))
            .unwrap();
        assert!(up.is_bound());
        assert_eq!(*log.lock().unwrap(), vec![Command::Bound]);
    }

    #[test]
    fn test_register_racing_close_keeps_channel() {
        fn noop(_: &Message<'_>, _: &mut ReplyWriter<'_>) -> i32 {
            0
        }
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        for round in 0..200u32 {
            let id = 0x1000 + round;
            let (up, _) = registry
                .register(BindRecord::new(id, Direction::UpToDown), noop)
                .unwrap();
            let closer = std::thread::spawn(move || up.unbind());
            let (down, _) = registry
                .register(BindRecord::new(id, Direction::DownToUp), noop)
                .unwrap();
            closer.join().unwrap().unwrap();

            // Whatever the interleaving, `down` is still reachable by id.
            let (_up, _) = registry
                .register(BindRecord::new(id, Direction::UpToDown), noop)
                .unwrap();
            assert_eq!(registry.state(id), LinkState::Bound, "round {round}");
            assert!(down.is_bound());
        }
    }
}
