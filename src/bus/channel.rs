//! Shared state of one bound channel.

use super::Direction;
use super::extra::ExtraPool;
use super::message::{
    Body, BusHandler, Command, HEADER_LEN, Header, Message, MsgFlags, NO_WAIT_SLOT, ReplyWriter,
};
use super::ring::MessageRing;
use super::wait::WaitTable;
use crate::config::{BindRecord, BusConfig};
use crate::error::{Error, Result};
use crate::irq::IrqLock;
use crate::memory::MemBuf;
use crate::observability::BusMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::Span;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// One side registered, waiting for its peer.
    Pending,
    /// Both sides registered and open.
    Bound,
    /// One side unbound, the other still open.
    HalfClosed,
    /// No side open; the channel is released.
    Closed,
}

/// Scratch buffers used while delivering, sized on first use.
#[derive(Default)]
pub(crate) struct Scratch {
    pub(crate) entry: Vec<u8>,
    pub(crate) extra: Vec<u8>,
    pub(crate) reply: Vec<u8>,
}

/// One registered side: what it sends and how it receives.
pub(crate) struct Side {
    pub(crate) record: BindRecord,
    pub(crate) ring: IrqLock<MessageRing>,
    pub(crate) extra: Option<Arc<Mutex<ExtraPool>>>,
    pub(crate) waits: WaitTable,
    handler: Mutex<Box<dyn BusHandler>>,
    pub(crate) doorbell_tx: kanal::Sender<()>,
    pub(crate) doorbell_rx: kanal::Receiver<()>,
    pub(crate) scratch: Mutex<Scratch>,
    pub(crate) closed: AtomicBool,
    pub(crate) dispatching: AtomicBool,
    pub(crate) metrics: BusMetrics,
    pub(crate) span: Span,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Side {
    pub(crate) fn new(
        record: &BindRecord,
        config: &BusConfig,
        handler: Box<dyn BusHandler>,
    ) -> Result<Self> {
        let ring = MessageRing::new(record.slot_size as usize, record.slot_count as usize)?;
        let extra = if record.has_extra() {
            Some(Arc::new(Mutex::new(ExtraPool::new(
                record.extra_slot_size as usize,
                record.extra_slot_count as usize,
            )?)))
        } else {
            None
        };
        let (doorbell_tx, doorbell_rx) = kanal::bounded(1);
        let direction = record.direction.as_str();
        Ok(Self {
            record: *record,
            ring: IrqLock::new(ring),
            extra,
            waits: WaitTable::new(record.logical_id, config.wait_slots, record.slot_size as usize),
            handler: Mutex::new(handler),
            doorbell_tx,
            doorbell_rx,
            scratch: Mutex::new(Scratch::default()),
            closed: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            metrics: BusMetrics::new(record.logical_id, direction),
            span: config.tracing.bus_span(record.logical_id, direction),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ring and extra-pool handles reported to the registrant.
    pub(crate) fn regions(&self) -> (MemBuf, Option<MemBuf>) {
        let ring = self.ring.with(|r| r.mem_buf());
        let extra = self.extra.as_ref().map(|p| lock(p).mem_buf());
        (ring, extra)
    }

    /// Wake this side's dispatcher.
    pub(crate) fn kick(&self) {
        let _ = self.doorbell_tx.try_send(());
    }

    /// Run the handler on one message.
    pub(crate) fn handle(&self, msg: &Message<'_>, reply: &mut ReplyWriter<'_>) -> i32 {
        lock(&self.handler).on_message(msg, reply)
    }

    /// Deliver a locally generated command straight to the handler.
    pub(crate) fn notify(&self, cmd: Command) {
        let msg = Message {
            header: Header::new(MsgFlags::NONE, cmd.encoded_len() as u16),
            body: Body::Command(cmd),
        };
        let mut none = [0u8; 0];
        self.handle(&msg, &mut ReplyWriter::new(&mut none));
    }

    /// Post a command from this side, ignoring the closed flag.
    pub(crate) fn push_command(&self, cmd: Command) -> Result<u16> {
        self.ring
            .with(|r| r.push(MsgFlags::NONE, NO_WAIT_SLOT, &cmd.into()))
    }

    /// Bytes a delivered entry occupies.
    pub(crate) fn entry_len(&self) -> usize {
        HEADER_LEN + self.record.slot_size as usize
    }
}

/// The two sides sharing one logical id.
pub(crate) struct Channel {
    pub(crate) logical_id: u32,
    pub(crate) config: BusConfig,
    sides: IrqLock<[Option<Arc<Side>>; 2]>,
}

impl Channel {
    pub(crate) fn new(logical_id: u32, config: BusConfig) -> Self {
        Self {
            logical_id,
            config,
            sides: IrqLock::new([None, None]),
        }
    }

    /// Install `side`, replacing a closed predecessor.
    ///
    /// Returns the peer side, if registered. Fails with
    /// [`Error::AlreadyBound`] if an open side holds `direction` already.
    pub(crate) fn attach(&self, direction: Direction, side: Arc<Side>) -> Result<Option<Arc<Side>>> {
        self.sides.with(|sides| {
            if sides[direction.index()]
                .as_ref()
                .is_some_and(|s| !s.is_closed())
            {
                return Err(Error::AlreadyBound {
                    id: self.logical_id,
                    direction,
                });
            }
            sides[direction.index()] = Some(side);
            Ok(sides[direction.peer().index()].clone())
        })
    }

    /// The side registered for `direction`, open or closed.
    pub(crate) fn side(&self, direction: Direction) -> Option<Arc<Side>> {
        self.sides.with(|sides| sides[direction.index()].clone())
    }

    /// The peer of `direction` if it is registered and open.
    pub(crate) fn live_peer(&self, direction: Direction) -> Option<Arc<Side>> {
        self.side(direction.peer()).filter(|s| !s.is_closed())
    }

    pub(crate) fn state(&self) -> LinkState {
        self.sides.with(|sides| {
            let open = |s: &Option<Arc<Side>>| s.as_ref().is_some_and(|s| !s.is_closed());
            let present = |s: &Option<Arc<Side>>| s.is_some();
            match (open(&sides[0]), open(&sides[1])) {
                (true, true) => LinkState::Bound,
                (false, false) => LinkState::Closed,
                (true, false) if present(&sides[1]) => LinkState::HalfClosed,
                (false, true) if present(&sides[0]) => LinkState::HalfClosed,
                _ => LinkState::Pending,
            }
        })
    }
}
