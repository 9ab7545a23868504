//! Named-event dispatch between the session and its collaborators
//!
//! Handlers are registered per event name and run synchronously, in
//! registration order, over a snapshot of the handler list taken when
//! dispatch starts. A handler that returns an error or panics is reported to
//! the diagnostic sink and the remaining handlers still run.
//!
//! The bus uses interior mutability so handlers holding a shared reference to
//! it may register or remove handlers while a dispatch is in progress; such
//! changes apply from the next dispatch.

use log::error;
use shared::{LinkMessage, PeerId, Role};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Error(String),
    Panic(String),
}

/// A handler failure as seen by the diagnostic sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub event: String,
    pub handler: HandlerId,
    pub failure: Failure,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            Failure::Error(message) => write!(
                f,
                "handler {:?} for '{}' failed: {}",
                self.handler, self.event, message
            ),
            Failure::Panic(message) => write!(
                f,
                "handler {:?} for '{}' panicked: {}",
                self.handler, self.event, message
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

type Handler<P> = Rc<dyn Fn(&P, Option<&PeerId>) -> HandlerResult>;
type Sink = Rc<dyn Fn(&Diagnostic)>;

pub struct EventBus<P> {
    handlers: RefCell<HashMap<String, Vec<(HandlerId, Handler<P>)>>>,
    next_id: Cell<u64>,
    sink: RefCell<Sink>,
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventBus<P> {
    pub fn new() -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            sink: RefCell::new(Rc::new(|diagnostic| error!("{}", diagnostic))),
        }
    }

    /// Replaces the diagnostic sink (defaults to `log::error!`).
    pub fn set_sink(&self, sink: impl Fn(&Diagnostic) + 'static) {
        *self.sink.borrow_mut() = Rc::new(sink);
    }

    pub fn on(
        &self,
        name: &str,
        handler: impl Fn(&P, Option<&PeerId>) -> HandlerResult + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        self.handlers
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push((id, Rc::new(handler)));
        id
    }

    /// Removes a handler; returns false if it was not registered for `name`.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };

        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.borrow().get(name).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, name: &str, payload: &P, from: Option<&PeerId>) -> DispatchReport {
        let snapshot: Vec<(HandlerId, Handler<P>)> = match self.handlers.borrow().get(name) {
            Some(list) => list.clone(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            let failure = match catch_unwind(AssertUnwindSafe(|| handler(payload, from))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Failure::Error(e.0)),
                Err(panic) => Some(Failure::Panic(panic_message(panic))),
            };

            match failure {
                None => report.delivered += 1,
                Some(failure) => {
                    report.failed += 1;
                    let diagnostic = Diagnostic {
                        event: name.to_string(),
                        handler: id,
                        failure,
                    };
                    // Released before the call so the sink may replace itself
                    let sink = Rc::clone(&self.sink.borrow());
                    sink(&diagnostic);
                }
            }
        }
        report
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Events the session publishes on its bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Link(LinkMessage),
    LinkOpened(PeerId),
    LinkClosed(PeerId),
    PeerJoined { peer_id: PeerId, role: Role },
    PeerLeft(PeerId),
    HostChanged(Option<PeerId>),
    HostStarted,
    HostStopped,
    Waiting,
}

impl Event {
    pub const LINK_OPENED: &'static str = "link.opened";
    pub const LINK_CLOSED: &'static str = "link.closed";
    pub const PEER_JOINED: &'static str = "peer.joined";
    pub const PEER_LEFT: &'static str = "peer.left";
    pub const HOST_CHANGED: &'static str = "host.changed";
    pub const HOST_STARTED: &'static str = "host.started";
    pub const HOST_STOPPED: &'static str = "host.stopped";
    pub const WAITING: &'static str = "session.waiting";

    pub fn name(&self) -> &'static str {
        match self {
            Event::Link(message) => message.name(),
            Event::LinkOpened(_) => Self::LINK_OPENED,
            Event::LinkClosed(_) => Self::LINK_CLOSED,
            Event::PeerJoined { .. } => Self::PEER_JOINED,
            Event::PeerLeft(_) => Self::PEER_LEFT,
            Event::HostChanged(_) => Self::HOST_CHANGED,
            Event::HostStarted => Self::HOST_STARTED,
            Event::HostStopped => Self::HOST_STOPPED,
            Event::Waiting => Self::WAITING,
        }
    }
}
