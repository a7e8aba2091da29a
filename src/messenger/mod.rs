//! The messenger: one owner, many conversations.
//!
//! A [`Messenger`] multiplexes any number of AMQP-style conversations
//! through a single blocking-with-deadline surface. Connections, sessions,
//! and links are created lazily and reused, keyed by `(host, port, path)`;
//! deliveries are tracked in two bounded-window queues (one per
//! direction); receive credit is distributed fairly across every active
//! receiver. All I/O progress happens inside the wait loop; the caller's
//! thread is the only thread there is.

mod credit;
mod finder;
mod tracker;

pub use tracker::{Status, Tracker, TrackerQueue, CUMULATIVE};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::address::Address;
use crate::driver::{Connector, Driver};
use crate::engine::{Connection, Delivery, EndpointState, Link, StateSet};
use crate::error::{MessengerError, MessengerResult};
use crate::message::{EncodeError, Message};
use finder::LinkFinder;

/// Tuning knobs for a [`Messenger`].
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Deadline for each outbound TCP connect.
    pub connect_timeout: Duration,
    /// Initial size of the encode/decode scratch buffer. The buffer grows
    /// by doubling and is never shrunk.
    pub initial_buffer_size: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            initial_buffer_size: 5 * 1024,
        }
    }
}

/// Wait-loop conditions.
enum Predicate {
    /// Every live outgoing delivery is resolved or unreachable.
    SentSettled,
    /// Some delivery is readable and complete.
    MessageAvailable,
    /// No connectors remain.
    AllClosed,
}

/// A high-level messaging endpoint.
///
/// ```no_run
/// use quay::{Message, Messenger};
///
/// # fn main() -> Result<(), quay::MessengerError> {
/// let mut messenger = Messenger::new("example");
/// messenger.set_timeout(1_000);
/// messenger.start()?;
/// messenger.put(&Message::new("amqp://127.0.0.1/queue", "hello"))?;
/// messenger.send()?;
/// messenger.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct Messenger {
    name: String,
    config: MessengerConfig,
    timeout: i64,
    next_tag: u64,
    buffer: Vec<u8>,
    driver: Option<Driver>,
    credit: i32,
    distributed: i32,
    unlimited: bool,
    incoming: TrackerQueue,
    outgoing: TrackerQueue,
}

impl Messenger {
    /// Create a messenger with the given container name.
    pub fn new(name: impl Into<String>) -> Messenger {
        Messenger::with_config(name, MessengerConfig::default())
    }

    /// Create a messenger with a random container name.
    pub fn new_random() -> Messenger {
        Messenger::new(format!("quay-{:08x}", rand::random::<u32>()))
    }

    /// Create a messenger with explicit configuration.
    pub fn with_config(name: impl Into<String>, config: MessengerConfig) -> Messenger {
        let buffer = vec![0u8; config.initial_buffer_size];
        Messenger {
            name: name.into(),
            config,
            timeout: -1,
            next_tag: 1,
            buffer,
            driver: None,
            credit: 0,
            distributed: 0,
            unlimited: false,
            incoming: TrackerQueue::incoming(),
            outgoing: TrackerQueue::outgoing(),
        }
    }

    /// The container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured timeout in milliseconds; negative means forever.
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    /// Set the timeout in milliseconds; negative means forever.
    pub fn set_timeout(&mut self, timeout_ms: i64) {
        self.timeout = timeout_ms;
    }

    /// The incoming tracker-queue window.
    pub fn incoming_window(&self) -> usize {
        self.incoming.window()
    }

    /// Set the incoming tracker-queue window.
    pub fn set_incoming_window(&mut self, window: usize) {
        self.incoming.set_window(window);
    }

    /// The outgoing tracker-queue window.
    pub fn outgoing_window(&self) -> usize {
        self.outgoing.window()
    }

    /// Set the outgoing tracker-queue window.
    pub fn set_outgoing_window(&mut self, window: usize) {
        self.outgoing.set_window(window);
    }

    /// Whether `start` has been called and `stop` has not.
    pub fn is_started(&self) -> bool {
        self.driver.is_some()
    }

    /// Create the driver. Operations that move bytes require this.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::Io`] when the driver cannot be created.
    pub fn start(&mut self) -> MessengerResult<()> {
        if self.driver.is_none() {
            self.driver = Some(Driver::new(self.config.connect_timeout)?);
            debug!(name = %self.name, "messenger started");
        }
        Ok(())
    }

    /// Close every connection, flush the closes, close every listener,
    /// wait for the connectors to drain, and destroy the driver.
    ///
    /// A timeout while draining is logged, not raised.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; kept fallible for parity with
    /// the other lifecycle operations.
    pub fn stop(&mut self) -> MessengerResult<()> {
        let (connectors, listeners) = match self.driver.as_ref() {
            Some(driver) => (driver.connectors(), driver.listeners()),
            None => return Ok(()),
        };
        for connector in connectors {
            let connection = connector.borrow().connection();
            connection.borrow_mut().close();
            if let Err(e) = connector.borrow_mut().process() {
                warn!(error = %e, "error while sending close");
            }
        }
        for listener in listeners {
            listener.borrow_mut().close();
        }
        match self.wait_until(Predicate::AllClosed) {
            Ok(()) => {}
            Err(MessengerError::Timeout) => warn!("timed out while waiting for close"),
            Err(e) => return Err(e),
        }
        self.driver = None;
        debug!(name = %self.name, "messenger stopped");
        Ok(())
    }

    /// Queue a message for delivery to its address.
    ///
    /// The connection, session, and sender link are found or created; the
    /// message is encoded and handed to the engine. No I/O happens here;
    /// `send` (or any wait) moves the bytes.
    ///
    /// # Errors
    ///
    /// [`MessengerError::InvalidAddress`] when the address is malformed or
    /// has no host; [`MessengerError::NotStarted`] without a driver.
    pub fn put(&mut self, message: &Message) -> MessengerResult<()> {
        let raw = message.address.clone().unwrap_or_default();
        let address = Address::parse(&raw)
            .map_err(|_| MessengerError::InvalidAddress(raw.clone()))?;
        let port = address.port();
        let sender = self.get_link(
            address.host(),
            port,
            &LinkFinder::sender(address.node()),
        )?;

        let mut message = message.clone();
        self.adjust_reply_to(&mut message);

        let tag = self.next_tag.to_string().into_bytes();
        self.next_tag += 1;
        let delivery = Link::delivery(&sender, tag);

        let encoded = loop {
            match message.encode(&mut self.buffer) {
                Ok(size) => break size,
                Err(EncodeError::Overflow { .. }) => {
                    let doubled = self.buffer.len() * 2;
                    self.buffer.resize(doubled, 0);
                }
                Err(e) => return Err(MessengerError::Encode(e.to_string())),
            }
        };

        sender.borrow_mut().send_bytes(&self.buffer[..encoded]);
        self.outgoing.add(&delivery);
        sender.borrow_mut().advance();
        Ok(())
    }

    /// Block until every queued send is settled or unreachable.
    ///
    /// # Errors
    ///
    /// [`MessengerError::Timeout`] when the configured timeout expires.
    pub fn send(&mut self) -> MessengerResult<()> {
        if self.driver.is_none() {
            return Err(MessengerError::NotStarted);
        }
        self.wait_until(Predicate::SentSettled)
    }

    /// Add `n` to the receive-credit pool (−1 for unlimited), distribute
    /// it, and block until a message is available.
    ///
    /// # Errors
    ///
    /// [`MessengerError::Timeout`] when the configured timeout expires;
    /// [`MessengerError::NotStarted`] without a driver.
    pub fn recv(&mut self, n: i32) -> MessengerResult<()> {
        if self.driver.is_none() {
            return Err(MessengerError::NotStarted);
        }
        if n == -1 {
            self.unlimited = true;
        } else {
            self.credit += n;
            self.unlimited = false;
        }
        self.distribute_credit();
        self.wait_until(Predicate::MessageAvailable)
    }

    /// Take the next readable message, if any.
    ///
    /// The delivery joins the incoming tracker queue; use
    /// [`incoming_tracker`](Messenger::incoming_tracker) to disposition it.
    ///
    /// # Errors
    ///
    /// [`MessengerError::Decode`] when the delivery does not contain a
    /// valid message.
    pub fn get(&mut self) -> MessengerResult<Option<Message>> {
        let connectors = match self.driver.as_ref() {
            Some(driver) => driver.connectors(),
            None => return Ok(None),
        };
        for connector in connectors {
            let connection = connector.borrow().connection();
            debug!(peer = %connector.borrow().target(), "attempting to get message");
            for delivery in connection.borrow().work_deliveries() {
                let readable = {
                    let d = delivery.borrow();
                    d.is_readable() && !d.is_partial()
                };
                if !readable {
                    continue;
                }
                let size = self.read_delivery(&delivery);
                let message = Message::decode(&self.buffer[..size])
                    .map_err(|e| MessengerError::Decode(e.to_string()))?;
                self.incoming.add(&delivery);
                self.distributed -= 1;
                if let Some(link) = delivery.borrow().link() {
                    link.borrow_mut().take_delivery(&delivery);
                }
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Subscribe to a source address.
    ///
    /// A source containing `~` is a server-side bind: the tilde is
    /// stripped and a listener is created on the host and port. Any other
    /// source creates (or reuses) a receiver link, ready for credit.
    ///
    /// # Errors
    ///
    /// [`MessengerError::InvalidAddress`] for unparseable sources;
    /// [`MessengerError::Io`] when a listener cannot be bound;
    /// [`MessengerError::NotStarted`] without a driver.
    pub fn subscribe(&mut self, source: &str) -> MessengerResult<()> {
        let listen = source.contains('~');
        let cleaned = source.replace('~', "");
        let address = Address::parse(&cleaned)
            .map_err(|_| MessengerError::InvalidAddress(source.to_string()))?;
        let port = address.port();
        if listen {
            let driver = self.driver.as_mut().ok_or(MessengerError::NotStarted)?;
            driver.create_listener(address.host(), port)?;
            debug!(host = address.host(), port, "subscribed as listener");
        } else {
            self.get_link(
                address.host(),
                port,
                &LinkFinder::receiver(address.node()),
            )?;
        }
        Ok(())
    }

    /// Drive I/O and the state machines for one bounded cycle.
    ///
    /// Useful for interleaving several messengers on one thread; a cycle
    /// in which nothing happens is not an error.
    ///
    /// # Errors
    ///
    /// [`MessengerError::NotStarted`] without a driver.
    pub fn work(&mut self, timeout_ms: i64) -> MessengerResult<()> {
        if self.driver.is_none() {
            return Err(MessengerError::NotStarted);
        }
        self.process_all_connectors();
        self.process_active();
        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };
        if let Some(driver) = self.driver.as_mut() {
            driver.do_wait(timeout);
        }
        self.process_active();
        Ok(())
    }

    /// Accept the delivery at `tracker`; with [`CUMULATIVE`], everything
    /// older too. Unknown trackers are ignored.
    pub fn accept(&mut self, tracker: Tracker, flags: u32) {
        self.queue_for_mut(tracker).accept(tracker, flags);
    }

    /// Reject the delivery at `tracker` (cumulative rule as for accept).
    pub fn reject(&mut self, tracker: Tracker, flags: u32) {
        self.queue_for_mut(tracker).reject(tracker, flags);
    }

    /// Settle the delivery at `tracker` (cumulative rule as for accept).
    pub fn settle(&mut self, tracker: Tracker, flags: u32) {
        self.queue_for_mut(tracker).settle(tracker, flags);
    }

    /// Status of the delivery at `tracker`.
    pub fn status(&self, tracker: Tracker) -> Status {
        self.queue_for(tracker).status(tracker)
    }

    /// Tracker for the most recently received delivery.
    pub fn incoming_tracker(&self) -> Tracker {
        self.incoming.last_tracker()
    }

    /// Tracker for the most recently queued send.
    pub fn outgoing_tracker(&self) -> Tracker {
        self.outgoing.last_tracker()
    }

    /// Deliveries queued across all active sender links.
    pub fn outgoing(&self) -> usize {
        self.queued(true)
    }

    /// Deliveries queued across all active receiver links.
    pub fn incoming(&self) -> usize {
        self.queued(false)
    }

    fn queue_for(&self, tracker: Tracker) -> &TrackerQueue {
        if tracker.is_outgoing() {
            &self.outgoing
        } else {
            &self.incoming
        }
    }

    fn queue_for_mut(&mut self, tracker: Tracker) -> &mut TrackerQueue {
        if tracker.is_outgoing() {
            &mut self.outgoing
        } else {
            &mut self.incoming
        }
    }

    fn queued(&self, senders: bool) -> usize {
        let Some(driver) = self.driver.as_ref() else {
            return 0;
        };
        let mut count = 0;
        for connector in driver.connectors() {
            let connection = connector.borrow().connection();
            for link in connection.borrow().links_in(StateSet::ACTIVE, StateSet::ANY) {
                let l = link.borrow();
                if l.is_sender() == senders {
                    count += l.queued();
                }
            }
        }
        count
    }

    fn adjust_reply_to(&self, message: &mut Message) {
        match message.reply_to.as_deref() {
            None | Some("") => {
                message.reply_to = Some(format!("amqp://{}", self.name));
            }
            Some(original) => {
                if let Some(rest) = original.strip_prefix("~/") {
                    message.reply_to = Some(format!("amqp://{}/{}", self.name, rest));
                }
            }
        }
    }

    /// Read the delivery's bytes into the scratch buffer, doubling it as
    /// long as reads keep filling the available space.
    fn read_delivery(&mut self, delivery: &Rc<RefCell<Delivery>>) -> usize {
        let mut total = 0;
        let mut start = 0;
        loop {
            let read = delivery.borrow_mut().read_into(&mut self.buffer[start..]);
            total += read;
            if read == self.buffer.len() - start {
                let doubled = self.buffer.len() * 2;
                self.buffer.resize(doubled, 0);
                start += read;
            } else {
                break;
            }
        }
        total
    }

    fn lookup(&self, service: &str) -> MessengerResult<Option<Rc<RefCell<Connection>>>> {
        let driver = self.driver.as_ref().ok_or(MessengerError::NotStarted)?;
        for connector in driver.connectors() {
            let connection = connector.borrow().connection();
            let matches = connection.borrow().context() == Some(service);
            if matches {
                return Ok(Some(connection));
            }
        }
        Ok(None)
    }

    fn get_link(
        &mut self,
        host: &str,
        port: u16,
        finder: &LinkFinder,
    ) -> MessengerResult<Rc<RefCell<Link>>> {
        let service = format!("{}:{}", host, port);
        let connection = match self.lookup(&service)? {
            Some(connection) => connection,
            None => {
                debug!(host, port, "connecting");
                let connection = Connection::create(self.name.clone());
                {
                    let mut c = connection.borrow_mut();
                    c.set_hostname(host);
                    c.set_context(service);
                    c.configure_sasl_client();
                    c.open();
                }
                let driver = self.driver.as_mut().ok_or(MessengerError::NotStarted)?;
                driver.create_connector(host, port, connection.clone());
                connection
            }
        };

        for link in connection.borrow().links_in(StateSet::ACTIVE, StateSet::ANY) {
            if finder.matches(&link) {
                return Ok(link);
            }
        }
        let session = Connection::session(&connection);
        session.borrow_mut().open();
        let link = finder.create(&session);
        link.borrow_mut().open();
        Ok(link)
    }

    fn active_receivers(&self) -> Vec<Rc<RefCell<Link>>> {
        let Some(driver) = self.driver.as_ref() else {
            return Vec::new();
        };
        let mut receivers = Vec::new();
        for connector in driver.connectors() {
            let connection = connector.borrow().connection();
            for link in connection.borrow().links_in(StateSet::ACTIVE, StateSet::ANY) {
                if link.borrow().is_receiver() {
                    receivers.push(link);
                }
            }
        }
        receivers
    }

    fn distribute_credit(&mut self) {
        let receivers = self.active_receivers();
        credit::distribute(
            &receivers,
            &mut self.credit,
            &mut self.distributed,
            self.unlimited,
        );
    }

    fn reclaim_credit(&mut self, connection: &Rc<RefCell<Connection>>) {
        for link in connection.borrow().links_in(StateSet::ANY, StateSet::ANY) {
            credit::reclaim(&link, &mut self.credit, &mut self.distributed);
        }
    }

    /// Pass A: advance every connector's socket pump.
    fn process_all_connectors(&mut self) {
        let Some(driver) = self.driver.as_ref() else {
            return;
        };
        for connector in driver.connectors() {
            if let Err(e) = connector.borrow_mut().process() {
                error!(error = %e, "error processing connection");
            }
        }
    }

    /// Pass B: accept, open, mirror dispositions, distribute credit, and
    /// run the half-close handshake on every connector.
    fn process_active(&mut self) {
        let listeners = match self.driver.as_ref() {
            Some(driver) => driver.listeners(),
            None => return,
        };
        for listener in listeners {
            loop {
                let accepted = listener.borrow_mut().try_accept();
                let Some((stream, peer)) = accepted else {
                    break;
                };
                let connection = Connection::create(self.name.clone());
                {
                    let mut c = connection.borrow_mut();
                    c.configure_sasl_server(vec!["ANONYMOUS".to_string()]);
                    c.open();
                }
                if let Some(driver) = self.driver.as_mut() {
                    driver.adopt_incoming(stream, peer, connection);
                }
            }
        }

        let connectors = match self.driver.as_ref() {
            Some(driver) => driver.connectors(),
            None => return,
        };
        for connector in connectors {
            self.process_connector(&connector);
        }
    }

    fn process_connector(&mut self, connector: &Rc<RefCell<Connector>>) {
        if let Err(e) = connector.borrow_mut().process() {
            error!(error = %e, "error processing connection");
        }
        let connection = connector.borrow().connection();

        if connection.borrow().local_state() == EndpointState::Uninit {
            connection.borrow_mut().open();
        }

        // Mirror remote dispositions onto our sends; this is what makes
        // sender-side settlement observable.
        for delivery in connection.borrow().work_deliveries() {
            let mirror = {
                let d = delivery.borrow();
                let on_sender = d
                    .link()
                    .map(|l| l.borrow().is_sender())
                    .unwrap_or(false);
                if on_sender && d.is_updated() {
                    d.remote_state()
                } else {
                    None
                }
            };
            if let Some(state) = mirror {
                delivery.borrow_mut().disposition(state);
            }
        }
        self.outgoing.slide();

        for session in connection.borrow().sessions_in(StateSet::UNINIT, StateSet::ANY) {
            session.borrow_mut().open();
            debug!("opened session");
        }
        for link in connection.borrow().links_in(StateSet::UNINIT, StateSet::ANY) {
            let mut l = link.borrow_mut();
            let source = l.remote_source().map(str::to_string);
            let target = l.remote_target().map(str::to_string);
            l.set_local_source(source);
            l.set_local_target(target);
            l.open();
            debug!(name = %l.name(), "opened link");
        }

        self.distribute_credit();

        for link in connection.borrow().links_in(StateSet::ACTIVE, StateSet::CLOSED) {
            link.borrow_mut().close();
        }
        for session in connection.borrow().sessions_in(StateSet::ACTIVE, StateSet::CLOSED) {
            session.borrow_mut().close();
        }
        let (local, remote) = {
            let c = connection.borrow();
            (c.local_state(), c.remote_state())
        };
        if remote == EndpointState::Closed {
            if local == EndpointState::Active {
                connection.borrow_mut().close();
            } else if local == EndpointState::Closed {
                connector.borrow_mut().close();
            }
        }

        if connector.borrow().is_closed() {
            self.reclaim_credit(&connection);
            if let Some(driver) = self.driver.as_mut() {
                driver.destroy_connector(connector);
            }
        } else if let Err(e) = connector.borrow_mut().process() {
            error!(error = %e, "error processing connection");
        }
    }

    fn wait_until(&mut self, predicate: Predicate) -> MessengerResult<()> {
        self.wait_until_for(predicate, self.timeout)
    }

    fn wait_until_for(&mut self, predicate: Predicate, timeout_ms: i64) -> MessengerResult<()> {
        self.process_all_connectors();

        let deadline = if timeout_ms < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        };

        let mut wait = deadline.map_or(true, |d| d > Instant::now());
        let mut first = true;
        let mut done = false;

        while first || (!done && wait) {
            if wait && !done && !first {
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                if let Some(driver) = self.driver.as_mut() {
                    driver.do_wait(remaining);
                }
            }
            self.process_active();
            wait = deadline.map_or(true, |d| d > Instant::now());
            done = done || self.test(&predicate);
            first = false;
        }

        if done {
            Ok(())
        } else {
            Err(MessengerError::Timeout)
        }
    }

    fn test(&mut self, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::SentSettled => self.sent_settled(),
            Predicate::MessageAvailable => self.message_available(),
            Predicate::AllClosed => self
                .driver
                .as_ref()
                .map_or(true, |d| !d.has_connectors()),
        }
    }

    fn sent_settled(&mut self) -> bool {
        let connectors = match self.driver.as_ref() {
            Some(driver) => driver.connectors(),
            None => Vec::new(),
        };
        for connector in &connectors {
            let connection = connector.borrow().connection();
            for link in connection.borrow().links_in(StateSet::ACTIVE, StateSet::ANY) {
                let l = link.borrow();
                if l.is_sender() && l.queued() > 0 {
                    return false;
                }
            }
        }
        for delivery in self.outgoing.deliveries() {
            let (resolved, settled) = {
                let d = delivery.borrow();
                (
                    d.remote_state().is_some() || d.is_remotely_settled(),
                    d.is_locally_settled(),
                )
            };
            if settled {
                continue;
            }
            if resolved {
                delivery.borrow_mut().settle();
                continue;
            }
            if delivery_connection_closed(&delivery) {
                continue;
            }
            return false;
        }
        true
    }

    fn message_available(&self) -> bool {
        let Some(driver) = self.driver.as_ref() else {
            return false;
        };
        for connector in driver.connectors() {
            let connection = connector.borrow().connection();
            for delivery in connection.borrow().work_deliveries() {
                let d = delivery.borrow();
                if d.is_readable() && !d.is_partial() {
                    return true;
                }
            }
        }
        false
    }
}

/// Whether the delivery's connection is remotely closed or already gone.
fn delivery_connection_closed(delivery: &Rc<RefCell<Delivery>>) -> bool {
    let Some(link) = delivery.borrow().link() else {
        return true;
    };
    let Some(session) = link.borrow().session() else {
        return true;
    };
    let Some(connection) = session.borrow().connection() else {
        return true;
    };
    let closed = connection.borrow().remote_state() == EndpointState::Closed;
    closed
}
