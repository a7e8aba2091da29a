//! The socket pump.
//!
//! The driver owns every socket: outbound connectors, accepted
//! connections, and listening sockets. All blocking is funnelled through
//! [`Driver::do_wait`], a readiness race across every registered socket
//! bounded by a deadline. Everything else is non-blocking:
//! [`Connector::process`] uses `try_read`/`try_write` exclusively.
//!
//! The driver owns a current-thread tokio runtime and never spawns a
//! task; `block_on` is confined to `do_wait`, socket setup, and the
//! bounded lazy connect. The messenger that owns the driver therefore
//! stays a strictly single-owner, cooperative system.

mod connector;
mod listener;

pub use connector::Connector;
pub use listener::Listener;

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use futures::future::select_all;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::engine::Connection;

/// Nap length when there is nothing to wait on.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Registry of sockets plus the readiness wait.
pub struct Driver {
    runtime: Rc<Runtime>,
    connectors: Vec<Rc<RefCell<Connector>>>,
    listeners: Vec<Rc<RefCell<Listener>>>,
    connect_timeout: Duration,
}

impl Driver {
    /// Create a driver with the given connect timeout for outbound
    /// connectors.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying runtime cannot be built.
    pub fn new(connect_timeout: Duration) -> io::Result<Driver> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Driver {
            runtime: Rc::new(runtime),
            connectors: Vec::new(),
            listeners: Vec::new(),
            connect_timeout,
        })
    }

    /// Register an outbound connector toward `host:port` pumping
    /// `connection`. No I/O happens until the first `process` call.
    pub fn create_connector(
        &mut self,
        host: &str,
        port: u16,
        connection: Rc<RefCell<Connection>>,
    ) -> Rc<RefCell<Connector>> {
        let target = format!("{}:{}", host, port);
        debug!(%target, "creating connector");
        let connector = Rc::new(RefCell::new(Connector::outbound(
            self.runtime.clone(),
            target,
            connection,
            self.connect_timeout,
        )));
        self.connectors.push(connector.clone());
        connector
    }

    /// Register a connector for an accepted socket.
    pub fn adopt_incoming(
        &mut self,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        connection: Rc<RefCell<Connection>>,
    ) -> Rc<RefCell<Connector>> {
        debug!(%peer, "adopting incoming connection");
        let connector = Rc::new(RefCell::new(Connector::incoming(
            self.runtime.clone(),
            peer.to_string(),
            connection,
            stream,
        )));
        self.connectors.push(connector.clone());
        connector
    }

    /// Bind a listener on `host:port`.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub fn create_listener(&mut self, host: &str, port: u16) -> io::Result<Rc<RefCell<Listener>>> {
        let listener = Rc::new(RefCell::new(Listener::bind(
            self.runtime.clone(),
            host,
            port,
        )?));
        self.listeners.push(listener.clone());
        Ok(listener)
    }

    /// Snapshot of the registered connectors.
    pub fn connectors(&self) -> Vec<Rc<RefCell<Connector>>> {
        self.connectors.clone()
    }

    /// Snapshot of the registered listeners.
    pub fn listeners(&self) -> Vec<Rc<RefCell<Listener>>> {
        self.listeners.clone()
    }

    /// Whether any connector remains registered.
    pub fn has_connectors(&self) -> bool {
        !self.connectors.is_empty()
    }

    /// Remove a closed connector from the registry.
    pub fn destroy_connector(&mut self, connector: &Rc<RefCell<Connector>>) {
        self.connectors.retain(|c| !Rc::ptr_eq(c, connector));
    }

    /// Block until any registered socket is ready, any listener accepts,
    /// or the timeout elapses. `None` waits indefinitely. Returns
    /// immediately when a connector has work that needs no readiness
    /// (a pending lazy connect).
    pub fn do_wait(&mut self, timeout: Option<Duration>) {
        if self
            .connectors
            .iter()
            .any(|c| c.borrow().needs_connect())
        {
            return;
        }

        let mut futures: Vec<Pin<Box<dyn Future<Output = ()>>>> = Vec::new();

        for connector in &self.connectors {
            let c = connector.borrow();
            if c.is_closed() || c.stream_ref().is_none() {
                continue;
            }
            // A drained socket is always "readable"; re-arming it would
            // turn the wait into a spin.
            if c.is_eof() && !c.has_pending_output() {
                continue;
            }
            let interest = if c.has_pending_output() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            drop(c);
            let rc = connector.clone();
            futures.push(Box::pin(async move {
                let guard = rc.borrow();
                if let Some(stream) = guard.stream_ref() {
                    let _ = stream.ready(interest).await;
                }
            }));
        }

        for listener in &self.listeners {
            if listener.borrow().is_closed() {
                continue;
            }
            let rc = listener.clone();
            futures.push(Box::pin(async move {
                let guard = rc.borrow();
                let accepted = match guard.socket() {
                    Some(socket) => socket.accept().await.ok(),
                    None => return,
                };
                drop(guard);
                if let Some((stream, peer)) = accepted {
                    rc.borrow_mut().stash(stream, peer);
                }
            }));
        }

        if futures.is_empty() {
            let nap = timeout.unwrap_or(IDLE_WAIT).min(IDLE_WAIT);
            self.runtime.block_on(async { tokio::time::sleep(nap).await });
            return;
        }

        let race = select_all(futures);
        match timeout {
            Some(deadline) => {
                let _ = self
                    .runtime
                    .block_on(async { tokio::time::timeout(deadline, race).await });
            }
            None => {
                self.runtime.block_on(race);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_do_wait_honors_timeout_with_no_sockets() {
        let mut driver = Driver::new(Duration::from_secs(1)).expect("driver");
        let started = Instant::now();
        driver.do_wait(Some(Duration::from_millis(20)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_do_wait_returns_immediately_for_pending_connect() {
        let mut driver = Driver::new(Duration::from_secs(1)).expect("driver");
        let connection = Connection::create("test");
        let _connector = driver.create_connector("127.0.0.1", 1, connection);

        let started = Instant::now();
        driver.do_wait(None);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_destroy_connector_removes_it() {
        let mut driver = Driver::new(Duration::from_secs(1)).expect("driver");
        let connection = Connection::create("test");
        let connector = driver.create_connector("127.0.0.1", 1, connection);
        assert!(driver.has_connectors());

        driver.destroy_connector(&connector);
        assert!(!driver.has_connectors());
    }

    #[test]
    fn test_listener_binds_ephemeral_port() {
        let mut driver = Driver::new(Duration::from_secs(1)).expect("driver");
        let listener = driver.create_listener("127.0.0.1", 0).expect("bind");
        assert_ne!(listener.borrow().local_addr().port(), 0);
        assert!(listener.borrow_mut().try_accept().is_none());
    }
}
