//! Listeners: accept incoming connections for the driver.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::debug;

/// A bound listening socket.
///
/// `do_wait` races the accept alongside connector readiness and stashes
/// any accepted connection here; `try_accept` hands stashed (or
/// immediately available) connections to the processor.
pub struct Listener {
    runtime: Rc<Runtime>,
    inner: Option<TcpListener>,
    pending: VecDeque<(TcpStream, SocketAddr)>,
    local_addr: SocketAddr,
}

impl Listener {
    pub(super) fn bind(runtime: Rc<Runtime>, host: &str, port: u16) -> io::Result<Listener> {
        let inner = runtime.block_on(TcpListener::bind((host, port)))?;
        let local_addr = inner.local_addr()?;
        debug!(%local_addr, "listener bound");
        Ok(Listener {
            runtime,
            inner: Some(inner),
            pending: VecDeque::new(),
            local_addr,
        })
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take one accepted connection, if any is ready.
    pub fn try_accept(&mut self) -> Option<(TcpStream, SocketAddr)> {
        if let Some(accepted) = self.pending.pop_front() {
            return Some(accepted);
        }
        let inner = self.inner.as_ref()?;
        let _guard = self.runtime.enter();
        match inner.accept().now_or_never() {
            Some(Ok(accepted)) => Some(accepted),
            Some(Err(_)) | None => None,
        }
    }

    pub(super) fn stash(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.pending.push_back((stream, peer));
    }

    pub(super) fn socket(&self) -> Option<&TcpListener> {
        self.inner.as_ref()
    }

    /// Stop accepting and drop the socket. Already-stashed connections are
    /// discarded.
    pub fn close(&mut self) {
        self.inner = None;
        self.pending.clear();
        debug!(local_addr = %self.local_addr, "listener closed");
    }

    /// Whether the listener has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}
