//! Connectors: one socket pumping one engine connection.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::engine::Connection;
use crate::wire;

/// Bridges one engine [`Connection`] to one TCP socket.
///
/// Outbound connectors connect lazily: the TCP connect happens on the
/// first `process` call, bounded by the configured timeout, and a failure
/// degrades the connector toward close instead of surfacing to the caller.
pub struct Connector {
    runtime: Rc<Runtime>,
    target: String,
    connection: Rc<RefCell<Connection>>,
    stream: Option<TcpStream>,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    connect_timeout: Duration,
    connect_attempted: bool,
    eof: bool,
    closed: bool,
}

impl Connector {
    pub(super) fn outbound(
        runtime: Rc<Runtime>,
        target: String,
        connection: Rc<RefCell<Connection>>,
        connect_timeout: Duration,
    ) -> Connector {
        Connector {
            runtime,
            target,
            connection,
            stream: None,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            connect_timeout,
            connect_attempted: false,
            eof: false,
            closed: false,
        }
    }

    pub(super) fn incoming(
        runtime: Rc<Runtime>,
        target: String,
        connection: Rc<RefCell<Connection>>,
        stream: TcpStream,
    ) -> Connector {
        Connector {
            runtime,
            target,
            connection,
            stream: Some(stream),
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            connect_timeout: Duration::ZERO,
            connect_attempted: true,
            eof: false,
            closed: false,
        }
    }

    /// The engine connection this connector pumps.
    pub fn connection(&self) -> Rc<RefCell<Connection>> {
        self.connection.clone()
    }

    /// The `host:port` this connector is directed at.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the connector has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connector, dropping its socket.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream = None;
            debug!(peer = %self.target, "connector closed");
        }
    }

    fn fail(&mut self, context: &str, error: &io::Error) {
        warn!(peer = %self.target, %error, "{context}; degrading connector");
        self.stream = None;
        self.closed = true;
        self.connection.borrow_mut().remote_close_abrupt();
    }

    pub(super) fn needs_connect(&self) -> bool {
        !self.closed && self.stream.is_none() && !self.connect_attempted
    }

    pub(super) fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    pub(super) fn is_eof(&self) -> bool {
        self.eof
    }

    pub(super) fn stream_ref(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Pump the socket: read available bytes into the engine, flush engine
    /// output to the socket.
    ///
    /// # Errors
    ///
    /// Transport errors are returned for logging after the connector has
    /// already been degraded toward close; callers continue regardless.
    pub fn process(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }

        if self.stream.is_none() {
            if self.connect_attempted {
                return Ok(());
            }
            self.connect_attempted = true;
            let connect = TcpStream::connect(self.target.clone());
            let attempt = self
                .runtime
                .block_on(async { tokio::time::timeout(self.connect_timeout, connect).await });
            match attempt {
                Ok(Ok(stream)) => {
                    debug!(peer = %self.target, "connected");
                    self.stream = Some(stream);
                }
                Ok(Err(e)) => {
                    self.fail("connect failed", &e);
                    return Err(e);
                }
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                    self.fail("connect timed out", &e);
                    return Err(e);
                }
            }
        }

        self.read_pump()?;
        self.parse_frames()?;
        self.flush_output()?;
        Ok(())
    }

    fn read_pump(&mut self) -> io::Result<()> {
        if self.eof {
            return Ok(());
        }
        let mut hit_eof = false;
        let mut failure = None;
        {
            let Some(stream) = self.stream.as_ref() else {
                return Ok(());
            };
            let mut chunk = [0u8; 4096];
            loop {
                match stream.try_read(&mut chunk) {
                    Ok(0) => {
                        hit_eof = true;
                        break;
                    }
                    Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            self.fail("read failed", &e);
            return Err(e);
        }
        if hit_eof {
            self.eof = true;
            self.connection.borrow_mut().remote_close_abrupt();
        }
        Ok(())
    }

    fn parse_frames(&mut self) -> io::Result<()> {
        loop {
            match wire::try_deserialize_frame(&self.inbuf) {
                Ok(Some((frame, consumed))) => {
                    self.inbuf.drain(..consumed);
                    if let Err(e) = self.connection.borrow_mut().handle_frame(frame) {
                        warn!(peer = %self.target, error = %e, "peer protocol violation");
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    let e = io::Error::new(io::ErrorKind::InvalidData, e.to_string());
                    self.fail("wire format error", &e);
                    return Err(e);
                }
            }
        }
    }

    fn flush_output(&mut self) -> io::Result<()> {
        for frame in self.connection.borrow_mut().take_output() {
            match wire::serialize_frame(&frame) {
                Ok(packet) => self.outbuf.extend_from_slice(&packet),
                Err(e) => warn!(peer = %self.target, error = %e, "dropping unencodable frame"),
            }
        }

        let mut failure = None;
        {
            let Some(stream) = self.stream.as_ref() else {
                return Ok(());
            };
            while !self.outbuf.is_empty() {
                match stream.try_write(&self.outbuf) {
                    Ok(n) => {
                        self.outbuf.drain(..n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            self.fail("write failed", &e);
            return Err(e);
        }
        Ok(())
    }
}
