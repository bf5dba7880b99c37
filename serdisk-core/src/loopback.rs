//! In-process serial link.
//!
//! Joins a driver directly to a `Server` without a device, the way a
//! headless console stands in for a terminal: bytes written by the driver
//! are parsed into frames and dispatched, response frames are queued for
//! the driver to read. `pause` makes the server stop answering so that
//! timeout and recovery behavior can be exercised.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};

use crate::error::RemoteError;
use crate::proto::PAYLOAD_MAX;
use crate::server::Server;
use crate::transport::{recv_frame, send_frame, SerialLink};

/// Driver-to-server link running both endpoints in one process.
pub struct LoopbackLink {
    server: Server,
    paused: bool,
    /// Response bytes waiting for the driver.
    inbound: VecDeque<u8>,
    /// Driver bytes not yet parsed into a frame.
    pending: Vec<u8>,
    exchanges: usize,
    bytes_from_driver: usize,
}

impl LoopbackLink {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            paused: false,
            inbound: VecDeque::new(),
            pending: Vec::new(),
            exchanges: 0,
            bytes_from_driver: 0,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    /// Stop answering requests; reads time out until `resume`.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Requests the server has executed.
    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    /// Raw bytes the driver has written, sync floods included.
    pub fn bytes_from_driver(&self) -> usize {
        self.bytes_from_driver
    }

    /// Parse and execute every complete frame in the pending buffer.
    fn pump(&mut self) {
        loop {
            let (parsed, consumed) = {
                let mut cur = Cursor::new(self.pending.as_slice());
                let mut buf = [0u8; PAYLOAD_MAX];
                let parsed = recv_frame(&mut cur, &mut buf).map(|n| buf[..n].to_vec());
                (parsed, cur.position() as usize)
            };
            match parsed {
                Ok(payload) => {
                    self.pending.drain(..consumed);
                    self.exchanges += 1;
                    let mut out = Vec::new();
                    if self.server.handle(&payload, &mut out) {
                        let mut framed = Vec::new();
                        if send_frame(&mut framed, &out).is_ok() {
                            self.inbound.extend(framed);
                        }
                    }
                }
                Err(RemoteError::LostSync) | Err(RemoteError::FrameTooLarge(_)) => {
                    // The server drops bad frames and rescans.
                    self.pending.drain(..consumed.min(self.pending.len()));
                }
                Err(_) => break, // incomplete frame: wait for more bytes
            }
        }
    }
}

impl Read for LoopbackLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.inbound.is_empty() {
            if self.paused {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "server paused"));
            }
            self.pump();
        }
        if self.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for LoopbackLink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.bytes_from_driver += data.len();
        self.pending.extend_from_slice(data);
        if !self.paused {
            self.pump();
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for LoopbackLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.inbound.clear();
        Ok(())
    }
}
