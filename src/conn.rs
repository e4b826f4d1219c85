//! Per-connection state: buffered non-blocking I/O and request pipelining.

use std::io::{self, Read, Write};

use nix::poll::PollFlags;
use socket2::Socket;
use tracing::{trace, warn};

use crate::buf::Buffer;
use crate::commands;
use crate::db::Db;
use crate::protocol::{self, K_MAX_MSG};

/// Upper bound on one non-blocking read.
const K_READ_CHUNK: usize = 64 * 1024;

pub struct Conn {
    sock: Socket,
    pub want_read: bool,
    pub want_write: bool,
    pub want_close: bool,
    incoming: Buffer,
    outgoing: Buffer,
    pub last_active_ms: u64,
}

impl Conn {
    pub fn new(sock: Socket, now_ms: u64) -> Self {
        Self {
            sock,
            want_read: true,
            want_write: false,
            want_close: false,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            last_active_ms: now_ms,
        }
    }

    /// Interest mask for the readiness wait.
    pub fn poll_events(&self) -> PollFlags {
        let mut events = PollFlags::POLLERR;
        if self.want_read {
            events |= PollFlags::POLLIN;
        }
        if self.want_write {
            events |= PollFlags::POLLOUT;
        }
        events
    }

    pub fn on_readable(&mut self, db: &mut Db, now_ms: u64) {
        let mut chunk = [0u8; K_READ_CHUNK];
        match self.sock.read(&mut chunk) {
            Ok(0) => {
                if !self.incoming.is_empty() {
                    warn!("client closed mid-frame");
                }
                self.want_close = true;
                return;
            }
            Ok(n) => self.incoming.append(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                warn!(error = %e, "read failed");
                self.want_close = true;
                return;
            }
        }

        // pipelining: handle every complete request already buffered
        while self.try_one_request(db, now_ms) {}

        if !self.outgoing.is_empty() {
            self.want_read = false;
            self.want_write = true;
            // the socket is almost certainly writable right now
            self.on_writable();
        }
    }

    pub fn on_writable(&mut self) {
        if self.outgoing.is_empty() {
            return;
        }
        match self.sock.write(self.outgoing.data()) {
            Ok(0) => self.want_close = true,
            Ok(n) => {
                self.outgoing.consume(n);
                if self.outgoing.is_empty() {
                    self.want_write = false;
                    self.want_read = true;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "write failed");
                self.want_close = true;
            }
        }
    }

    /// Frame, parse and execute one buffered request. Returns `false` when
    /// fewer than one complete request remains (or the connection is dying).
    fn try_one_request(&mut self, db: &mut Db, now_ms: u64) -> bool {
        if self.want_close || self.incoming.len() < 4 {
            return false;
        }
        let header: [u8; 4] = self.incoming.data()[..4].try_into().expect("4 bytes");
        let len = u32::from_le_bytes(header) as usize;
        if len > K_MAX_MSG {
            warn!(len, "request length over limit");
            self.want_close = true;
            return false;
        }
        if self.incoming.len() < 4 + len {
            return false;
        }
        let args = match protocol::parse_request(&self.incoming.data()[4..4 + len]) {
            Ok(args) => args,
            Err(e) => {
                warn!(error = %e, "malformed request");
                self.want_close = true;
                return false;
            }
        };
        trace!(nargs = args.len(), "request");
        let header_pos = protocol::response_begin(&mut self.outgoing);
        commands::dispatch(db, &args, &mut self.outgoing, now_ms);
        protocol::response_end(&mut self.outgoing, header_pos);
        self.incoming.consume(4 + len);
        true
    }
}
