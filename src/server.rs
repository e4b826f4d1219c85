//! The event loop: one thread multiplexing the listener and every live
//! connection with `poll(2)`, plus the end-of-tick timer sweep that evicts
//! idle connections and expired keys.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::Conn;
use crate::db::Db;
use crate::error::{Result, ServerError};
use crate::list::IdleList;

pub struct Server {
    listener: Socket,
    /// Live connections, indexed by file descriptor.
    conns: Vec<Option<Conn>>,
    /// Connections ordered by last activity; the head expires first.
    idle: IdleList,
    db: Db,
    idle_timeout_ms: u64,
    started: Instant,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        let addr = config.listen_addr()?;
        listener.bind(&SockAddr::from(addr))?;
        listener.set_nonblocking(true)?;
        listener.listen(libc::SOMAXCONN)?;
        info!(%addr, "listening");
        Ok(Self {
            listener,
            conns: Vec::new(),
            idle: IdleList::new(),
            db: Db::new(),
            idle_timeout_ms: config.idle_timeout_ms,
            started: Instant::now(),
        })
    }

    /// The address actually bound; differs from the configured one when an
    /// ephemeral port was requested.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| ServerError::Config("listener has no inet address".to_string()))
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            self.tick()?;
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn tick(&mut self) -> Result<()> {
        // readiness set: listener + every live connection's interest mask
        let mut pollfds = Vec::with_capacity(self.conns.len() + 1);
        let mut fds: Vec<RawFd> = Vec::with_capacity(self.conns.len() + 1);
        pollfds.push(PollFd::new(self.listener.as_raw_fd(), PollFlags::POLLIN));
        fds.push(self.listener.as_raw_fd());
        for (fd, conn) in self.conns.iter().enumerate() {
            if let Some(conn) = conn {
                pollfds.push(PollFd::new(fd as RawFd, conn.poll_events()));
                fds.push(fd as RawFd);
            }
        }

        match poll(&mut pollfds, self.next_timer_ms()) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => {
                return Err(ServerError::Io(io::Error::from_raw_os_error(e as i32)));
            }
        }
        let now_ms = self.now_ms();

        let ready: Vec<(RawFd, PollFlags)> = fds
            .iter()
            .zip(pollfds.iter())
            .filter_map(|(&fd, pollfd)| {
                let revents = pollfd.revents().unwrap_or_else(PollFlags::empty);
                (!revents.is_empty()).then_some((fd, revents))
            })
            .collect();

        for (fd, revents) in ready {
            if fd == self.listener.as_raw_fd() {
                if revents.contains(PollFlags::POLLIN) {
                    self.accept(now_ms)?;
                }
                continue;
            }
            let Some(slot) = self.conns.get_mut(fd as usize) else {
                continue;
            };
            let Some(conn) = slot.as_mut() else {
                continue;
            };
            // any readiness counts as activity
            conn.last_active_ms = now_ms;
            self.idle.move_to_back(fd as u32);

            if revents.contains(PollFlags::POLLIN) && conn.want_read {
                conn.on_readable(&mut self.db, now_ms);
            }
            if revents.contains(PollFlags::POLLOUT) && conn.want_write {
                conn.on_writable();
            }
            if conn.want_close || revents.contains(PollFlags::POLLERR) {
                self.destroy(fd);
            }
        }

        self.sweep_timers(now_ms);
        Ok(())
    }

    fn accept(&mut self, now_ms: u64) -> Result<()> {
        let (sock, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                warn!(error = %e, "accept failed");
                return Ok(());
            }
        };
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        info!(fd, peer = ?peer.as_socket(), "client connected");
        if fd as usize >= self.conns.len() {
            self.conns.resize_with(fd as usize + 1, || None);
        }
        self.conns[fd as usize] = Some(Conn::new(sock, now_ms));
        self.idle.push_back(fd as u32);
        Ok(())
    }

    fn destroy(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.get_mut(fd as usize).and_then(|slot| slot.take()) {
            self.idle.detach(fd as u32);
            debug!(fd, "connection destroyed");
            drop(conn); // closes the socket
        }
    }

    /// Milliseconds until the next timer fires: -1 when there is none, 0
    /// when one is already due.
    fn next_timer_ms(&self) -> i32 {
        let now_ms = self.now_ms();
        let mut next_ms = u64::MAX;
        if let Some(fd) = self.idle.front() {
            if let Some(conn) = self.conns.get(fd as usize).and_then(|c| c.as_ref()) {
                next_ms = conn.last_active_ms + self.idle_timeout_ms;
            }
        }
        if let Some(at_ms) = self.db.next_expiry_ms() {
            next_ms = next_ms.min(at_ms);
        }
        if next_ms == u64::MAX {
            -1
        } else {
            next_ms.saturating_sub(now_ms).min(i32::MAX as u64) as i32
        }
    }

    fn sweep_timers(&mut self, now_ms: u64) {
        while let Some(fd) = self.idle.front() {
            let Some(conn) = self.conns.get(fd as usize).and_then(|c| c.as_ref()) else {
                self.idle.detach(fd);
                continue;
            };
            if conn.last_active_ms + self.idle_timeout_ms > now_ms {
                break;
            }
            info!(fd, "idle timeout");
            self.destroy(fd as RawFd);
        }
        self.db.expire_keys(now_ms);
    }
}
