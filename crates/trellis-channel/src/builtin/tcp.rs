//! Framed stream transport over unix or inet sockets.
//!
//! `tcp://./path` selects a unix socket, `tcp://host:port` an inet one.
//! `mode=server` (selected by init replacement) listens through a child
//! *socket* channel; every accepted connection becomes another child whose
//! address token routes replies:
//!
//! ```text
//! tcp://./s.sock;mode=server;name=srv
//!   ├── srv/socket          (listening fd, accepts)
//!   ├── srv/0               (connection, addr = 0)
//!   └── srv/1               (connection, addr = 1)
//! ```
//!
//! Connection children emit upward through the server channel, so one
//! subscription on the server observes all client traffic; posting on the
//! server with a message's `addr` replies to that client. Wire format is a
//! fixed 16-byte little-endian frame (size u32, msgid i32, seq i64) before
//! each payload.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use trellis_types::{Addr, Caps, DCaps, Error, Msg, OwnedMsg, Result, State, Url};

use crate::channel::{ChannelRef, ChannelWeak};
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `tcp://<addr>;mode=client|server` — framed stream transport.
pub static TCP_IMPL: Impl = Impl {
    name: "tcp",
    new_data: || Box::new(TcpClient::default()),
};

/// Server side of `tcp://`, selected by init replacement.
pub static TCP_SERVER_IMPL: Impl = Impl {
    name: "tcp-server",
    new_data: || Box::new(TcpServer::default()),
};

static TCP_SOCKET_IMPL: Impl = Impl {
    name: "tcp-socket",
    new_data: || Box::new(TcpSocket::default()),
};

static TCP_CONN_IMPL: Impl = Impl {
    name: "tcp-conn",
    new_data: || Box::new(TcpConn::default()),
};

const FRAME_SIZE: usize = 16;
const POLL_DCAPS: DCaps = DCaps::POLLIN.union(DCaps::PROCESS);

fn frame_encode(msg: &Msg<'_>) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0..4].copy_from_slice(&(msg.data.len() as u32).to_le_bytes());
    frame[4..8].copy_from_slice(&msg.msgid.to_le_bytes());
    frame[8..16].copy_from_slice(&msg.seq.to_le_bytes());
    frame
}

fn frame_decode(frame: &[u8]) -> (usize, i32, i64) {
    let size = u32::from_le_bytes(frame[0..4].try_into().expect("frame size")) as usize;
    let msgid = i32::from_le_bytes(frame[4..8].try_into().expect("frame msgid"));
    let seq = i64::from_le_bytes(frame[8..16].try_into().expect("frame seq"));
    (size, msgid, seq)
}

enum Stream {
    Unix(UnixStream),
    Inet(TcpStream),
}

impl Stream {
    fn fd(&self) -> RawFd {
        match self {
            Self::Unix(s) => s.as_raw_fd(),
            Self::Inet(s) => s.as_raw_fd(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Inet(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Inet(s) => s.write(buf),
        }
    }
}

enum ReadOutcome {
    Msg(OwnedMsg),
    Empty,
    Eof,
}

/// One framed connection: stream plus read/write buffering.
struct Link {
    stream: Stream,
    rx: Vec<u8>,
    tx: Vec<u8>,
}

impl Link {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            rx: Vec::new(),
            tx: Vec::new(),
        }
    }

    fn parse(&mut self) -> Option<OwnedMsg> {
        if self.rx.len() < FRAME_SIZE {
            return None;
        }
        let (size, msgid, seq) = frame_decode(&self.rx[..FRAME_SIZE]);
        if self.rx.len() < FRAME_SIZE + size {
            return None;
        }
        let data = self.rx[FRAME_SIZE..FRAME_SIZE + size].to_vec();
        self.rx.drain(..FRAME_SIZE + size);
        Some(OwnedMsg {
            msgid,
            seq,
            data,
            ..Default::default()
        })
    }

    fn read_step(&mut self) -> Result<ReadOutcome> {
        loop {
            if let Some(msg) = self.parse() {
                return Ok(ReadOutcome::Msg(msg));
            }
            let mut buf = [0u8; 4096];
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => self.rx.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Empty),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::invalid(format!("read failed: {e}"))),
            }
        }
    }

    /// Returns `true` when the tx buffer is fully flushed.
    fn flush(&mut self) -> Result<bool> {
        while !self.tx.is_empty() {
            match self.stream.write(&self.tx) {
                Ok(0) => return Err(Error::invalid("peer closed while writing")),
                Ok(n) => {
                    self.tx.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::invalid(format!("write failed: {e}"))),
            }
        }
        Ok(true)
    }

    fn send(&mut self, msg: &Msg<'_>) -> Result<bool> {
        self.tx.extend_from_slice(&frame_encode(msg));
        self.tx.extend_from_slice(msg.data);
        self.flush()
    }
}

enum Host {
    Unix(String),
    Inet(String),
}

fn parse_host(host: &str) -> Result<Host> {
    if host.is_empty() {
        return Err(Error::invalid("tcp url has no host"));
    }
    if host.starts_with('.') || host.contains('/') {
        Ok(Host::Unix(host.to_string()))
    } else if host.contains(':') {
        Ok(Host::Inet(host.to_string()))
    } else {
        Err(Error::invalid(format!("invalid tcp host '{host}'")))
    }
}

struct ServerShared {
    conns: Mutex<HashMap<i64, ChannelWeak>>,
    next_addr: AtomicI64,
}

// === Client ===

#[derive(Default)]
pub(crate) struct TcpClient {
    host: Option<Host>,
    link: Option<Link>,
}

impl ChannelData for TcpClient {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        match url.get("mode") {
            None | Some("client") => {}
            Some("server") => return Ok(InitResult::Replace(&TCP_SERVER_IMPL)),
            Some(other) => return Err(Error::invalid(format!("invalid mode '{other}'"))),
        }
        self.host = Some(parse_host(url.host())?);
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| Error::invalid("client has no host"))?;
        let stream = match host {
            Host::Unix(path) => {
                let s = UnixStream::connect(path)
                    .map_err(|e| Error::invalid(format!("connect '{path}' failed: {e}")))?;
                s.set_nonblocking(true)
                    .map_err(|e| Error::invalid(format!("set_nonblocking failed: {e}")))?;
                Stream::Unix(s)
            }
            Host::Inet(addr) => {
                let s = TcpStream::connect(addr)
                    .map_err(|e| Error::invalid(format!("connect '{addr}' failed: {e}")))?;
                s.set_nonblocking(true)
                    .map_err(|e| Error::invalid(format!("set_nonblocking failed: {e}")))?;
                Stream::Inet(s)
            }
        };
        base.fd_set(Some(stream.fd()));
        self.link = Some(Link::new(stream));
        base.update_dcaps(POLL_DCAPS, POLL_DCAPS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        self.link = None;
        base.update_dcaps(DCaps::empty(), POLL_DCAPS | DCaps::POLLOUT);
        base.fd_set(None);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let link = self.link.as_mut().ok_or(Error::Again)?;
        if link.flush()? {
            base.update_dcaps(DCaps::empty(), DCaps::POLLOUT);
        }
        match link.read_step()? {
            ReadOutcome::Msg(msg) => {
                base.callback_data(&msg.view());
                Ok(())
            }
            ReadOutcome::Empty => Err(Error::Again),
            ReadOutcome::Eof => {
                debug!(channel = %base.name(), "peer disconnected");
                self.link = None;
                base.update_dcaps(DCaps::empty(), POLL_DCAPS | DCaps::POLLOUT);
                base.fd_set(None);
                base.state_set(State::Closing);
                base.state_set(State::Closed);
                Ok(())
            }
        }
    }

    fn post(&mut self, base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        if base.state() != State::Active {
            return Err(Error::invalid("channel is not active"));
        }
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| Error::invalid("channel is not connected"))?;
        if !link.send(msg)? {
            base.update_dcaps(DCaps::POLLOUT, DCaps::POLLOUT);
        }
        Ok(())
    }
}

// === Server ===

pub(crate) struct TcpServer {
    host: Option<Host>,
    shared: Arc<ServerShared>,
}

impl Default for TcpServer {
    fn default() -> Self {
        Self {
            host: None,
            shared: Arc::new(ServerShared::default()),
        }
    }
}

impl ChannelData for TcpServer {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        self.host = Some(parse_host(url.host())?);
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| Error::invalid("server has no host"))?;
        let listener = match host {
            Host::Unix(path) => {
                let l = UnixListener::bind(path)
                    .map_err(|e| Error::invalid(format!("bind '{path}' failed: {e}")))?;
                l.set_nonblocking(true)
                    .map_err(|e| Error::invalid(format!("set_nonblocking failed: {e}")))?;
                Listener::Unix(l, path.clone())
            }
            Host::Inet(addr) => {
                let l = TcpListener::bind(addr)
                    .map_err(|e| Error::invalid(format!("bind '{addr}' failed: {e}")))?;
                l.set_nonblocking(true)
                    .map_err(|e| Error::invalid(format!("set_nonblocking failed: {e}")))?;
                Listener::Inet(l)
            }
        };
        self.shared.next_addr.store(0, Ordering::Relaxed);
        self.shared.conns.lock().clear();

        let ctx = base.context();
        let url = Url::parse(&format!(
            "tcp-socket://;name={}/socket;tll.internal=yes",
            base.name()
        ))?;
        let socket = ctx.new_channel_with(
            url,
            None,
            &TCP_SOCKET_IMPL,
            Box::new(TcpSocket {
                listener: Some(listener),
                parent: Some(base.downgrade()),
                shared: self.shared.clone(),
            }),
        )?;
        socket.open("")?;
        base.child_add(socket);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        for child in base.children() {
            let _ = base.child_del(&child);
        }
        self.shared.conns.lock().clear();
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, _base: &ChannelRef) -> Result<()> {
        Err(Error::Again)
    }

    /// Replies route by the message's address token.
    fn post(&mut self, _base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let conn = self
            .shared
            .conns
            .lock()
            .get(&msg.addr.0)
            .and_then(ChannelWeak::upgrade)
            .ok_or_else(|| Error::NotFound(format!("address {}", msg.addr.0)))?;
        conn.post(msg)
    }
}

// === Listening socket child ===

enum Listener {
    Unix(UnixListener, String),
    Inet(TcpListener),
}

impl Listener {
    fn fd(&self) -> RawFd {
        match self {
            Self::Unix(l, _) => l.as_raw_fd(),
            Self::Inet(l) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> std::io::Result<Stream> {
        match self {
            Self::Unix(l, _) => {
                let (s, _) = l.accept()?;
                s.set_nonblocking(true)?;
                Ok(Stream::Unix(s))
            }
            Self::Inet(l) => {
                let (s, _) = l.accept()?;
                s.set_nonblocking(true)?;
                Ok(Stream::Inet(s))
            }
        }
    }
}

#[derive(Default)]
struct TcpSocket {
    listener: Option<Listener>,
    parent: Option<ChannelWeak>,
    shared: Arc<ServerShared>,
}

impl Default for ServerShared {
    fn default() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_addr: AtomicI64::new(0),
        }
    }
}

impl ChannelData for TcpSocket {
    fn init(
        &mut self,
        _base: &ChannelRef,
        _url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::invalid("socket channel has no listener"))?;
        base.fd_set(Some(listener.fd()));
        base.update_dcaps(POLL_DCAPS, POLL_DCAPS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        if let Some(Listener::Unix(_, path)) = self.listener.take() {
            let _ = std::fs::remove_file(path);
        }
        base.update_dcaps(DCaps::empty(), POLL_DCAPS);
        base.fd_set(None);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let listener = self.listener.as_ref().ok_or(Error::Again)?;
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(Error::Again),
            Err(e) => return Err(Error::invalid(format!("accept failed: {e}"))),
        };
        let parent = self
            .parent
            .as_ref()
            .and_then(ChannelWeak::upgrade)
            .ok_or_else(|| Error::invalid("server is gone"))?;
        let addr = self.shared.next_addr.fetch_add(1, Ordering::Relaxed);
        debug!(server = %parent.name(), addr, "accepted connection");

        let ctx = parent.context();
        let url = Url::parse(&format!(
            "tcp-conn://;name={}/{addr};tll.internal=yes",
            parent.name()
        ))?;
        let conn = ctx.new_channel_with(
            url,
            None,
            &TCP_CONN_IMPL,
            Box::new(TcpConn {
                link: Some(Link::new(stream)),
                addr,
                parent: Some(parent.downgrade()),
                shared: Some(self.shared.clone()),
            }),
        )?;
        conn.open("")?;
        self.shared.conns.lock().insert(addr, conn.downgrade());
        parent.child_add(conn);
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, _msg: &Msg<'_>) -> Result<()> {
        Err(Error::invalid("listening socket does not accept posts"))
    }
}

// === Accepted connection child ===

#[derive(Default)]
struct TcpConn {
    link: Option<Link>,
    addr: i64,
    parent: Option<ChannelWeak>,
    shared: Option<Arc<ServerShared>>,
}

impl ChannelData for TcpConn {
    fn init(
        &mut self,
        _base: &ChannelRef,
        _url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::invalid("connection channel has no stream"))?;
        base.fd_set(Some(link.stream.fd()));
        base.update_dcaps(POLL_DCAPS, POLL_DCAPS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        if let Some(shared) = self.shared.as_ref() {
            shared.conns.lock().remove(&self.addr);
        }
        self.link = None;
        base.update_dcaps(DCaps::empty(), POLL_DCAPS | DCaps::POLLOUT);
        base.fd_set(None);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let link = self.link.as_mut().ok_or(Error::Again)?;
        if link.flush()? {
            base.update_dcaps(DCaps::empty(), DCaps::POLLOUT);
        }
        match link.read_step()? {
            ReadOutcome::Msg(mut msg) => {
                msg.addr = Addr(self.addr);
                // connection traffic surfaces on the server channel
                if let Some(parent) = self.parent.as_ref().and_then(ChannelWeak::upgrade) {
                    parent.callback_data(&msg.view());
                } else {
                    base.callback_data(&msg.view());
                }
                Ok(())
            }
            ReadOutcome::Empty => Err(Error::Again),
            ReadOutcome::Eof => {
                debug!(channel = %base.name(), "client disconnected");
                if let Some(shared) = self.shared.as_ref() {
                    shared.conns.lock().remove(&self.addr);
                }
                self.link = None;
                base.update_dcaps(DCaps::empty(), POLL_DCAPS | DCaps::POLLOUT);
                base.fd_set(None);
                base.state_set(State::Closing);
                base.state_set(State::Closed);
                Ok(())
            }
        }
    }

    fn post(&mut self, base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| Error::invalid("connection is closed"))?;
        if !link.send(msg)? {
            base.update_dcaps(DCaps::POLLOUT, DCaps::POLLOUT);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let msg = Msg {
            msgid: 7,
            seq: 1234,
            data: b"xxx",
            ..Msg::data(1234, b"xxx")
        };
        let frame = frame_encode(&msg);
        let (size, msgid, seq) = frame_decode(&frame);
        assert_eq!(size, 3);
        assert_eq!(msgid, 7);
        assert_eq!(seq, 1234);
    }

    #[test]
    fn host_classification() {
        assert!(matches!(parse_host("./s.sock"), Ok(Host::Unix(_))));
        assert!(matches!(parse_host("/tmp/s.sock"), Ok(Host::Unix(_))));
        assert!(matches!(parse_host("127.0.0.1:8080"), Ok(Host::Inet(_))));
        assert!(parse_host("").is_err());
        assert!(parse_host("plainhost").is_err());
    }

    #[test]
    fn mode_server_replaces_impl() {
        let ctx = Context::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let server = ctx
            .new_channel(&format!("tcp://{};mode=server;name=ts", path.display()))
            .unwrap();
        assert!(Impl::same(server.impl_ref(), &TCP_SERVER_IMPL));
    }
}
