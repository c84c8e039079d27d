//! Framed datagram transport.
//!
//! One datagram carries one message: the same 16-byte frame header as the
//! stream transport, followed by the payload. `mode=server` binds and maps
//! each peer address to a routing token so replies find their way back;
//! `mode=client` connects. `udp.multicast=yes` joins the group address on
//! open (the `mudp` alias pre-sets it).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use tracing::debug;

use trellis_types::{Addr, Caps, DCaps, Error, Msg, MsgType, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `udp://host:port;mode=client|server` — framed datagram transport.
pub static UDP_IMPL: Impl = Impl {
    name: "udp",
    new_data: || Box::new(Udp::default()),
};

const FRAME_SIZE: usize = 16;
const MAX_DATAGRAM: usize = 64 * 1024;
const POLL_DCAPS: DCaps = DCaps::POLLIN.union(DCaps::PROCESS);

#[derive(Default)]
pub(crate) struct Udp {
    host: String,
    server: bool,
    multicast: bool,
    socket: Option<UdpSocket>,
    /// Routing token to peer address, server mode only.
    peers: HashMap<i64, SocketAddr>,
    /// Reverse map so a peer keeps one token across datagrams.
    tokens: HashMap<SocketAddr, i64>,
    next_token: i64,
    buf: Vec<u8>,
}

impl Udp {
    fn token_for(&mut self, peer: SocketAddr) -> i64 {
        if let Some(token) = self.tokens.get(&peer) {
            return *token;
        }
        let token = self.next_token;
        self.next_token += 1;
        self.tokens.insert(peer, token);
        self.peers.insert(token, peer);
        token
    }
}

impl ChannelData for Udp {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        self.host = url.host().to_string();
        if self.host.is_empty() {
            return Err(Error::invalid("udp url has no host"));
        }
        self.server = match url.get("mode") {
            None | Some("client") => false,
            Some("server") => true,
            Some(other) => return Err(Error::invalid(format!("invalid mode '{other}'"))),
        };
        self.multicast = url.get_bool("udp.multicast", false)?;
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let socket = if self.server {
            UdpSocket::bind(&self.host)
                .map_err(|e| Error::invalid(format!("bind '{}' failed: {e}", self.host)))?
        } else {
            let s = UdpSocket::bind("0.0.0.0:0")
                .map_err(|e| Error::invalid(format!("bind failed: {e}")))?;
            s.connect(&self.host)
                .map_err(|e| Error::invalid(format!("connect '{}' failed: {e}", self.host)))?;
            s
        };
        if self.multicast {
            let group: SocketAddr = self
                .host
                .parse()
                .map_err(|_| Error::invalid(format!("invalid multicast group '{}'", self.host)))?;
            match group {
                SocketAddr::V4(v4) => {
                    socket
                        .join_multicast_v4(v4.ip(), &Ipv4Addr::UNSPECIFIED)
                        .map_err(|e| Error::invalid(format!("join multicast failed: {e}")))?;
                }
                SocketAddr::V6(v6) => {
                    socket
                        .join_multicast_v6(v6.ip(), 0)
                        .map_err(|e| Error::invalid(format!("join multicast failed: {e}")))?;
                }
            }
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::invalid(format!("set_nonblocking failed: {e}")))?;
        base.fd_set(Some(socket.as_raw_fd()));
        self.socket = Some(socket);
        self.buf = vec![0u8; MAX_DATAGRAM];
        self.peers.clear();
        self.tokens.clear();
        self.next_token = 0;
        base.update_dcaps(POLL_DCAPS, POLL_DCAPS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        self.socket = None;
        self.peers.clear();
        self.tokens.clear();
        base.update_dcaps(DCaps::empty(), POLL_DCAPS);
        base.fd_set(None);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::Again)?;
        let (len, peer) = loop {
            match socket.recv_from(&mut self.buf) {
                Ok(r) => break r,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(Error::Again),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::invalid(format!("recv failed: {e}"))),
            }
        };
        if len < FRAME_SIZE {
            debug!(channel = %base.name(), len, "runt datagram dropped");
            return Ok(());
        }
        let size = u32::from_le_bytes(self.buf[0..4].try_into().expect("frame")) as usize;
        let msgid = i32::from_le_bytes(self.buf[4..8].try_into().expect("frame"));
        let seq = i64::from_le_bytes(self.buf[8..16].try_into().expect("frame"));
        if FRAME_SIZE + size > len {
            debug!(channel = %base.name(), "truncated datagram dropped");
            return Ok(());
        }
        let addr = if self.server {
            Addr(self.token_for(peer))
        } else {
            Addr::default()
        };
        let data = &self.buf[FRAME_SIZE..FRAME_SIZE + size];
        let msg = Msg {
            type_: MsgType::Data,
            msgid,
            seq,
            data,
            addr,
            ..Default::default()
        };
        base.callback_data(&msg);
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::invalid("channel is not open"))?;
        let mut datagram = Vec::with_capacity(FRAME_SIZE + msg.data.len());
        datagram.extend_from_slice(&(msg.data.len() as u32).to_le_bytes());
        datagram.extend_from_slice(&msg.msgid.to_le_bytes());
        datagram.extend_from_slice(&msg.seq.to_le_bytes());
        datagram.extend_from_slice(msg.data);
        let r = if self.server {
            let peer = self
                .peers
                .get(&msg.addr.0)
                .ok_or_else(|| Error::NotFound(format!("address {}", msg.addr.0)))?;
            socket.send_to(&datagram, peer)
        } else {
            socket.send(&datagram)
        };
        match r {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::Again),
            Err(e) => Err(Error::invalid(format!("send failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{poll_for, MsgCollector};
    use trellis_types::MsgMask;

    #[test]
    fn datagram_round_trip() {
        let ctx = Context::default();
        let server = ctx
            .new_channel("udp://127.0.0.1:0;mode=server;name=us")
            .unwrap();
        server.open("").unwrap();
        // recover the ephemeral port the server landed on
        let port = local_port_of(&server);
        let client = ctx
            .new_channel(&format!("udp://127.0.0.1:{port};name=uc"))
            .unwrap();
        client.open("").unwrap();

        let on_server = MsgCollector::new();
        server.callback_add(&on_server.callback(), MsgMask::DATA);

        client.post(&Msg::data(9, b"datagram")).unwrap();
        poll_for(&server, std::time::Duration::from_secs(1)).unwrap();
        let msgs = on_server.msgs();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].seq, 9);
        assert_eq!(msgs[0].data, b"datagram");
    }

    fn local_port_of(server: &crate::channel::Channel) -> u16 {
        use std::os::fd::BorrowedFd;
        let fd = server.fd().expect("server has a socket");
        // SAFETY: the fd stays open for the duration of the call
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let dup = borrowed.try_clone_to_owned().expect("dup");
        UdpSocket::from(dup).local_addr().expect("local addr").port()
    }

    #[test]
    fn mudp_alias_presets_multicast() {
        let ctx = Context::default();
        let mut url = Url::parse("mudp://239.0.0.1:5000;name=mc").unwrap();
        let impl_ = ctx.lookup(&mut url).unwrap();
        assert!(Impl::same(impl_, &UDP_IMPL));
        assert_eq!(url.proto(), "udp");
        assert_eq!(url.get("udp.multicast"), Some("yes"));
    }
}
