//! Raw character device transport.
//!
//! Opens the device at the URL host (`serial:///dev/ttyUSB0;speed=115200`)
//! non-blocking in raw mode. Inbound bytes surface as DATA messages in read
//! chunks; posted payloads are written out verbatim. Framing, if any, is the
//! business of a prefix stacked on top.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::termios::{cfmakeraw, cfsetspeed, tcgetattr, tcsetattr, BaudRate, SetArg};

use trellis_types::{Caps, DCaps, Error, Msg, MsgType, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `serial://<device>;speed=<baud>` — raw character device.
pub static SERIAL_IMPL: Impl = Impl {
    name: "serial",
    new_data: || Box::new(Serial::default()),
};

const POLL_DCAPS: DCaps = DCaps::POLLIN.union(DCaps::PROCESS);

#[derive(Default)]
pub(crate) struct Serial {
    device: String,
    speed: u32,
    file: Option<File>,
    seq: i64,
}

fn baud_rate(speed: u32) -> Result<BaudRate> {
    let rate = match speed {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => return Err(Error::invalid(format!("unsupported speed {other}"))),
    };
    Ok(rate)
}

impl ChannelData for Serial {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        self.device = url.host().to_string();
        if self.device.is_empty() {
            return Err(Error::invalid("serial url has no device"));
        }
        self.speed = url.get_typed("speed", 9600u32)?;
        baud_rate(self.speed)?;
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_NOCTTY)
            .open(&self.device)
            .map_err(|e| Error::invalid(format!("open '{}' failed: {e}", self.device)))?;

        let mut termios = tcgetattr(&file)
            .map_err(|e| Error::invalid(format!("tcgetattr failed: {e}")))?;
        cfmakeraw(&mut termios);
        cfsetspeed(&mut termios, baud_rate(self.speed)?)
            .map_err(|e| Error::invalid(format!("cfsetspeed failed: {e}")))?;
        tcsetattr(&file, SetArg::TCSANOW, &termios)
            .map_err(|e| Error::invalid(format!("tcsetattr failed: {e}")))?;

        base.fd_set(Some(file.as_raw_fd()));
        self.file = Some(file);
        self.seq = 0;
        base.update_dcaps(POLL_DCAPS, POLL_DCAPS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        self.file = None;
        base.update_dcaps(DCaps::empty(), POLL_DCAPS);
        base.fd_set(None);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::Again)?;
        let mut buf = [0u8; 4096];
        let n = loop {
            match file.read(&mut buf) {
                Ok(0) => return Err(Error::Again),
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(Error::Again),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::invalid(format!("read failed: {e}"))),
            }
        };
        let msg = Msg {
            type_: MsgType::Data,
            seq: self.seq,
            data: &buf[..n],
            ..Default::default()
        };
        self.seq += 1;
        base.callback_data(&msg);
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::invalid("device is not open"))?;
        match file.write(msg.data) {
            Ok(n) if n == msg.data.len() => Ok(()),
            Ok(_) => Err(Error::Again),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::Again),
            Err(e) => Err(Error::invalid(format!("write failed: {e}"))),
        }
    }
}
