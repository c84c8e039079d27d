//! Cross-thread client/server messaging.
//!
//! One server channel fans in any number of clients, each usually living on
//! another thread's loop. Every client owns a pair of lock-free queues (one
//! per direction); the server additionally keeps a bounded *marker* queue of
//! client-queue handles. A post pushes a marker, then the message, then arms
//! the consumer's notify fd — so the server observes at least one message
//! per non-empty queue, and a short spin on the consumer side covers the
//! window between the marker and the message becoming visible.
//!
//! Replies route by the address the server saw on the incoming message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;

use trellis_types::{Addr, Caps, DCaps, Error, Msg, OwnedMsg, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::event::{Notifier, Notify};
use crate::implement::{ChannelData, Impl, InitResult};

/// `ipc://;mode=client|server` — cross-thread messaging. `mode=server`
/// replaces the impl during init.
pub static IPC_IMPL: Impl = Impl {
    name: "ipc",
    new_data: || Box::new(IpcClient::default()),
};

/// Server side of `ipc://`, selected by init replacement.
pub static IPC_SERVER_IMPL: Impl = Impl {
    name: "ipc-server",
    new_data: || Box::new(IpcServer::default()),
};

/// Per-client queue pair plus the handle to wake its owner.
struct ClientQueues {
    addr: i64,
    to_server: SegQueue<OwnedMsg>,
    to_client: SegQueue<OwnedMsg>,
    client_notify: Mutex<Option<Notifier>>,
}

struct ServerShared {
    markers: ArrayQueue<Arc<ClientQueues>>,
    clients: Mutex<HashMap<i64, Arc<ClientQueues>>>,
    next_addr: AtomicI64,
    server_notify: Mutex<Option<Notifier>>,
}

impl ServerShared {
    fn new(size: usize) -> Self {
        Self {
            markers: ArrayQueue::new(size.max(1)),
            clients: Mutex::new(HashMap::new()),
            next_addr: AtomicI64::new(0),
            server_notify: Mutex::new(None),
        }
    }
}

// === Server ===

pub(crate) struct IpcServer {
    shared: Arc<ServerShared>,
    notify: Option<Notify>,
}

impl Default for IpcServer {
    fn default() -> Self {
        Self {
            shared: Arc::new(ServerShared::new(1024)),
            notify: None,
        }
    }
}

impl ChannelData for IpcServer {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        let size = url.get_typed("size", 1024usize)?;
        self.shared = Arc::new(ServerShared::new(size));
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        self.shared.next_addr.store(0, Ordering::Relaxed);
        self.shared.clients.lock().clear();
        let notify = Notify::new()?;
        *self.shared.server_notify.lock() = Some(notify.notifier()?);
        base.fd_set(Some(notify.fd()));
        self.notify = Some(notify);
        base.update_dcaps(DCaps::POLLIN | DCaps::PROCESS, DCaps::POLLIN | DCaps::PROCESS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        *self.shared.server_notify.lock() = None;
        self.shared.clients.lock().clear();
        while self.shared.markers.pop().is_some() {}
        base.update_dcaps(DCaps::empty(), DCaps::POLLIN | DCaps::PROCESS);
        base.fd_set(None);
        self.notify = None;
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let Some(queues) = self.shared.markers.pop() else {
            if let Some(notify) = self.notify.as_mut() {
                let markers = &self.shared.markers;
                notify.clear_if(|| !markers.is_empty())?;
            }
            return Err(Error::Again);
        };
        // the marker ran ahead of the message; spin over the gap
        let msg = loop {
            match queues.to_server.pop() {
                Some(msg) => break msg,
                None => std::hint::spin_loop(),
            }
        };
        base.callback_data(&msg.view());
        if let Some(notify) = self.notify.as_mut() {
            let markers = &self.shared.markers;
            notify.clear_if(|| !markers.is_empty())?;
        }
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let clients = self.shared.clients.lock();
        let queues = clients
            .get(&msg.addr.0)
            .ok_or_else(|| Error::NotFound(format!("address {}", msg.addr.0)))?;
        queues.to_client.push(OwnedMsg::from(msg));
        if let Some(notify) = queues.client_notify.lock().as_ref() {
            notify.notify()?;
        }
        Ok(())
    }

    fn as_any(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}

// === Client ===

#[derive(Default)]
pub(crate) struct IpcClient {
    shared: Option<Arc<ServerShared>>,
    queues: Option<Arc<ClientQueues>>,
    notify: Option<Notify>,
}

impl ChannelData for IpcClient {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        match url.get("mode") {
            None | Some("client") => {}
            Some("server") => return Ok(InitResult::Replace(&IPC_SERVER_IMPL)),
            Some(other) => {
                return Err(Error::invalid(format!("invalid mode '{other}'")));
            }
        }
        let master = master.ok_or_else(|| {
            Error::invalid("ipc client needs an ipc://;mode=server master")
        })?;
        let mut guard = master
            .data_lock()
            .ok_or_else(|| Error::invalid("master is busy"))?;
        let data = guard
            .as_mut()
            .ok_or_else(|| Error::invalid("master is dead"))?;
        let server = data
            .as_any()
            .and_then(|any| any.downcast_mut::<IpcServer>())
            .ok_or_else(|| {
                Error::invalid(format!(
                    "master '{}' must be an ipc server channel",
                    master.name()
                ))
            })?;
        self.shared = Some(server.shared.clone());
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| Error::invalid("client is not linked to a server"))?;
        if shared.server_notify.lock().is_none() {
            return Err(Error::invalid("ipc server is not active"));
        }
        let notify = Notify::new()?;
        let queues = Arc::new(ClientQueues {
            addr: shared.next_addr.fetch_add(1, Ordering::Relaxed),
            to_server: SegQueue::new(),
            to_client: SegQueue::new(),
            client_notify: Mutex::new(Some(notify.notifier()?)),
        });
        shared.clients.lock().insert(queues.addr, queues.clone());
        base.fd_set(Some(notify.fd()));
        self.notify = Some(notify);
        self.queues = Some(queues);
        base.update_dcaps(DCaps::POLLIN | DCaps::PROCESS, DCaps::POLLIN | DCaps::PROCESS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        if let (Some(shared), Some(queues)) = (self.shared.as_ref(), self.queues.as_ref()) {
            shared.clients.lock().remove(&queues.addr);
        }
        self.queues = None;
        base.update_dcaps(DCaps::empty(), DCaps::POLLIN | DCaps::PROCESS);
        base.fd_set(None);
        self.notify = None;
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let Some(queues) = self.queues.as_ref() else {
            return Err(Error::Again);
        };
        let msg = queues.to_client.pop();
        if let Some(notify) = self.notify.as_mut() {
            let queue = &queues.to_client;
            notify.clear_if(|| !queue.is_empty())?;
        }
        let Some(msg) = msg else {
            return Err(Error::Again);
        };
        base.callback_data(&msg.view());
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let (Some(shared), Some(queues)) = (self.shared.as_ref(), self.queues.as_ref()) else {
            return Err(Error::invalid("client is not open"));
        };
        // marker first: the server must observe this queue as non-empty
        if shared.markers.push(queues.clone()).is_err() {
            return Err(Error::Again);
        }
        let mut owned = OwnedMsg::from(msg);
        owned.addr = Addr(queues.addr);
        queues.to_server.push(owned);
        if let Some(notify) = shared.server_notify.lock().as_ref() {
            notify.notify()?;
        }
        Ok(())
    }
}
