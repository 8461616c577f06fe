//! Checked-out request slots.
//!
//! A [`Session`] is a short-lived handle binding one client request to one
//! worker process and one of its session sockets. The request handler
//! connects to [`Session::address`], authenticates with
//! [`Session::connect_password`], performs its I/O, and then calls
//! [`Session::close`]. Dropping a session without closing it still
//! releases the slot, so counters cannot leak, but explicit close is the
//! expected path.

use std::sync::Weak;

use crate::pool::core::Pool;
use crate::pool::process::{SocketAddress, SocketProtocol};

/// Identifies the socket a session was checked out from.
#[derive(Debug, Clone)]
pub struct SessionSocket {
    pub(crate) index: usize,
    pub name: String,
    pub address: SocketAddress,
    pub protocol: SocketProtocol,
}

/// A single client-to-worker interaction.
pub struct Session {
    pool: Weak<Pool>,
    app_group_name: String,
    gupid: String,
    pid: i32,
    connect_password: String,
    /// `None` for no-op sessions, which reserve a group without touching
    /// any process.
    socket: Option<SessionSocket>,
    closed: bool,
}

impl Session {
    pub(crate) fn checked_out(
        pool: Weak<Pool>,
        app_group_name: String,
        gupid: String,
        pid: i32,
        connect_password: String,
        socket: SessionSocket,
    ) -> Self {
        Session {
            pool,
            app_group_name,
            gupid,
            pid,
            connect_password,
            socket: Some(socket),
            closed: false,
        }
    }

    /// A session that reserves a group without a backing process.
    pub(crate) fn no_op(app_group_name: String) -> Self {
        Session {
            pool: Weak::new(),
            app_group_name,
            gupid: String::new(),
            pid: 0,
            connect_password: String::new(),
            socket: None,
            closed: true,
        }
    }

    pub fn app_group_name(&self) -> &str {
        &self.app_group_name
    }

    pub fn gupid(&self) -> &str {
        &self.gupid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn connect_password(&self) -> &str {
        &self.connect_password
    }

    pub fn is_no_op(&self) -> bool {
        self.socket.is_none()
    }

    /// Address of the socket this session is bound to.
    pub fn address(&self) -> Option<&SocketAddress> {
        self.socket.as_ref().map(|socket| &socket.address)
    }

    pub fn protocol(&self) -> Option<&SocketProtocol> {
        self.socket.as_ref().map(|socket| &socket.protocol)
    }

    /// Release the session slot.
    pub fn close(mut self) {
        self.signal_closed();
    }

    /// Report that the session's socket could not be connected. The pool
    /// detaches the backing process; the slot is released either way.
    pub fn initiate_failed(mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(socket) = self.socket.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.session_initiate_failed(&self.app_group_name, &self.gupid, socket.index);
        }
    }

    fn signal_closed(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(socket) = self.socket.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.session_closed(&self.app_group_name, &self.gupid, socket.index);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.signal_closed();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("app_group_name", &self.app_group_name)
            .field("gupid", &self.gupid)
            .field("pid", &self.pid)
            .field("no_op", &self.is_no_op())
            .finish_non_exhaustive()
    }
}
