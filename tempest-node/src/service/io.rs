use std::collections::VecDeque;

use localtime::LocalDuration;
use log::*;

use crate::service::message::Message;
use crate::service::DisconnectReason;
use crate::{Address, ConnId};

/// I/O operation to execute at the transport level.
#[derive(Debug)]
pub enum Io {
    /// Messages ready to be sent on a connection.
    Write(ConnId, Vec<Message>),
    /// Dial an endpoint.
    Connect(Address),
    /// Close a connection.
    Disconnect(ConnId, DisconnectReason),
    /// Ask for a wakeup in a specified amount of time.
    Wakeup(LocalDuration),
}

/// Interface to the transport.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Outgoing I/O queue.
    io: VecDeque<Io>,
}

impl Outbox {
    /// Dial an endpoint.
    pub fn connect(&mut self, addr: Address) {
        self.io.push_back(Io::Connect(addr));
    }

    /// Close a connection.
    pub fn disconnect(&mut self, conn: ConnId, reason: DisconnectReason) {
        self.io.push_back(Io::Disconnect(conn, reason));
    }

    pub fn write(&mut self, conn: ConnId, msg: Message) {
        trace!(target: "service", "Write {:?} on {}", &msg, conn);

        self.io.push_back(Io::Write(conn, vec![msg]));
    }

    pub fn write_all(&mut self, conn: ConnId, msgs: impl IntoIterator<Item = Message>) {
        let msgs = msgs.into_iter().collect::<Vec<_>>();

        if msgs.is_empty() {
            return;
        }
        for (ix, msg) in msgs.iter().enumerate() {
            trace!(target: "service", "Write {:?} on {} ({}/{})", msg, conn, ix + 1, msgs.len());
        }
        self.io.push_back(Io::Write(conn, msgs));
    }

    pub fn wakeup(&mut self, after: LocalDuration) {
        self.io.push_back(Io::Wakeup(after));
    }

    #[cfg(test)]
    pub(crate) fn queue(&mut self) -> &mut VecDeque<Io> {
        &mut self.io
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.io.pop_front()
    }
}
