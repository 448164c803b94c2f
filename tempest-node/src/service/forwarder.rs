//! Announcement fan-out.
//!
//! A single announcement is re-issued on every live announcement channel:
//! the sessions that forward announcements, and every outbound lookup this
//! node is connected to. The connection the announcement arrived on is
//! excluded, so an announcement is never echoed back to its source, and no
//! connection is written more than once per fan-out.
use std::collections::HashSet;

use crate::service::io::Outbox;
use crate::service::message::Message;
use crate::service::session::{Lookup, Session};
use crate::ConnId;

pub fn fan_out<'a>(
    outbox: &mut Outbox,
    msg: &Message,
    sessions: impl IntoIterator<Item = &'a Session>,
    lookups: impl IntoIterator<Item = &'a Lookup>,
    exclude: Option<ConnId>,
) {
    let mut written: HashSet<ConnId> = HashSet::new();

    for session in sessions {
        // Relayed sessions are reached through their relay, which gossips
        // to them itself.
        if !session.forward_announcements || session.is_relayed() {
            continue;
        }
        if Some(session.conn) == exclude {
            continue;
        }
        if written.insert(session.conn) {
            outbox.write(session.conn, msg.clone());
        }
    }
    for lookup in lookups {
        let Some(conn) = lookup.conn() else {
            continue;
        };
        if !lookup.is_connected() {
            continue;
        }
        if Some(conn) == exclude {
            continue;
        }
        if written.insert(conn) {
            outbox.write(conn, msg.clone());
        }
    }
}
