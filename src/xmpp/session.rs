//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of xmppd.
//
// xmppd is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// xmppd is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// xmppd. If not, see <http://www.gnu.org/licenses/>.

//! Per-connection session state.
//!
//! A `Session` is shared (`Arc`) between its owning connection thread, the
//! registry, and any peer threads that deliver stanzas to it. The owning
//! thread is the only writer of the phase and identity; peers read them
//! advisorily for routing, where a stale read at worst loses one broadcast.
//! All socket writes go through `send`, which serialises them under the
//! write mutex and drops them once the session is dead.

use std::fmt::Write as _;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::stanza::{escape_attr, Stanza};
use crate::account::roster::Roster;

/// Stream negotiation phase.
///
/// Phases advance monotonically except for the jump to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connected,
    StreamOpened,
    Authenticated,
    Bound,
    SessionActive,
    Disconnected,
}

/// What the connection loop should do after a stanza has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Continue,
    /// SASL success: rebuild the stanza reader on the same byte source.
    RestartStream,
    /// A stream error was sent; drop the connection.
    Close,
}

/// The write half of a connection. `TcpStream` in production; tests use
/// socketpairs.
pub trait Transport: Write + Send + Sync {
    fn shutdown_both(&self);
}

impl Transport for TcpStream {
    fn shutdown_both(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Transport for UnixStream {
    fn shutdown_both(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

#[derive(Default)]
struct Identity {
    local: String,
    resource: String,
}

pub struct Session {
    domain: String,
    remote: String,

    identity: Mutex<Identity>,
    phase: Mutex<Phase>,
    authenticated: AtomicBool,

    // Presence state; written by the owning thread, read by peers.
    available: AtomicBool,
    initial_presence_sent: AtomicBool,
    presence_stanza: Mutex<Option<Stanza>>,

    /// The lazily loaded roster. Peer threads lock this to apply
    /// subscription-driven mutations.
    pub roster: Mutex<Roster>,

    writer: Mutex<Box<dyn Transport>>,
    /// Second handle on the same socket, used to unblock the reader on close
    /// without waiting for the write mutex.
    control: Box<dyn Transport>,
    dead: AtomicBool,
}

impl Session {
    pub fn new(
        writer: Box<dyn Transport>,
        control: Box<dyn Transport>,
        domain: &str,
        remote: String,
    ) -> Arc<Self> {
        Arc::new(Session {
            domain: domain.to_owned(),
            remote,
            identity: Mutex::new(Identity::default()),
            phase: Mutex::new(Phase::Connected),
            authenticated: AtomicBool::new(false),
            available: AtomicBool::new(false),
            initial_presence_sent: AtomicBool::new(false),
            presence_stanza: Mutex::new(None),
            roster: Mutex::new(Roster::default()),
            writer: Mutex::new(writer),
            control,
            dead: AtomicBool::new(false),
        })
    }

    /// Creates a session for an accepted TCP connection.
    pub fn tcp(stream: &TcpStream, domain: &str) -> std::io::Result<Arc<Self>> {
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        Ok(Self::new(
            Box::new(stream.try_clone()?),
            Box::new(stream.try_clone()?),
            domain,
            remote,
        ))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    pub fn local(&self) -> String {
        self.identity.lock().unwrap().local.clone()
    }

    pub fn set_local(&self, local: &str) {
        self.identity.lock().unwrap().local = local.to_owned();
    }

    pub fn resource(&self) -> String {
        self.identity.lock().unwrap().resource.clone()
    }

    pub fn set_resource(&self, resource: &str) {
        self.identity.lock().unwrap().resource = resource.to_owned();
    }

    /// Returns `local@domain`, or "" before authentication.
    pub fn bare_jid(&self) -> String {
        let identity = self.identity.lock().unwrap();
        if identity.local.is_empty() {
            return String::new();
        }
        format!("{}@{}", identity.local, self.domain)
    }

    /// Returns `local@domain/resource`, degrading to the bare JID before
    /// bind and "" before authentication.
    pub fn full_jid(&self) -> String {
        let identity = self.identity.lock().unwrap();
        if identity.local.is_empty() {
            return String::new();
        }
        if identity.resource.is_empty() {
            return format!("{}@{}", identity.local, self.domain);
        }
        format!("{}@{}/{}", identity.local, self.domain, identity.resource)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn initial_presence_sent(&self) -> bool {
        self.initial_presence_sent.load(Ordering::SeqCst)
    }

    pub fn set_initial_presence_sent(&self) {
        self.initial_presence_sent.store(true, Ordering::SeqCst);
    }

    /// The most recent available presence this user broadcast, already
    /// restamped with their full JID.
    pub fn presence_stanza(&self) -> Option<Stanza> {
        self.presence_stanza.lock().unwrap().clone()
    }

    pub fn set_presence_stanza(&self, stanza: Stanza) {
        *self.presence_stanza.lock().unwrap() = Some(stanza);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Writes raw bytes to the connection. Safe to call from any thread;
    /// silently drops the write once the session is dead.
    pub fn send(&self, data: &str) {
        if self.is_dead() {
            return;
        }
        let mut writer = self.writer.lock().unwrap();
        if self.is_dead() {
            return;
        }
        let result = writer
            .write_all(data.as_bytes())
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            debug!("write error to {}: {}", self.describe(), e);
        }
    }

    pub fn send_node(&self, node: &Stanza) {
        self.send(&node.serialize());
    }

    /// Sends an RFC 6120 stanza-level error in reply to `original`,
    /// preserving its tag name and id. The connection stays open.
    pub fn send_stanza_error(
        &self,
        original: &Stanza,
        error_type: &str,
        condition: &str,
    ) {
        let mut out = String::new();
        let _ = write!(out, "<{} type='error'", original.name);
        if let Some(id) = original.attr("id") {
            let _ = write!(out, " id='{}'", escape_attr(id));
        }
        let _ = write!(out, " from='{}'", escape_attr(&self.domain));
        let jid = self.full_jid();
        if !jid.is_empty() {
            let _ = write!(out, " to='{}'", escape_attr(&jid));
        }
        let _ = write!(
            out,
            "><error type='{}'>\
             <{} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             </error></{}>",
            error_type, condition, original.name
        );
        self.send(&out);
    }

    /// Marks the session dead and shuts the socket down, unblocking the
    /// reader thread. Idempotent.
    pub fn close(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            self.control.shutdown_both();
        }
    }

    /// The session's identity for log messages: JID when known, remote
    /// address otherwise.
    pub fn describe(&self) -> String {
        let bare = self.bare_jid();
        if bare.is_empty() {
            self.remote.clone()
        } else {
            bare
        }
    }
}

/// The capabilities handler modules need from the server: peer lookup,
/// registration, and the shared disk configuration. Kept as a trait so tests
/// can substitute a double.
pub trait Registry: Sync {
    /// Snapshot of every connected session, bound or not.
    fn all_sessions(&self) -> Vec<Arc<Session>>;

    /// The live session bound to a bare JID.
    ///
    /// Only bare-JID indexing exists: a stanza addressed to any resource of
    /// a user reaches whatever single resource is currently bound.
    fn find_by_bare_jid(&self, bare_jid: &str) -> Option<Arc<Session>>;

    /// Registers a newly bound session under its bare JID, returning the
    /// session it displaced so the caller can kick it.
    fn register(&self, session: &Arc<Session>) -> Option<Arc<Session>>;

    fn data_dir(&self) -> &Path;

    fn domain(&self) -> &str;

    /// Serialises disk mutations for users with no live session.
    fn file_lock(&self) -> MutexGuard<'_, ()>;
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;
    use crate::xmpp::testutil::{pipe_session, read_available};

    #[test]
    fn jid_forms() {
        let (session, _peer) = pipe_session("localhost");
        assert_eq!("", session.bare_jid());
        assert_eq!("", session.full_jid());

        session.set_local("zim");
        assert_eq!("zim@localhost", session.bare_jid());
        assert_eq!("zim@localhost", session.full_jid());

        session.set_resource("home");
        assert_eq!("zim@localhost", session.bare_jid());
        assert_eq!("zim@localhost/home", session.full_jid());
    }

    #[test]
    fn send_reaches_peer_in_order() {
        let (session, mut peer) = pipe_session("localhost");
        session.send("<a/>");
        session.send("<b/>");
        assert_eq!("<a/><b/>", read_available(&mut peer));
    }

    #[test]
    fn sends_are_dropped_after_close() {
        let (session, mut peer) = pipe_session("localhost");
        session.send("<a/>");
        session.close();
        session.send("<b/>");

        let mut buf = Vec::new();
        // shutdown means the peer sees EOF after the buffered data
        peer.read_to_end(&mut buf).unwrap();
        assert_eq!(b"<a/>", buf.as_slice());
    }

    #[test]
    fn close_is_idempotent() {
        let (session, _peer) = pipe_session("localhost");
        session.close();
        session.close();
        assert!(session.is_dead());
    }

    #[test]
    fn stanza_error_preserves_id_and_addressing() {
        let (session, mut peer) = pipe_session("localhost");
        session.set_local("zim");
        session.set_resource("home");

        let mut original = Stanza::new("message", crate::xmpp::NS_CLIENT);
        original.set_attr("id", "m1");
        session.send_stanza_error(&original, "modify", "jid-malformed");

        assert_eq!(
            "<message type='error' id='m1' from='localhost' \
             to='zim@localhost/home'>\
             <error type='modify'>\
             <jid-malformed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             </error></message>",
            read_available(&mut peer)
        );
    }

    #[test]
    fn stanza_error_without_identity_omits_to() {
        let (session, mut peer) = pipe_session("localhost");
        let original = Stanza::new("iq", crate::xmpp::NS_CLIENT);
        session.send_stanza_error(&original, "cancel", "not-allowed");

        let sent = read_available(&mut peer);
        assert!(sent.starts_with("<iq type='error' from='localhost'>"));
        assert!(!sent.contains(" to="));
    }
}
