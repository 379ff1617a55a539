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

//! The listener and the session registry.
//!
//! One thread per connection, blocking reads. The registry is the only
//! process-wide mutable structure: a reader/writer lock over the bare-JID
//! map and the list of all connections (bound or not). Fan-outs snapshot
//! under the read lock and iterate without it.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use log::{debug, error, info, warn};

use super::reader::StanzaReader;
use super::session::{Phase, Registry, Routing, Session};
use super::{presence, router, stream};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Flags the accept loop to exit. Called from the signal handler, so it
/// must stay async-signal-safe.
pub fn request_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
}

fn shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

#[derive(Default)]
struct SessionTable {
    by_bare_jid: HashMap<String, Arc<Session>>,
    all: Vec<Arc<Session>>,
}

pub struct Server {
    domain: String,
    data_dir: PathBuf,
    addr: String,

    sessions: RwLock<SessionTable>,
    /// Serialises roster/spool writes for users with no live session.
    file_mu: Mutex<()>,
}

impl Server {
    pub fn new(
        domain: &str,
        data_dir: impl Into<PathBuf>,
        addr: &str,
    ) -> Arc<Server> {
        Arc::new(Server {
            domain: domain.to_owned(),
            data_dir: data_dir.into(),
            addr: addr.to_owned(),
            sessions: RwLock::new(SessionTable::default()),
            file_mu: Mutex::new(()),
        })
    }

    pub fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.addr)
    }

    /// Accepts connections until shutdown is requested, spawning one thread
    /// per connection. SIGINT/SIGTERM interrupt `accept` (the handler is
    /// installed without SA_RESTART), after which the flag check exits the
    /// loop.
    pub fn run(self: &Arc<Self>, listener: TcpListener) {
        info!("listening on {} for domain '{}'", self.addr, self.domain);

        loop {
            if shutting_down() {
                info!("shutting down");
                return;
            }

            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) => {
                    if shutting_down() {
                        info!("shutting down");
                        return;
                    }
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("accept error: {}", e);
                    continue;
                },
            };

            let session = match Session::tcp(&stream, &self.domain) {
                Ok(session) => session,
                Err(e) => {
                    warn!("failed to set up connection: {}", e);
                    continue;
                },
            };
            self.add_session(&session);

            let server = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("client-{}", session.remote_addr()))
                .spawn({
                    let session = Arc::clone(&session);
                    move || server.session_loop(stream, session)
                });
            if let Err(e) = spawned {
                error!("failed to spawn session thread: {}", e);
                self.unregister(&session);
                session.close();
            }
        }
    }

    /// The per-connection loop: read a stanza, route it, honour the
    /// routing verdict, and tear the session down on exit.
    ///
    /// A stream restart (SASL success) drops the XML parser and builds a
    /// fresh one over the same `BufReader`, so bytes the old parser had not
    /// yet consumed are carried over.
    fn session_loop(self: Arc<Self>, stream: TcpStream, session: Arc<Session>) {
        info!("client connected from {}", session.remote_addr());

        let mut src = BufReader::new(stream);
        'stream: loop {
            let mut reader = StanzaReader::new(&mut src);
            loop {
                match reader.read_stanza() {
                    Ok(Some(mut node)) => {
                        let routing = if node.is_stream_open() {
                            stream::handle_open(&*self, &session, &node)
                        } else {
                            router::route(&*self, &session, &mut node)
                        };
                        match routing {
                            Routing::Continue => (),
                            Routing::RestartStream => continue 'stream,
                            Routing::Close => break 'stream,
                        }
                    },
                    Ok(None) => break 'stream,
                    Err(e) => {
                        debug!(
                            "read error from {}: {}",
                            session.describe(),
                            e
                        );
                        break 'stream;
                    },
                }
            }
        }

        self.unregister(&session);
        presence::broadcast_unavailable(&*self, &session);
        session.close();
        session.set_phase(Phase::Disconnected);
        info!(
            "session ended: {} ({})",
            session.describe(),
            session.remote_addr()
        );
    }

    /// Tracks a connection from accept time, before it has any identity.
    pub fn add_session(&self, session: &Arc<Session>) {
        self.sessions.write().unwrap().all.push(Arc::clone(session));
    }

    /// Registers a bound session under its bare JID, returning the session
    /// it displaced, if any.
    pub fn register(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let mut table = self.sessions.write().unwrap();
        table
            .by_bare_jid
            .insert(session.bare_jid(), Arc::clone(session))
            .filter(|old| !Arc::ptr_eq(old, session))
    }

    /// Removes a session from all indices. The JID entry is only removed
    /// while it still points at this session, so a kicked session's
    /// teardown cannot erase its replacement.
    pub fn unregister(&self, session: &Arc<Session>) {
        let mut table = self.sessions.write().unwrap();

        let bare_jid = session.bare_jid();
        if !bare_jid.is_empty() {
            if let Some(current) = table.by_bare_jid.get(&bare_jid) {
                if Arc::ptr_eq(current, session) {
                    table.by_bare_jid.remove(&bare_jid);
                }
            }
        }

        table.all.retain(|other| !Arc::ptr_eq(other, session));
    }

    pub fn find_by_bare_jid(&self, bare_jid: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().by_bare_jid.get(bare_jid).cloned()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().all.clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Registry for Server {
    fn all_sessions(&self) -> Vec<Arc<Session>> {
        Server::all_sessions(self)
    }

    fn find_by_bare_jid(&self, bare_jid: &str) -> Option<Arc<Session>> {
        Server::find_by_bare_jid(self, bare_jid)
    }

    fn register(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        Server::register(self, session)
    }

    fn data_dir(&self) -> &Path {
        Server::data_dir(self)
    }

    fn domain(&self) -> &str {
        Server::domain(self)
    }

    fn file_lock(&self) -> MutexGuard<'_, ()> {
        self.file_mu.lock().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xmpp::testutil::pipe_session;

    fn server() -> Arc<Server> {
        Server::new("localhost", "/nonexistent", "unused")
    }

    #[test]
    fn register_maps_bare_jid() {
        let srv = server();
        let (s, _peer) = pipe_session("localhost");
        s.set_local("zim");
        srv.add_session(&s);

        assert!(srv.register(&s).is_none());
        let found = srv.find_by_bare_jid("zim@localhost").unwrap();
        assert!(Arc::ptr_eq(&found, &s));
        assert!(srv.find_by_bare_jid("dib@localhost").is_none());
    }

    #[test]
    fn re_register_same_session_returns_no_conflict() {
        let srv = server();
        let (s, _peer) = pipe_session("localhost");
        s.set_local("zim");
        srv.add_session(&s);
        srv.register(&s);
        assert!(srv.register(&s).is_none());
    }

    #[test]
    fn conflicting_register_returns_displaced_session() {
        let srv = server();
        let (old, _old_peer) = pipe_session("localhost");
        old.set_local("zim");
        let (new, _new_peer) = pipe_session("localhost");
        new.set_local("zim");
        srv.add_session(&old);
        srv.add_session(&new);

        srv.register(&old);
        let displaced = srv.register(&new).unwrap();
        assert!(Arc::ptr_eq(&displaced, &old));

        let found = srv.find_by_bare_jid("zim@localhost").unwrap();
        assert!(Arc::ptr_eq(&found, &new));
    }

    #[test]
    fn unregister_of_kicked_session_preserves_replacement() {
        let srv = server();
        let (old, _old_peer) = pipe_session("localhost");
        old.set_local("zim");
        let (new, _new_peer) = pipe_session("localhost");
        new.set_local("zim");
        srv.add_session(&old);
        srv.add_session(&new);
        srv.register(&old);
        srv.register(&new);

        // the kicked session tears down after the new one took over
        srv.unregister(&old);

        let found = srv.find_by_bare_jid("zim@localhost").unwrap();
        assert!(Arc::ptr_eq(&found, &new));
        assert_eq!(1, srv.all_sessions().len());
    }

    #[test]
    fn all_sessions_includes_unbound_connections() {
        let srv = server();
        let (s, _peer) = pipe_session("localhost");
        srv.add_session(&s);
        assert_eq!(1, srv.all_sessions().len());
        assert_eq!("", s.bare_jid());

        srv.unregister(&s);
        assert!(srv.all_sessions().is_empty());
    }
}
