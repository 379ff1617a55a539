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

//! Message delivery and the offline spool.
//!
//! A message to a local account is delivered to its live session if there is
//! one; otherwise it is spooled as `<dataDir>/<user>/offline/<NNNN>.xml`
//! with a XEP-0203 `<delay/>` recording when it arrived. The spool is
//! drained, in order, the first time the user broadcasts available presence
//! on a new connection.

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};

use super::session::{Registry, Routing, Session};
use super::stanza::Stanza;
use super::NS_DELAY;
use crate::account::user;

/// Routes a `<message>` stanza to a local user, spooling it if they are
/// offline.
pub fn handle(
    reg: &dyn Registry,
    s: &Arc<Session>,
    node: &mut Stanza,
) -> Routing {
    let to = node.attr("to").unwrap_or("").to_owned();
    let msg_type = node.attr("type").unwrap_or("normal").to_owned();

    let (target_local, target_domain) = split_bare_jid(&to);
    if target_local.is_empty() {
        s.send_stanza_error(node, "modify", "jid-malformed");
        return Routing::Continue;
    }
    if target_domain != reg.domain()
        || !user::exists(reg.data_dir(), target_local)
    {
        s.send_stanza_error(node, "cancel", "item-not-found");
        return Routing::Continue;
    }

    node.set_attr("from", &s.full_jid());

    let target_bare = format!("{}@{}", target_local, target_domain);
    if let Some(target) = reg.find_by_bare_jid(&target_bare) {
        target.send_node(node);
    } else if msg_type != "error" {
        store_offline(reg, target_local, node);
    }

    Routing::Continue
}

/// Drains the session's offline spool in spool order, deleting each file
/// after it is sent. Unreadable files are logged and deleted so they cannot
/// wedge the spool. Called on the session's initial available presence.
pub fn deliver_offline(reg: &dyn Registry, s: &Arc<Session>) {
    let local = s.local();
    let dir = reg.data_dir().join(&local).join("offline");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut files: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(".xml"))
        .collect();
    // Lexicographic equals numeric order thanks to the zero padding.
    files.sort();

    for name in files {
        let path = dir.join(&name);
        match fs::read_to_string(&path) {
            Ok(data) => {
                s.send(&data);
                info!("delivered offline message to '{}': {}", local, name);
            },
            Err(e) => {
                warn!(
                    "failed to read offline message {}: {}",
                    path.display(),
                    e
                );
            },
        }
        let _ = fs::remove_file(&path);
    }
}

/// Spools `node` for an offline user. The on-disk copy carries an appended
/// XEP-0203 delay element; the in-memory stanza is left untouched.
fn store_offline(reg: &dyn Registry, username: &str, node: &Stanza) {
    let dir = reg.data_dir().join(username).join("offline");

    let _guard = reg.file_lock();
    if let Err(e) = fs::create_dir_all(&dir) {
        error!("failed to create {}: {}", dir.display(), e);
        return;
    }

    let mut max_seq = 0u32;
    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let seq = name
                .to_str()
                .and_then(|n| n.strip_suffix(".xml"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(seq) = seq {
                max_seq = max_seq.max(seq);
            }
        }
    }

    let mut delay = Stanza::new("delay", NS_DELAY);
    delay.set_attr("from", reg.domain());
    delay.set_attr(
        "stamp",
        &Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    );
    let mut spooled = node.clone();
    spooled.children.push(delay);

    let path = dir.join(format!("{:04}.xml", max_seq + 1));
    match fs::write(&path, spooled.serialize()) {
        Ok(()) => {
            info!("stored offline message for '{}': {}", username, path.display())
        },
        Err(e) => {
            // The message is lost; the sender is not told.
            error!(
                "failed to write offline message {}: {}",
                path.display(),
                e
            )
        },
    }
}

/// Splits a JID into local and domain parts, dropping any resource. A JID
/// with no local part yields an empty local and the remainder as domain.
fn split_bare_jid(jid: &str) -> (&str, &str) {
    let bare = super::bare_jid(jid);
    match bare.find('@') {
        Some(at) if at > 0 => (&bare[..at], &bare[at + 1..]),
        _ => ("", bare),
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::xmpp::server::Server;
    use crate::xmpp::testutil::{pipe_session, read_available};
    use crate::xmpp::NS_CLIENT;

    fn chat(to: &str, body: &str) -> Stanza {
        let mut msg = Stanza::new("message", NS_CLIENT);
        msg.set_attr("to", to);
        msg.set_attr("type", "chat");
        let mut body_el = Stanza::new("body", NS_CLIENT);
        body_el.text = body.to_owned();
        msg.children.push(body_el);
        msg
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        server: Arc<Server>,
    }

    fn fixture() -> Fixture {
        crate::init_test_log();
        let dir = tempfile::TempDir::new().unwrap();
        let server = Server::new("localhost", dir.path(), "unused");
        Fixture { _dir: dir, server }
    }

    #[test]
    fn split_bare_jid_forms() {
        assert_eq!(("zim", "localhost"), split_bare_jid("zim@localhost"));
        assert_eq!(("zim", "localhost"), split_bare_jid("zim@localhost/home"));
        assert_eq!(("", "localhost"), split_bare_jid("localhost"));
        assert_eq!(("", ""), split_bare_jid(""));
        assert_eq!(("", "@x"), split_bare_jid("@x"));
    }

    #[test]
    fn malformed_and_unknown_targets_get_stanza_errors() {
        let f = fixture();
        let (sender, mut peer) = pipe_session("localhost");
        sender.set_local("zim");

        let mut msg = chat("localhost", "hi");
        msg.set_attr("id", "m1");
        handle(&*f.server, &sender, &mut msg);
        let reply = read_available(&mut peer);
        assert!(reply.contains("jid-malformed"), "got {}", reply);

        let mut msg = chat("dib@elsewhere", "hi");
        handle(&*f.server, &sender, &mut msg);
        assert!(read_available(&mut peer).contains("item-not-found"));

        let mut msg = chat("nobody@localhost", "hi");
        handle(&*f.server, &sender, &mut msg);
        assert!(read_available(&mut peer).contains("item-not-found"));
    }

    #[test]
    fn live_target_receives_stamped_message() {
        let f = fixture();
        crate::account::user::create(f.server.data_dir(), "dib", "pw")
            .unwrap();

        let (sender, _sender_peer) = pipe_session("localhost");
        sender.set_local("zim");
        sender.set_resource("home");
        let (target, mut target_peer) = pipe_session("localhost");
        target.set_local("dib");
        f.server.add_session(&target);
        assert!(f.server.register(&target).is_none());

        let mut msg = chat("dib@localhost", "hello dib");
        handle(&*f.server, &sender, &mut msg);

        let got = read_available(&mut target_peer);
        assert!(got.contains("from='zim@localhost/home'"), "got {}", got);
        assert!(got.contains("<body>hello dib</body>"));
        // nothing was spooled
        let spool = f.server.data_dir().join("dib").join("offline");
        assert_eq!(0, fs::read_dir(spool).unwrap().count());
    }

    #[test]
    fn offline_target_spools_with_delay_and_in_memory_stanza_is_clean() {
        let f = fixture();
        crate::account::user::create(f.server.data_dir(), "tak", "pw")
            .unwrap();

        let (sender, _peer) = pipe_session("localhost");
        sender.set_local("zim");

        let mut msg = chat("tak@localhost", "are you there");
        handle(&*f.server, &sender, &mut msg);

        // the in-memory stanza acquired from= but no delay
        assert_eq!(Some("zim@localhost"), msg.attr("from"));
        assert!(msg.find_child("delay").is_none());

        let path = f
            .server
            .data_dir()
            .join("tak")
            .join("offline")
            .join("0001.xml");
        let data = fs::read_to_string(&path).unwrap();
        assert!(data.contains("<delay xmlns='urn:xmpp:delay' from='localhost' stamp='"));
        assert!(data.contains("from='zim@localhost'"));
        assert!(data.contains("<body>are you there</body>"));
    }

    #[test]
    fn spool_numbering_is_max_plus_one() {
        let f = fixture();
        crate::account::user::create(f.server.data_dir(), "tak", "pw")
            .unwrap();
        let (sender, _peer) = pipe_session("localhost");
        sender.set_local("zim");

        handle(&*f.server, &sender, &mut chat("tak@localhost", "one"));
        handle(&*f.server, &sender, &mut chat("tak@localhost", "two"));

        let spool = f.server.data_dir().join("tak").join("offline");
        assert!(spool.join("0001.xml").is_file());
        assert!(spool.join("0002.xml").is_file());

        // a gap below the maximum does not cause reuse
        fs::remove_file(spool.join("0001.xml")).unwrap();
        handle(&*f.server, &sender, &mut chat("tak@localhost", "three"));
        assert!(spool.join("0003.xml").is_file());
    }

    #[test]
    fn error_messages_are_never_spooled() {
        let f = fixture();
        crate::account::user::create(f.server.data_dir(), "tak", "pw")
            .unwrap();
        let (sender, _peer) = pipe_session("localhost");
        sender.set_local("zim");

        let mut msg = chat("tak@localhost", "bounce");
        msg.set_attr("type", "error");
        handle(&*f.server, &sender, &mut msg);

        let spool = f.server.data_dir().join("tak").join("offline");
        assert_eq!(0, fs::read_dir(spool).unwrap().count());
    }

    #[test]
    fn offline_delivery_is_in_spool_order_and_consumes_files() {
        let f = fixture();
        crate::account::user::create(f.server.data_dir(), "tak", "pw")
            .unwrap();
        let spool = f.server.data_dir().join("tak").join("offline");

        // eleven files so lexicographic order would diverge from numeric
        // order without the zero padding
        for i in 1..=11u32 {
            fs::write(
                spool.join(format!("{:04}.xml", i)),
                format!("<message><body>m{}</body></message>", i),
            )
            .unwrap();
        }

        let (target, mut peer) = pipe_session("localhost");
        target.set_local("tak");
        deliver_offline(&*f.server, &target);

        let got = read_available(&mut peer);
        let positions: Vec<usize> = (1..=11u32)
            .map(|i| got.find(&format!(">m{}<", i)).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, positions);

        assert_eq!(0, fs::read_dir(&spool).unwrap().count());
    }

    #[test]
    fn unreadable_spool_entries_are_discarded() {
        let f = fixture();
        crate::account::user::create(f.server.data_dir(), "tak", "pw")
            .unwrap();
        let spool = f.server.data_dir().join("tak").join("offline");
        // invalid UTF-8 cannot be read back as a stanza
        fs::write(spool.join("0001.xml"), [0xffu8, 0xfe, 0x00]).unwrap();
        fs::write(spool.join("0002.xml"), "<message/>").unwrap();

        let (target, mut peer) = pipe_session("localhost");
        target.set_local("tak");
        deliver_offline(&*f.server, &target);

        // the poison file is dropped, the one behind it still delivers
        assert!(read_available(&mut peer).contains("<message/>"));
        assert_eq!(0, fs::read_dir(&spool).unwrap().count());
    }
}
