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

//! The presence and subscription engine.
//!
//! Availability broadcasts are driven by the sender's roster: contacts
//! holding a `from` direction see our presence, contacts we hold a `to`
//! direction on reflect theirs back to us. The four subscription verbs
//! perform symmetric updates on the sender's and target's rosters; when the
//! target is offline their roster is edited directly on disk under the
//! registry's file lock.
//!
//! Lock discipline: the sender's roster mutex is released before the
//! target's is taken, and fan-outs iterate over an item snapshot, so at most
//! one roster mutex is ever held.

use std::sync::Arc;

use log::warn;

use super::message;
use super::session::{Registry, Routing, Session};
use super::stanza::{escape_attr, Stanza};
use super::{bare_jid, local_part};
use crate::account::roster::{self, Item, Roster, Subscription};

/// Dispatches a `<presence>` stanza by its `type`.
pub fn handle(
    reg: &dyn Registry,
    s: &Arc<Session>,
    node: &Stanza,
) -> Routing {
    let ptype = node.attr("type").unwrap_or("");
    let to = node.attr("to").unwrap_or("");

    match ptype {
        "" => handle_available(reg, s, node),
        "unavailable" => broadcast_unavailable(reg, s),
        "subscribe" => handle_subscribe(reg, s, to),
        "subscribed" => handle_subscribed(reg, s, to),
        "unsubscribe" => handle_unsubscribe(reg, s, to),
        "unsubscribed" => handle_unsubscribed(reg, s, to),
        _ => warn!(
            "unknown presence type '{}' from {}",
            ptype,
            s.describe()
        ),
    }
    Routing::Continue
}

fn handle_available(reg: &dyn Registry, s: &Arc<Session>, node: &Stanza) {
    let is_initial = !s.is_available();
    s.set_available(true);

    // Cache the stanza restamped with our full JID as its origin.
    let mut pres = node.clone();
    pres.attrs.retain(|a| a.name != "from");
    pres.set_attr("from", &s.full_jid());
    s.set_presence_stanza(pres.clone());

    let items = roster_snapshot(reg, s);
    let pres_xml = pres.serialize();

    // Contacts subscribed to us see the new presence.
    for item in items.iter().filter(|i| i.subscription.has_from()) {
        if let Some(contact) = reg.find_by_bare_jid(bare_jid(&item.jid)) {
            contact.send(&pres_xml);
        }
    }

    // Contacts we are subscribed to reflect their current presence to us.
    for item in items.iter().filter(|i| i.subscription.has_to()) {
        if let Some(contact) = reg.find_by_bare_jid(bare_jid(&item.jid)) {
            if contact.is_available() {
                if let Some(theirs) = contact.presence_stanza() {
                    s.send(&theirs.serialize());
                }
            }
        }
    }

    if is_initial {
        s.set_initial_presence_sent();
        message::deliver_offline(reg, s);
        redeliver_pending_subscribes(reg, s);
    }
}

/// Sends `<presence type='unavailable'/>` to every contact subscribed to
/// `s`. Called for explicit unavailable presence and from connection
/// teardown.
pub fn broadcast_unavailable(reg: &dyn Registry, s: &Arc<Session>) {
    if !s.is_available() && !s.initial_presence_sent() {
        return;
    }
    if s.local().is_empty() {
        return;
    }

    let items = roster_snapshot(reg, s);
    let unavail = format!(
        "<presence type='unavailable' from='{}'/>",
        escape_attr(&s.full_jid())
    );

    for item in items.iter().filter(|i| i.subscription.has_from()) {
        if let Some(contact) = reg.find_by_bare_jid(bare_jid(&item.jid)) {
            if !Arc::ptr_eq(&contact, s) {
                contact.send(&unavail);
            }
        }
    }
    s.set_available(false);
}

fn handle_subscribe(reg: &dyn Registry, s: &Arc<Session>, to: &str) {
    let target_bare = bare_jid(to).to_owned();
    let sender_bare = s.bare_jid();

    // Record the outstanding request in our roster.
    let pushed = {
        let mut roster = s.roster.lock().unwrap();
        ensure_loaded(&mut roster, reg, s);
        match roster.find_mut(&target_bare) {
            Some(item) => item.ask_subscribe = true,
            None => roster.add_or_update(
                &target_bare,
                "",
                Some(Subscription::None),
                true,
            ),
        }
        save_roster(&roster, reg, &s.local());
        roster.find(&target_bare).cloned()
    };
    if let Some(item) = pushed {
        roster::push(|data| s.send(data), &s.full_jid(), &item);
    }

    // Deliver the request if the target is online. Nothing is recorded for
    // an offline target; redelivery happens from our ask flag instead.
    if let Some(target) = reg.find_by_bare_jid(&target_bare) {
        target.send(&format!(
            "<presence type='subscribe' from='{}' to='{}'/>",
            escape_attr(&sender_bare),
            escape_attr(&target_bare),
        ));
    }
}

fn handle_subscribed(reg: &dyn Registry, s: &Arc<Session>, to: &str) {
    let target_bare = bare_jid(to).to_owned();
    let sender_bare = s.bare_jid();

    // Approver's side: none -> from, to -> both.
    let pushed = {
        let mut roster = s.roster.lock().unwrap();
        ensure_loaded(&mut roster, reg, s);
        match roster.find_mut(&target_bare) {
            Some(item) => {
                item.subscription = match item.subscription {
                    Subscription::None => Subscription::From,
                    Subscription::To => Subscription::Both,
                    other => other,
                };
            },
            None => roster.add_or_update(
                &target_bare,
                "",
                Some(Subscription::From),
                false,
            ),
        }
        save_roster(&roster, reg, &s.local());
        roster.find(&target_bare).cloned()
    };
    if let Some(item) = pushed {
        roster::push(|data| s.send(data), &s.full_jid(), &item);
    }

    // Requester's side: none -> to, from -> both; the ask is answered.
    let target_local = local_part(&target_bare).to_owned();
    if let Some(target) = reg.find_by_bare_jid(&target_bare) {
        let pushed = {
            let mut roster = target.roster.lock().unwrap();
            ensure_loaded(&mut roster, reg, &target);
            if let Some(item) = roster.find_mut(&sender_bare) {
                item.subscription = match item.subscription {
                    Subscription::None => Subscription::To,
                    Subscription::From => Subscription::Both,
                    other => other,
                };
                item.ask_subscribe = false;
            }
            save_roster(&roster, reg, &target_local);
            roster.find(&sender_bare).cloned()
        };
        if let Some(item) = pushed {
            roster::push(|data| target.send(data), &target.full_jid(), &item);
        }

        // The requester immediately learns our presence.
        if s.is_available() {
            if let Some(pres) = s.presence_stanza() {
                target.send(&pres.serialize());
            }
        }
        target.send(&format!(
            "<presence type='subscribed' from='{}' to='{}'/>",
            escape_attr(&sender_bare),
            escape_attr(&target_bare),
        ));
    } else {
        modify_disk_roster(reg, &target_local, |roster| {
            if let Some(item) = roster.find_mut(&sender_bare) {
                item.subscription = match item.subscription {
                    Subscription::None => Subscription::To,
                    Subscription::From => Subscription::Both,
                    other => other,
                };
                item.ask_subscribe = false;
            }
        });
    }
}

fn handle_unsubscribe(reg: &dyn Registry, s: &Arc<Session>, to: &str) {
    let target_bare = bare_jid(to).to_owned();
    let sender_bare = s.bare_jid();

    // Our side: to -> none, both -> from; any pending ask is withdrawn.
    let pushed = {
        let mut roster = s.roster.lock().unwrap();
        ensure_loaded(&mut roster, reg, s);
        if let Some(item) = roster.find_mut(&target_bare) {
            item.subscription = match item.subscription {
                Subscription::To => Subscription::None,
                Subscription::Both => Subscription::From,
                other => other,
            };
            item.ask_subscribe = false;
            save_roster(&roster, reg, &s.local());
            roster.find(&target_bare).cloned()
        } else {
            None
        }
    };
    if let Some(item) = pushed {
        roster::push(|data| s.send(data), &s.full_jid(), &item);
    }

    // Target's side: from -> none, both -> to.
    let target_local = local_part(&target_bare).to_owned();
    if let Some(target) = reg.find_by_bare_jid(&target_bare) {
        let pushed = {
            let mut roster = target.roster.lock().unwrap();
            ensure_loaded(&mut roster, reg, &target);
            if let Some(item) = roster.find_mut(&sender_bare) {
                item.subscription = match item.subscription {
                    Subscription::From => Subscription::None,
                    Subscription::Both => Subscription::To,
                    other => other,
                };
                save_roster(&roster, reg, &target_local);
                roster.find(&sender_bare).cloned()
            } else {
                None
            }
        };
        if let Some(item) = pushed {
            roster::push(|data| target.send(data), &target.full_jid(), &item);
        }

        target.send(&format!(
            "<presence type='unsubscribe' from='{}' to='{}'/>",
            escape_attr(&sender_bare),
            escape_attr(&target_bare),
        ));
        if s.is_available() {
            target.send(&format!(
                "<presence type='unavailable' from='{}'/>",
                escape_attr(&s.full_jid()),
            ));
        }
    } else {
        modify_disk_roster(reg, &target_local, |roster| {
            if let Some(item) = roster.find_mut(&sender_bare) {
                item.subscription = match item.subscription {
                    Subscription::From => Subscription::None,
                    Subscription::Both => Subscription::To,
                    other => other,
                };
            }
        });
    }
}

fn handle_unsubscribed(reg: &dyn Registry, s: &Arc<Session>, to: &str) {
    let target_bare = bare_jid(to).to_owned();
    let sender_bare = s.bare_jid();

    // Our side: from -> none, both -> to.
    let pushed = {
        let mut roster = s.roster.lock().unwrap();
        ensure_loaded(&mut roster, reg, s);
        if let Some(item) = roster.find_mut(&target_bare) {
            item.subscription = match item.subscription {
                Subscription::From => Subscription::None,
                Subscription::Both => Subscription::To,
                other => other,
            };
            save_roster(&roster, reg, &s.local());
            roster.find(&target_bare).cloned()
        } else {
            None
        }
    };
    if let Some(item) = pushed {
        roster::push(|data| s.send(data), &s.full_jid(), &item);
    }

    // Target's side: to -> none, both -> from; their ask is refused.
    let target_local = local_part(&target_bare).to_owned();
    if let Some(target) = reg.find_by_bare_jid(&target_bare) {
        let pushed = {
            let mut roster = target.roster.lock().unwrap();
            ensure_loaded(&mut roster, reg, &target);
            if let Some(item) = roster.find_mut(&sender_bare) {
                item.subscription = match item.subscription {
                    Subscription::To => Subscription::None,
                    Subscription::Both => Subscription::From,
                    other => other,
                };
                item.ask_subscribe = false;
                save_roster(&roster, reg, &target_local);
                roster.find(&sender_bare).cloned()
            } else {
                None
            }
        };
        if let Some(item) = pushed {
            roster::push(|data| target.send(data), &target.full_jid(), &item);
        }

        target.send(&format!(
            "<presence type='unsubscribed' from='{}' to='{}'/>",
            escape_attr(&sender_bare),
            escape_attr(&target_bare),
        ));
        if s.is_available() {
            target.send(&format!(
                "<presence type='unavailable' from='{}'/>",
                escape_attr(&s.full_jid()),
            ));
        }
    } else {
        modify_disk_roster(reg, &target_local, |roster| {
            if let Some(item) = roster.find_mut(&sender_bare) {
                item.subscription = match item.subscription {
                    Subscription::To => Subscription::None,
                    Subscription::Both => Subscription::From,
                    other => other,
                };
                item.ask_subscribe = false;
            }
        });
    }
}

/// Scans every online session whose roster is already loaded for an
/// unanswered subscribe aimed at `s` and synthesises the request again.
///
/// A subscribe from a user who has since gone offline is not resurfaced
/// until that user logs back in: only loaded rosters are scanned.
pub fn redeliver_pending_subscribes(reg: &dyn Registry, s: &Arc<Session>) {
    let our_bare = s.bare_jid();

    for other in reg.all_sessions() {
        if Arc::ptr_eq(&other, s) || other.local().is_empty() {
            continue;
        }

        let pending = {
            let roster = other.roster.lock().unwrap();
            if roster.loaded {
                roster
                    .items
                    .iter()
                    .filter(|i| i.ask_subscribe && bare_jid(&i.jid) == our_bare)
                    .count()
            } else {
                0
            }
        };

        for _ in 0..pending {
            s.send(&format!(
                "<presence type='subscribe' from='{}' to='{}'/>",
                escape_attr(&other.bare_jid()),
                escape_attr(&our_bare),
            ));
        }
    }
}

// --- helpers ---

fn ensure_loaded(roster: &mut Roster, reg: &dyn Registry, s: &Session) {
    if !roster.loaded {
        *roster = Roster::load(reg.data_dir(), &s.local());
    }
}

fn save_roster(roster: &Roster, reg: &dyn Registry, username: &str) {
    if let Err(e) = roster.save(reg.data_dir(), username) {
        warn!("failed to save roster for '{}': {}", username, e);
    }
}

/// Clones `s`'s roster items for iteration without holding the mutex,
/// loading the roster first if necessary.
fn roster_snapshot(reg: &dyn Registry, s: &Session) -> Vec<Item> {
    let mut roster = s.roster.lock().unwrap();
    ensure_loaded(&mut roster, reg, s);
    roster.items.clone()
}

/// Loads an offline user's roster, applies `mutate`, and saves it, all
/// under the registry's file lock.
fn modify_disk_roster<F: FnOnce(&mut Roster)>(
    reg: &dyn Registry,
    username: &str,
    mutate: F,
) {
    let _guard = reg.file_lock();
    let mut roster = Roster::load(reg.data_dir(), username);
    mutate(&mut roster);
    save_roster(&roster, reg, username);
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::account::user;
    use crate::xmpp::server::Server;
    use crate::xmpp::stanza::Stanza;
    use crate::xmpp::testutil::{pipe_session, read_available};
    use crate::xmpp::NS_CLIENT;

    struct Fixture {
        _dir: tempfile::TempDir,
        server: std::sync::Arc<Server>,
    }

    fn fixture(users: &[&str]) -> Fixture {
        crate::init_test_log();
        let dir = tempfile::TempDir::new().unwrap();
        let server = Server::new("localhost", dir.path(), "unused");
        for name in users {
            user::create(dir.path(), name, "pw").unwrap();
        }
        Fixture { _dir: dir, server }
    }

    fn online(f: &Fixture, name: &str) -> (Arc<Session>, UnixStream) {
        let (session, peer) = pipe_session("localhost");
        session.set_local(name);
        session.set_resource("r");
        f.server.add_session(&session);
        assert!(f.server.register(&session).is_none());
        (session, peer)
    }

    fn preset_roster(session: &Session, items: &[(&str, Subscription, bool)]) {
        let mut roster = session.roster.lock().unwrap();
        roster.loaded = true;
        for &(jid, subscription, ask_subscribe) in items {
            roster.items.push(Item {
                jid: jid.to_owned(),
                name: String::new(),
                subscription,
                ask_subscribe,
            });
        }
    }

    fn sub_of(f: &Fixture, owner: &str, contact: &str) -> (Subscription, bool) {
        let roster = Roster::load(f.server.data_dir(), owner);
        let item = roster
            .find(contact)
            .unwrap_or_else(|| panic!("{} not in {}'s roster", contact, owner));
        (item.subscription, item.ask_subscribe)
    }

    #[test]
    fn subscribe_handshake_reaches_to_from_then_both() {
        let f = fixture(&["zim", "dib"]);
        let (zim, mut zim_peer) = online(&f, "zim");
        let (dib, mut dib_peer) = online(&f, "dib");

        // zim asks to see dib
        handle_subscribe(&*f.server, &zim, "dib@localhost");
        assert_eq!(
            (Subscription::None, true),
            sub_of(&f, "zim", "dib@localhost")
        );
        let pushed = read_available(&mut zim_peer);
        assert!(pushed.contains("jabber:iq:roster"), "got {}", pushed);
        assert!(pushed.contains("ask='subscribe'"));
        let delivered = read_available(&mut dib_peer);
        assert!(delivered.contains(
            "<presence type='subscribe' from='zim@localhost' \
             to='dib@localhost'/>"
        ));

        // dib approves
        handle_subscribed(&*f.server, &dib, "zim@localhost");
        assert_eq!(
            (Subscription::From, false),
            sub_of(&f, "dib", "zim@localhost")
        );
        assert_eq!(
            (Subscription::To, false),
            sub_of(&f, "zim", "dib@localhost")
        );
        assert!(read_available(&mut dib_peer)
            .contains("subscription='from'"));
        let approved = read_available(&mut zim_peer);
        assert!(approved.contains("subscription='to'"));
        assert!(approved.contains(
            "<presence type='subscribed' from='dib@localhost' \
             to='zim@localhost'/>"
        ));

        // the reverse handshake converges to both/both
        handle_subscribe(&*f.server, &dib, "zim@localhost");
        handle_subscribed(&*f.server, &zim, "dib@localhost");
        assert_eq!(
            (Subscription::Both, false),
            sub_of(&f, "zim", "dib@localhost")
        );
        assert_eq!(
            (Subscription::Both, false),
            sub_of(&f, "dib", "zim@localhost")
        );
    }

    #[test]
    fn subscribed_approver_sends_cached_presence() {
        let f = fixture(&["zim", "dib"]);
        let (zim, _zim_peer) = online(&f, "zim");
        let (dib, mut dib_peer) = online(&f, "dib");

        let mut pres = Stanza::new("presence", NS_CLIENT);
        let mut show = Stanza::new("show", NS_CLIENT);
        show.text = "dnd".to_owned();
        pres.children.push(show);
        handle_available(&*f.server, &zim, &pres);

        handle_subscribe(&*f.server, &dib, "zim@localhost");
        read_available(&mut dib_peer);
        handle_subscribed(&*f.server, &zim, "dib@localhost");

        let got = read_available(&mut dib_peer);
        assert!(
            got.contains("<presence from='zim@localhost/r'><show>dnd</show>"),
            "got {}",
            got
        );
    }

    #[test]
    fn subscribed_to_offline_requester_edits_disk_roster() {
        let f = fixture(&["zim", "tak"]);
        let (zim, _zim_peer) = online(&f, "zim");

        // tak asked earlier and has since disconnected
        let tak_roster = Roster {
            items: vec![Item {
                jid: "zim@localhost".to_owned(),
                name: String::new(),
                subscription: Subscription::None,
                ask_subscribe: true,
            }],
            loaded: true,
        };
        tak_roster.save(f.server.data_dir(), "tak").unwrap();

        handle_subscribed(&*f.server, &zim, "tak@localhost");

        assert_eq!(
            (Subscription::From, false),
            sub_of(&f, "zim", "tak@localhost")
        );
        assert_eq!(
            (Subscription::To, false),
            sub_of(&f, "tak", "zim@localhost")
        );
    }

    #[test]
    fn available_broadcasts_and_reflects() {
        let f = fixture(&["zim", "dib"]);
        let (zim, mut zim_peer) = online(&f, "zim");
        let (dib, mut dib_peer) = online(&f, "dib");
        preset_roster(&zim, &[("dib@localhost", Subscription::Both, false)]);
        preset_roster(&dib, &[("zim@localhost", Subscription::Both, false)]);

        handle_available(&*f.server, &dib, &Stanza::new("presence", NS_CLIENT));
        read_available(&mut zim_peer);
        read_available(&mut dib_peer);

        handle_available(&*f.server, &zim, &Stanza::new("presence", NS_CLIENT));

        // dib sees zim come online
        assert!(read_available(&mut dib_peer)
            .contains("<presence from='zim@localhost/r'/>"));
        // and dib's cached presence is reflected back to zim
        assert!(read_available(&mut zim_peer)
            .contains("<presence from='dib@localhost/r'/>"));
    }

    #[test]
    fn unavailable_broadcast_reaches_subscribers_once_available() {
        let f = fixture(&["zim", "dib"]);
        let (zim, _zim_peer) = online(&f, "zim");
        let (dib, mut dib_peer) = online(&f, "dib");
        preset_roster(&zim, &[("dib@localhost", Subscription::From, false)]);

        // not yet available: teardown broadcasts nothing
        broadcast_unavailable(&*f.server, &zim);
        assert_eq!("", read_available(&mut dib_peer));

        handle_available(&*f.server, &zim, &Stanza::new("presence", NS_CLIENT));
        read_available(&mut dib_peer);
        broadcast_unavailable(&*f.server, &zim);

        assert!(read_available(&mut dib_peer).contains(
            "<presence type='unavailable' from='zim@localhost/r'/>"
        ));
        assert!(!zim.is_available());
    }

    #[test]
    fn unsubscribe_algebra_and_notifications() {
        let f = fixture(&["zim", "dib"]);
        let (zim, _zim_peer) = online(&f, "zim");
        let (dib, mut dib_peer) = online(&f, "dib");
        preset_roster(&zim, &[("dib@localhost", Subscription::Both, false)]);
        preset_roster(&dib, &[("zim@localhost", Subscription::Both, false)]);
        handle_available(&*f.server, &zim, &Stanza::new("presence", NS_CLIENT));
        read_available(&mut dib_peer);

        handle_unsubscribe(&*f.server, &zim, "dib@localhost");

        assert_eq!(
            (Subscription::From, false),
            sub_of(&f, "zim", "dib@localhost")
        );
        assert_eq!(
            (Subscription::To, false),
            sub_of(&f, "dib", "zim@localhost")
        );
        let got = read_available(&mut dib_peer);
        assert!(got.contains("subscription='to'"));
        assert!(got.contains(
            "<presence type='unsubscribe' from='zim@localhost' \
             to='dib@localhost'/>"
        ));
        // zim was available, so dib also sees an unavailable
        assert!(got.contains(
            "<presence type='unavailable' from='zim@localhost/r'/>"
        ));
    }

    #[test]
    fn unsubscribed_algebra_clears_ask() {
        let f = fixture(&["zim", "dib"]);
        let (zim, _zim_peer) = online(&f, "zim");
        let (dib, mut dib_peer) = online(&f, "dib");
        preset_roster(&zim, &[("dib@localhost", Subscription::From, false)]);
        preset_roster(&dib, &[("zim@localhost", Subscription::None, true)]);

        handle_unsubscribed(&*f.server, &zim, "dib@localhost");

        assert_eq!(
            (Subscription::None, false),
            sub_of(&f, "zim", "dib@localhost")
        );
        assert_eq!(
            (Subscription::None, false),
            sub_of(&f, "dib", "zim@localhost")
        );
        assert!(read_available(&mut dib_peer).contains(
            "<presence type='unsubscribed' from='zim@localhost' \
             to='dib@localhost'/>"
        ));
    }

    #[test]
    fn pending_subscribes_resurface_on_initial_presence() {
        let f = fixture(&["zim", "dib"]);
        let (zim, _zim_peer) = online(&f, "zim");
        preset_roster(&zim, &[("dib@localhost", Subscription::None, true)]);

        let (dib, mut dib_peer) = online(&f, "dib");
        handle_available(&*f.server, &dib, &Stanza::new("presence", NS_CLIENT));

        assert!(read_available(&mut dib_peer).contains(
            "<presence type='subscribe' from='zim@localhost' \
             to='dib@localhost'/>"
        ));

        // a second available presence does not repeat the redelivery
        handle_available(&*f.server, &dib, &Stanza::new("presence", NS_CLIENT));
        assert!(!read_available(&mut dib_peer).contains("type='subscribe'"));
    }

    #[test]
    fn unknown_presence_type_is_ignored() {
        let f = fixture(&["zim"]);
        let (zim, mut zim_peer) = online(&f, "zim");
        let mut pres = Stanza::new("presence", NS_CLIENT);
        pres.set_attr("type", "probe");
        assert_eq!(Routing::Continue, handle(&*f.server, &zim, &pres));
        assert_eq!("", read_available(&mut zim_peer));
    }
}
