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

//! The stanza router.
//!
//! Before authentication only SASL `<auth>` and in-band registration IQs are
//! admitted. After it, stanzas dispatch by name, then IQs by the namespace
//! of their first child. Resource binding and session establishment live
//! here too, as do roster get/set.

use std::fmt::Write as _;
use std::sync::Arc;

use log::{debug, info};

use super::session::{Phase, Registry, Routing, Session};
use super::stanza::{escape_attr, escape_text, generate_id, Stanza};
use super::{
    bare_jid, disco, message, presence, register, sasl, stream, NS_BIND,
    NS_DISCO_INFO, NS_DISCO_ITEMS, NS_REGISTER, NS_ROSTER, NS_SESSION,
};
use crate::account::roster::{self, Item, Roster, Subscription};

/// Locks the session's roster, loading it from disk first if this is the
/// first access.
fn locked_roster<'a>(
    reg: &dyn Registry,
    s: &'a Session,
) -> std::sync::MutexGuard<'a, Roster> {
    let mut roster = s.roster.lock().unwrap();
    if !roster.loaded {
        *roster = Roster::load(reg.data_dir(), &s.local());
    }
    roster
}

/// Dispatches one stanza.
pub fn route(
    reg: &dyn Registry,
    s: &Arc<Session>,
    node: &mut Stanza,
) -> Routing {
    debug!(
        "stanza '{}' ns '{}' phase {:?} from {}",
        node.name,
        node.ns,
        s.phase(),
        s.describe()
    );

    if s.phase() == Phase::StreamOpened && !s.is_authenticated() {
        match node.name.as_str() {
            "auth" => return sasl::handle(reg, s, node),
            "iq" => {
                if matches!(node.first_child(), Some(c) if c.ns == NS_REGISTER)
                {
                    return register::handle_iq(reg, s, node);
                }
                // Other IQs draw a stanza error; the stream survives.
                s.send_stanza_error(node, "cancel", "not-allowed");
                return Routing::Continue;
            },
            _ => {
                stream::send_error(s, "not-authorized");
                return Routing::Close;
            },
        }
    }

    match node.name.as_str() {
        "iq" => handle_iq(reg, s, node),
        "message" => {
            if !stanza_phase_ok(s) {
                stream::send_error(s, "not-authorized");
                return Routing::Close;
            }
            message::handle(reg, s, node)
        },
        "presence" => {
            if !stanza_phase_ok(s) {
                stream::send_error(s, "not-authorized");
                return Routing::Close;
            }
            presence::handle(reg, s, node)
        },
        _ => {
            stream::send_error(s, "unsupported-stanza-type");
            Routing::Close
        },
    }
}

fn stanza_phase_ok(s: &Session) -> bool {
    matches!(s.phase(), Phase::Bound | Phase::SessionActive)
}

fn handle_iq(
    reg: &dyn Registry,
    s: &Arc<Session>,
    node: &mut Stanza,
) -> Routing {
    let iq_type = node.attr("type").unwrap_or("").to_owned();
    let to = node.attr("to").unwrap_or("").to_owned();

    // Replies route straight to their target user.
    if iq_type == "result" || iq_type == "error" {
        if !to.is_empty() && !is_server_jid(&to, reg.domain()) {
            if let Some(target) = reg.find_by_bare_jid(bare_jid(&to)) {
                node.set_attr("from", &s.full_jid());
                target.send_node(node);
            }
        }
        return Routing::Continue;
    }

    let child_ns = node.first_child().map(|c| c.ns.clone()).unwrap_or_default();

    match child_ns.as_str() {
        NS_BIND => handle_bind(reg, s, node),
        NS_SESSION => handle_session_iq(s, node),
        NS_ROSTER => {
            if !stanza_phase_ok(s) {
                s.send_stanza_error(node, "cancel", "not-allowed");
                return Routing::Continue;
            }
            handle_roster_iq(reg, s, node)
        },
        NS_REGISTER => register::handle_iq(reg, s, node),
        NS_DISCO_INFO => {
            if !stanza_phase_ok(s) {
                s.send_stanza_error(node, "cancel", "not-allowed");
                return Routing::Continue;
            }
            disco::handle_info(reg, s, node)
        },
        NS_DISCO_ITEMS => {
            if !stanza_phase_ok(s) {
                s.send_stanza_error(node, "cancel", "not-allowed");
                return Routing::Continue;
            }
            disco::handle_items(reg, s, node)
        },
        _ => {
            // Unknown namespace: forward to another online user if
            // addressed to one, otherwise we have nothing to offer.
            if !to.is_empty()
                && !is_server_jid(&to, reg.domain())
                && stanza_phase_ok(s)
            {
                if let Some(target) = reg.find_by_bare_jid(bare_jid(&to)) {
                    node.set_attr("from", &s.full_jid());
                    target.send_node(node);
                    return Routing::Continue;
                }
            }
            s.send_stanza_error(node, "cancel", "service-unavailable");
            Routing::Continue
        },
    }
}

/// Resource binding (RFC 6120 §7). Registers the session under its bare JID
/// and kicks any previous holder.
fn handle_bind(
    reg: &dyn Registry,
    s: &Arc<Session>,
    node: &Stanza,
) -> Routing {
    if s.phase() != Phase::Authenticated && s.phase() != Phase::StreamOpened {
        s.send_stanza_error(node, "cancel", "not-allowed");
        return Routing::Continue;
    }

    let mut resource = node
        .first_child()
        .map(|bind| bind.child_text("resource").to_owned())
        .unwrap_or_default();
    if resource.is_empty() {
        resource = generate_id(8);
    }

    s.set_resource(&resource);
    s.set_phase(Phase::Bound);
    let full_jid = s.full_jid();

    if let Some(old) = reg.register(s) {
        info!("session conflict, kicking old session of {}", old.bare_jid());
        stream::send_error(&old, "conflict");
        old.close();
    }

    let mut out = String::from("<iq type='result'");
    if let Some(id) = node.attr("id") {
        let _ = write!(out, " id='{}'", escape_attr(id));
    }
    let _ = write!(
        out,
        "><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
         <jid>{}</jid></bind></iq>",
        escape_text(&full_jid)
    );
    s.send(&out);

    info!("resource bound: {}", full_jid);
    Routing::Continue
}

/// Session establishment (RFC 3921, kept for older clients): a pure ack.
fn handle_session_iq(s: &Session, node: &Stanza) -> Routing {
    s.set_phase(Phase::SessionActive);

    let mut out = String::from("<iq type='result'");
    if let Some(id) = node.attr("id") {
        let _ = write!(out, " id='{}'", escape_attr(id));
    }
    out.push_str("/>");
    s.send(&out);

    info!("session established: {}", s.full_jid());
    Routing::Continue
}

fn handle_roster_iq(
    reg: &dyn Registry,
    s: &Arc<Session>,
    node: &Stanza,
) -> Routing {
    let iq_type = node.attr("type").unwrap_or("");
    let id = node.attr("id").unwrap_or("");

    match iq_type {
        "get" => {
            let items: Vec<Item> = locked_roster(reg, s).items.clone();

            let mut out = String::from("<iq type='result'");
            if !id.is_empty() {
                let _ = write!(out, " id='{}'", escape_attr(id));
            }
            let _ = write!(out, " to='{}'", escape_attr(&s.full_jid()));
            out.push_str("><query xmlns='jabber:iq:roster'>");
            for item in &items {
                let _ = write!(out, "<item jid='{}'", escape_attr(&item.jid));
                if !item.name.is_empty() {
                    let _ = write!(out, " name='{}'", escape_attr(&item.name));
                }
                let _ = write!(
                    out,
                    " subscription='{}'",
                    item.subscription.as_str()
                );
                if item.ask_subscribe {
                    out.push_str(" ask='subscribe'");
                }
                out.push_str("/>");
            }
            out.push_str("</query></iq>");
            s.send(&out);
        },

        "set" => {
            let item_el = match node
                .first_child()
                .and_then(|query| query.find_child("item"))
            {
                Some(item_el) => item_el,
                None => {
                    s.send_stanza_error(node, "modify", "bad-request");
                    return Routing::Continue;
                },
            };
            let jid = match item_el.attr("jid") {
                Some(jid) if !jid.is_empty() => jid.to_owned(),
                _ => {
                    s.send_stanza_error(node, "modify", "bad-request");
                    return Routing::Continue;
                },
            };
            let item_name = item_el.attr("name").unwrap_or("").to_owned();
            let sub = item_el.attr("subscription").unwrap_or("");

            if sub == "remove" {
                {
                    let mut roster = locked_roster(reg, s);
                    roster.remove(&jid);
                    if let Err(e) = roster.save(reg.data_dir(), &s.local()) {
                        log::warn!(
                            "failed to save roster for '{}': {}",
                            s.local(),
                            e
                        );
                    }
                }
                send_result(s, id);
                roster::push(
                    |data| s.send(data),
                    &s.full_jid(),
                    &Item {
                        jid,
                        name: String::new(),
                        subscription: Subscription::Remove,
                        ask_subscribe: false,
                    },
                );
            } else {
                // Only the display name is client-mutable through a roster
                // set; subscription state belongs to the presence engine.
                let updated = {
                    let mut roster = locked_roster(reg, s);
                    let (existing_sub, existing_ask) = roster
                        .find(&jid)
                        .map(|i| (i.subscription, i.ask_subscribe))
                        .unwrap_or((Subscription::None, false));
                    roster.add_or_update(
                        &jid,
                        &item_name,
                        Some(existing_sub),
                        existing_ask,
                    );
                    if let Err(e) = roster.save(reg.data_dir(), &s.local()) {
                        log::warn!(
                            "failed to save roster for '{}': {}",
                            s.local(),
                            e
                        );
                    }
                    roster.find(&jid).cloned()
                };
                send_result(s, id);
                if let Some(item) = updated {
                    roster::push(|data| s.send(data), &s.full_jid(), &item);
                }
            }
        },

        _ => s.send_stanza_error(node, "cancel", "feature-not-implemented"),
    }

    Routing::Continue
}

fn send_result(s: &Session, id: &str) {
    let mut out = String::from("<iq type='result'");
    if !id.is_empty() {
        let _ = write!(out, " id='{}'", escape_attr(id));
    }
    out.push_str("/>");
    s.send(&out);
}

fn is_server_jid(jid: &str, domain: &str) -> bool {
    jid.is_empty() || jid == domain
}
