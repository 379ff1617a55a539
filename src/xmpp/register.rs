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

//! In-band registration (XEP-0077): account creation before authentication,
//! password change and account removal after.

use log::{error, info};

use super::session::{Registry, Routing, Session};
use super::stanza::Stanza;
use super::{NS_CLIENT, NS_REGISTER};
use crate::account::user;
use crate::support::error::Error;

/// Handles an IQ whose first child is in `jabber:iq:register`.
pub fn handle_iq(reg: &dyn Registry, s: &Session, node: &Stanza) -> Routing {
    let iq_type = node.attr("type").unwrap_or("");
    let id = node.attr("id").unwrap_or("");

    match iq_type {
        "get" => handle_get(s, id),
        "set" => handle_set(reg, s, node, id),
        _ => {
            s.send_stanza_error(node, "cancel", "bad-request");
            Routing::Continue
        },
    }
}

fn handle_get(s: &Session, id: &str) -> Routing {
    let mut query = Stanza::new("query", NS_REGISTER);
    let mut instructions = Stanza::new("instructions", NS_REGISTER);
    instructions.text = "Choose a username and password.".to_owned();
    query.children.push(instructions);
    query.children.push(Stanza::new("username", NS_REGISTER));
    query.children.push(Stanza::new("password", NS_REGISTER));

    let mut iq = result_iq(s, id, false);
    iq.children.push(query);
    s.send_node(&iq);
    Routing::Continue
}

fn handle_set(
    reg: &dyn Registry,
    s: &Session,
    node: &Stanza,
    id: &str,
) -> Routing {
    let query = match node.first_child() {
        Some(query) => query,
        None => {
            s.send_stanza_error(node, "modify", "bad-request");
            return Routing::Continue;
        },
    };

    if query.find_child("remove").is_some() {
        if !s.is_authenticated() {
            s.send_stanza_error(node, "cancel", "not-allowed");
            return Routing::Continue;
        }
        // Acknowledge first; the reply could not be delivered after the
        // connection is torn down.
        s.send_node(&result_iq(s, id, true));
        let username = s.local();
        match user::delete(reg.data_dir(), &username) {
            Ok(()) => info!("account deleted: '{}'", username),
            Err(e) => error!("user delete failed for '{}': {}", username, e),
        }
        return Routing::Close;
    }

    let username = query.child_text("username");
    let password = query.child_text("password");
    if username.is_empty() || password.is_empty() {
        s.send_stanza_error(node, "modify", "bad-request");
        return Routing::Continue;
    }

    if !s.is_authenticated() {
        // Pre-auth: create a new account. This does not log the client in.
        match user::create(reg.data_dir(), username, password) {
            Ok(()) => {
                info!("new account registered: '{}'", username);
                s.send_node(&result_iq(s, id, false));
            },
            Err(Error::UserExists) => {
                s.send_stanza_error(node, "cancel", "conflict");
            },
            Err(Error::InvalidUsername) => {
                s.send_stanza_error(node, "modify", "not-acceptable");
            },
            Err(_) => {
                s.send_stanza_error(node, "wait", "internal-server-error");
            },
        }
        return Routing::Continue;
    }

    // Post-auth: password change, only for the account we are logged in as.
    if username != s.local() {
        s.send_stanza_error(node, "cancel", "not-allowed");
        return Routing::Continue;
    }
    match user::change_password(reg.data_dir(), username, password) {
        Ok(()) => {
            info!("password changed for '{}'", username);
            s.send_node(&result_iq(s, id, true));
        },
        Err(_) => {
            s.send_stanza_error(node, "wait", "internal-server-error");
        },
    }
    Routing::Continue
}

/// Builds a `<iq type='result'>` reply stamped `from` our domain. With
/// `include_to`, the session's full JID is stamped as `to`. Left childless
/// it serialises self-closing.
fn result_iq(s: &Session, id: &str, include_to: bool) -> Stanza {
    let mut iq = Stanza::new("iq", NS_CLIENT);
    iq.set_attr("type", "result");
    if !id.is_empty() {
        iq.set_attr("id", id);
    }
    iq.set_attr("from", s.domain());
    if include_to {
        let jid = s.full_jid();
        if !jid.is_empty() {
            iq.set_attr("to", &jid);
        }
    }
    iq
}
