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

//! Service discovery (XEP-0030). The server is the only entity: disco#info
//! reports its identity and protocol features, disco#items is empty.

use std::fmt::Write as _;

use super::session::{Registry, Routing, Session};
use super::stanza::{escape_attr, Stanza};

const FEATURES: &[&str] = &[
    "http://jabber.org/protocol/disco#info",
    "http://jabber.org/protocol/disco#items",
    "jabber:iq:roster",
    "jabber:iq:register",
    "urn:xmpp:delay",
];

pub fn handle_info(reg: &dyn Registry, s: &Session, node: &Stanza) -> Routing {
    let mut out = result_iq_open(reg, s, node.attr("id"));
    out.push_str("><query xmlns='http://jabber.org/protocol/disco#info'>");
    out.push_str("<identity category='server' type='im' name='xmppd'/>");
    for feature in FEATURES {
        let _ = write!(out, "<feature var='{}'/>", feature);
    }
    out.push_str("</query></iq>");
    s.send(&out);
    Routing::Continue
}

pub fn handle_items(
    reg: &dyn Registry,
    s: &Session,
    node: &Stanza,
) -> Routing {
    let mut out = result_iq_open(reg, s, node.attr("id"));
    out.push_str(
        "><query xmlns='http://jabber.org/protocol/disco#items'/></iq>",
    );
    s.send(&out);
    Routing::Continue
}

fn result_iq_open(reg: &dyn Registry, s: &Session, id: Option<&str>) -> String {
    let mut out = format!(
        "<iq type='result' from='{}' to='{}'",
        escape_attr(reg.domain()),
        escape_attr(&s.full_jid()),
    );
    if let Some(id) = id {
        let _ = write!(out, " id='{}'", escape_attr(id));
    }
    out
}
