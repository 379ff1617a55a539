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

pub mod disco;
pub mod message;
pub mod presence;
pub mod reader;
pub mod register;
pub mod router;
pub mod sasl;
pub mod server;
pub mod session;
pub mod stanza;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_ROSTER: &str = "jabber:iq:roster";
pub const NS_REGISTER: &str = "jabber:iq:register";
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
pub const NS_DELAY: &str = "urn:xmpp:delay";

/// Strips any resource part from a JID.
pub fn bare_jid(jid: &str) -> &str {
    match jid.find('/') {
        Some(slash) => &jid[..slash],
        None => jid,
    }
}

/// Returns the part before `@`, or the whole string if there is none.
pub fn local_part(jid: &str) -> &str {
    match jid.find('@') {
        Some(at) => &jid[..at],
        None => jid,
    }
}
