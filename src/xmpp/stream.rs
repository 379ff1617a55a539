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

use log::{debug, warn};

use super::session::{Phase, Registry, Routing, Session};
use super::stanza::{escape_attr, generate_id, Stanza};

/// Handles a `<stream:stream>` open from the client: validates the `to`
/// host, replies with our stream header, and advertises features for the
/// current phase.
pub fn handle_open(
    reg: &dyn Registry,
    s: &Session,
    node: &Stanza,
) -> Routing {
    let to = node.attr("to").unwrap_or("");
    debug!("stream open to='{}' from {}", to, s.describe());

    if !to.is_empty() && to != reg.domain() {
        warn!(
            "stream to unknown host '{}' (serving '{}') from {}",
            to,
            reg.domain(),
            s.remote_addr()
        );
        send_error(s, "host-unknown");
        return Routing::Close;
    }

    let stream_id = generate_id(16);
    s.send(&format!(
        "<?xml version='1.0'?>\
         <stream:stream from='{}' id='{}' \
         xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         version='1.0'>",
        escape_attr(reg.domain()),
        stream_id,
    ));

    if s.is_authenticated() {
        s.send(
            "<stream:features>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'>\
             <optional/>\
             </session>\
             </stream:features>",
        );
    } else {
        s.send(
            "<stream:features>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism>\
             </mechanisms>\
             <register xmlns='http://jabber.org/features/iq-register'/>\
             </stream:features>",
        );
    }

    s.set_phase(Phase::StreamOpened);
    Routing::Continue
}

/// Sends a stream-level error and the closing stream tag. The caller is
/// responsible for dropping the connection (`Routing::Close`).
pub fn send_error(s: &Session, condition: &str) {
    s.send(&format!(
        "<stream:error>\
         <{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
         </stream:error></stream:stream>",
        condition,
    ));
}
