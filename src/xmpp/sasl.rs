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

//! SASL PLAIN (RFC 4616) over the pre-auth stream.
//!
//! PLAIN is the only supported mechanism; this server is deliberately
//! plaintext end to end.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{info, warn};

use super::session::{Phase, Registry, Routing, Session};
use super::stanza::Stanza;
use super::NS_SASL;
use crate::account::user;

/// Handles an `<auth>` element. On success the session becomes
/// authenticated and the stream restarts on the same byte source.
pub fn handle(reg: &dyn Registry, s: &Session, node: &Stanza) -> Routing {
    let mechanism = node.attr("mechanism").unwrap_or("");
    if !mechanism.eq_ignore_ascii_case("PLAIN") {
        warn!(
            "unsupported SASL mechanism '{}' from {}",
            mechanism,
            s.remote_addr()
        );
        send_failure(s, "invalid-mechanism");
        return Routing::Continue;
    }

    let payload = node.text.trim();
    let decoded = match BASE64.decode(payload) {
        Ok(decoded) if !decoded.is_empty() => decoded,
        _ => {
            warn!("undecodable SASL PLAIN payload from {}", s.remote_addr());
            send_failure(s, "not-authorized");
            return Routing::Continue;
        },
    };

    let (authcid, password) = match parse_plain(&decoded) {
        Some(credentials) => credentials,
        None => {
            warn!("malformed SASL PLAIN payload from {}", s.remote_addr());
            send_failure(s, "not-authorized");
            return Routing::Continue;
        },
    };

    if !user::check_password(reg.data_dir(), &authcid, &password) {
        info!("auth failed for '{}' from {}", authcid, s.remote_addr());
        send_failure(s, "not-authorized");
        return Routing::Continue;
    }

    info!("authenticated '{}' from {}", authcid, s.remote_addr());
    s.set_local(&authcid);
    s.set_authenticated();
    s.set_phase(Phase::Authenticated);
    s.send(&format!("<success xmlns='{}'/>", NS_SASL));
    Routing::RestartStream
}

fn send_failure(s: &Session, condition: &str) {
    s.send(&format!("<failure xmlns='{}'><{}/></failure>", NS_SASL, condition));
}

/// Splits the decoded `[authzid]\0authcid\0passwd` message. The authzid is
/// ignored; empty authcid or password is rejected.
fn parse_plain(decoded: &[u8]) -> Option<(String, String)> {
    let mut parts = decoded.splitn(3, |&b| b == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    if authcid.is_empty() || password.is_empty() {
        return None;
    }
    Some((
        String::from_utf8(authcid.to_vec()).ok()?,
        String::from_utf8(password.to_vec()).ok()?,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_plain_splits_fields() {
        assert_eq!(
            Some(("zim".to_owned(), "s3cret".to_owned())),
            parse_plain(b"\0zim\0s3cret")
        );
        // authzid present
        assert_eq!(
            Some(("zim".to_owned(), "s3cret".to_owned())),
            parse_plain(b"irken\0zim\0s3cret")
        );
        // NULs in the password belong to the password
        assert_eq!(
            Some(("zim".to_owned(), "a\0b".to_owned())),
            parse_plain(b"\0zim\0a\0b")
        );
    }

    #[test]
    fn parse_plain_rejects_malformed() {
        assert_eq!(None, parse_plain(b""));
        assert_eq!(None, parse_plain(b"no-separators"));
        assert_eq!(None, parse_plain(b"\0only-user"));
        assert_eq!(None, parse_plain(b"\0\0password"));
        assert_eq!(None, parse_plain(b"\0user\0"));
    }
}
