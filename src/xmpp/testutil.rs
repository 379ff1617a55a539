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

//! Helpers shared by the protocol unit tests: sessions backed by
//! socketpairs instead of TCP connections.

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use super::session::Session;

/// Creates a session whose connection is one end of a socketpair, returning
/// the far end so the test can observe what the session wrote.
pub fn pipe_session(domain: &str) -> (Arc<Session>, UnixStream) {
    let (near, far) = UnixStream::pair().unwrap();
    let session = Session::new(
        Box::new(near.try_clone().unwrap()),
        Box::new(near),
        domain,
        "test".to_owned(),
    );
    far.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    (session, far)
}

/// Drains whatever the session has written so far, stopping at the first
/// read timeout.
pub fn read_available(stream: &mut UnixStream) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
