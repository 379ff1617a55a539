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

//! The on-disk user store.
//!
//! Each account is a directory `<dataDir>/<username>/` holding:
//!
//! - `user.conf`: line-oriented `key = value`; the only recognised key is
//!   `password`, stored in plain text. This is a known security defect kept
//!   for on-disk compatibility: there is no marker that would let us
//!   distinguish a hashed value from a legacy plaintext one.
//! - `roster.xml`: the contact list (see `account::roster`).
//! - `offline/`: spooled stanzas awaiting delivery (see `xmpp::message`).
//!
//! The username doubles as the directory name, so `valid_username` is also a
//! path-safety check.

use std::fs;
use std::path::Path;

use crate::support::error::Error;

/// Returns true if `name` is usable as an account name: non-empty and
/// containing only ASCII letters, digits, `.`, `-`, and `_`.
pub fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Returns true if the account exists, i.e. its `user.conf` is present.
pub fn exists(data_dir: &Path, username: &str) -> bool {
    data_dir.join(username).join("user.conf").is_file()
}

/// Creates the account directory tree: `user.conf`, an empty roster, and the
/// offline spool directory.
pub fn create(
    data_dir: &Path,
    username: &str,
    password: &str,
) -> Result<(), Error> {
    if !valid_username(username) {
        return Err(Error::InvalidUsername);
    }
    if exists(data_dir, username) {
        return Err(Error::UserExists);
    }

    let user_dir = data_dir.join(username);
    fs::create_dir_all(&user_dir)?;
    fs::write(
        user_dir.join("user.conf"),
        format!("password = {}\n", password),
    )?;
    fs::write(user_dir.join("roster.xml"), "<?xml version=\"1.0\"?>\n<roster/>\n")?;
    fs::create_dir(user_dir.join("offline"))?;
    Ok(())
}

/// Returns true if `password` matches the stored one exactly (after trimming
/// surrounding whitespace from the stored value).
pub fn check_password(data_dir: &Path, username: &str, password: &str) -> bool {
    let path = data_dir.join(username).join("user.conf");
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => return false,
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "password" {
                return value.trim() == password;
            }
        }
    }
    false
}

/// Rewrites `user.conf` with the new password, unconditionally.
pub fn change_password(
    data_dir: &Path,
    username: &str,
    password: &str,
) -> Result<(), Error> {
    let path = data_dir.join(username).join("user.conf");
    fs::write(path, format!("password = {}\n", password))?;
    Ok(())
}

/// Removes the account's entire directory tree.
pub fn delete(data_dir: &Path, username: &str) -> Result<(), Error> {
    fs::remove_dir_all(data_dir.join(username))?;
    Ok(())
}
