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

use std::fs;
use std::io;
use std::path::Path;

/// Runtime configuration for the server.
///
/// Values come from three layers, later layers overriding earlier ones:
/// compiled-in defaults, the configuration file, and command-line flags.
///
/// The configuration file is line-oriented `key = value` text with `#`
/// comments. It is an external format shared with other tooling and is parsed
/// by hand rather than through a serialisation framework.
#[derive(Debug, Clone)]
pub struct Config {
    pub domain: String,
    pub port: u16,
    pub bind_address: String,
    pub data_dir: String,
    pub log_file: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            domain: "localhost".to_owned(),
            port: 5222,
            bind_address: "0.0.0.0".to_owned(),
            data_dir: "./data".to_owned(),
            log_file: "./xmppd.log".to_owned(),
            log_level: "INFO".to_owned(),
        }
    }
}

impl Config {
    /// Merges settings from the file at `path` into `self`.
    ///
    /// Unknown keys and malformed lines are ignored; a malformed `port` value
    /// leaves the current port unchanged.
    pub fn load_file(&mut self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "domain" => self.domain = value.to_owned(),
                "port" => {
                    if let Ok(port) = value.parse() {
                        self.port = port;
                    }
                },
                "bind_address" => self.bind_address = value.to_owned(),
                "datadir" => self.data_dir = value.to_owned(),
                "logfile" => self.log_file = value.to_owned(),
                "loglevel" => self.log_level = value.to_owned(),
                _ => (),
            }
        }
        Ok(())
    }
}
