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

//! Per-user contact lists.
//!
//! A roster lives in `<dataDir>/<user>/roster.xml` and is loaded lazily into
//! the owning session. Item order is insertion order and survives a
//! save/load round trip.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::support::error::Error;
use crate::xmpp::reader::StanzaReader;
use crate::xmpp::stanza::escape_attr;

/// The mutual-visibility state between the roster owner and a contact.
///
/// `Remove` never appears in a stored roster; it exists only on the wire,
/// inside a roster push acknowledging deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    /// Parses a subscription attribute; anything unrecognised (including
    /// absence) is `None`.
    pub fn parse(s: &str) -> Self {
        match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    /// True if the contact may see the owner's presence.
    pub fn has_from(self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }

    /// True if the owner may see the contact's presence.
    pub fn has_to(self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

/// One contact in a roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub jid: String,
    pub name: String,
    pub subscription: Subscription,
    /// There is an outstanding outbound subscribe not yet answered.
    pub ask_subscribe: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub items: Vec<Item>,
    pub loaded: bool,
}

impl Roster {
    /// Reads `<dataDir>/<user>/roster.xml`.
    ///
    /// A missing or unparsable file is treated as an empty roster, not an
    /// error; either way the result has `loaded` set so callers do not retry.
    pub fn load(data_dir: &Path, username: &str) -> Roster {
        let empty = Roster {
            items: Vec::new(),
            loaded: true,
        };

        let path = data_dir.join(username).join("roster.xml");
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return empty,
        };

        let root = match StanzaReader::new(BufReader::new(file)).read_stanza()
        {
            Ok(Some(root)) => root,
            _ => return empty,
        };

        let mut roster = empty;
        for child in root.children.iter().filter(|c| c.name == "item") {
            roster.items.push(Item {
                jid: child.attr("jid").unwrap_or("").to_owned(),
                name: child.attr("name").unwrap_or("").to_owned(),
                subscription: Subscription::parse(
                    child.attr("subscription").unwrap_or(""),
                ),
                ask_subscribe: child.attr("ask") == Some("subscribe"),
            });
        }
        roster
    }

    /// Writes the roster back to `<dataDir>/<user>/roster.xml`.
    pub fn save(&self, data_dir: &Path, username: &str) -> Result<(), Error> {
        let mut out = String::from("<?xml version=\"1.0\"?>\n<roster>\n");
        for item in &self.items {
            let _ = write!(out, "  <item jid=\"{}\"", escape_quoted(&item.jid));
            if !item.name.is_empty() {
                let _ = write!(out, " name=\"{}\"", escape_quoted(&item.name));
            }
            let _ =
                write!(out, " subscription=\"{}\"", item.subscription.as_str());
            if item.ask_subscribe {
                out.push_str(" ask=\"subscribe\"");
            }
            out.push_str("/>\n");
        }
        out.push_str("</roster>\n");

        fs::write(data_dir.join(username).join("roster.xml"), out)?;
        Ok(())
    }

    pub fn find(&self, jid: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.jid == jid)
    }

    pub fn find_mut(&mut self, jid: &str) -> Option<&mut Item> {
        self.items.iter_mut().find(|i| i.jid == jid)
    }

    /// Inserts or updates an item.
    ///
    /// For an existing item an empty `name` and a `None` subscription leave
    /// the stored values alone; `ask` is always overwritten.
    pub fn add_or_update(
        &mut self,
        jid: &str,
        name: &str,
        subscription: Option<Subscription>,
        ask: bool,
    ) {
        if let Some(item) = self.find_mut(jid) {
            if !name.is_empty() {
                item.name = name.to_owned();
            }
            if let Some(subscription) = subscription {
                item.subscription = subscription;
            }
            item.ask_subscribe = ask;
            return;
        }
        self.items.push(Item {
            jid: jid.to_owned(),
            name: name.to_owned(),
            subscription: subscription.unwrap_or_default(),
            ask_subscribe: ask,
        });
    }

    /// Removes the item with the given JID. Returns true if it was present.
    pub fn remove(&mut self, jid: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.jid != jid);
        self.items.len() != before
    }
}

static PUSH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sends a roster-push IQ carrying a single item through `send` (typically a
/// session's write entry point). Push ids are `rp<N>` with a process-wide
/// counter.
pub fn push<F: Fn(&str)>(send: F, full_jid: &str, item: &Item) {
    let id = PUSH_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;

    let mut out = String::new();
    let _ = write!(
        out,
        "<iq type='set' id='rp{}' to='{}'>\
         <query xmlns='jabber:iq:roster'><item jid='{}'",
        id,
        escape_attr(full_jid),
        escape_attr(&item.jid)
    );
    if !item.name.is_empty() {
        let _ = write!(out, " name='{}'", escape_attr(&item.name));
    }
    let _ = write!(out, " subscription='{}'", item.subscription.as_str());
    if item.ask_subscribe {
        out.push_str(" ask='subscribe'");
    }
    out.push_str("/></query></iq>");
    send(&out);
}

/// Escapes a string for use inside a double-quoted attribute value.
fn escape_quoted(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('"', "&quot;")
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;

    fn sample() -> Roster {
        Roster {
            items: vec![
                Item {
                    jid: "dib@localhost".to_owned(),
                    name: "Dib".to_owned(),
                    subscription: Subscription::Both,
                    ask_subscribe: false,
                },
                Item {
                    jid: "gaz@localhost".to_owned(),
                    name: String::new(),
                    subscription: Subscription::None,
                    ask_subscribe: true,
                },
                Item {
                    jid: "tak@localhost".to_owned(),
                    name: "Tak \"the\" <hideous>".to_owned(),
                    subscription: Subscription::From,
                    ask_subscribe: false,
                },
            ],
            loaded: true,
        }
    }

    #[test]
    fn save_load_round_trip_preserves_order_and_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir(dir.path().join("zim")).unwrap();

        let roster = sample();
        roster.save(dir.path(), "zim").unwrap();
        let loaded = Roster::load(dir.path(), "zim");

        assert!(loaded.loaded);
        assert_eq!(roster.items, loaded.items);
    }

    #[test]
    fn missing_file_is_empty_and_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let roster = Roster::load(dir.path(), "nobody");
        assert!(roster.loaded);
        assert!(roster.items.is_empty());
    }

    #[test]
    fn unknown_subscription_defaults_to_none() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir(dir.path().join("zim")).unwrap();
        fs::write(
            dir.path().join("zim").join("roster.xml"),
            "<?xml version=\"1.0\"?>\n<roster>\n\
             <item jid=\"a@b\" subscription=\"sideways\"/>\n\
             <item jid=\"c@d\" ask=\"subscribe\"/>\n\
             </roster>\n",
        )
        .unwrap();

        let roster = Roster::load(dir.path(), "zim");
        assert_eq!(Subscription::None, roster.items[0].subscription);
        assert!(!roster.items[0].ask_subscribe);
        assert_eq!(Subscription::None, roster.items[1].subscription);
        assert!(roster.items[1].ask_subscribe);
    }

    #[test]
    fn add_or_update_preserves_unspecified_fields() {
        let mut roster = sample();

        roster.add_or_update("dib@localhost", "", None, false);
        let dib = roster.find("dib@localhost").unwrap();
        assert_eq!("Dib", dib.name);
        assert_eq!(Subscription::Both, dib.subscription);

        roster.add_or_update(
            "dib@localhost",
            "Agent Mothman",
            Some(Subscription::To),
            true,
        );
        let dib = roster.find("dib@localhost").unwrap();
        assert_eq!("Agent Mothman", dib.name);
        assert_eq!(Subscription::To, dib.subscription);
        assert!(dib.ask_subscribe);

        roster.add_or_update("new@localhost", "", None, false);
        let new = roster.find("new@localhost").unwrap();
        assert_eq!(Subscription::None, new.subscription);
        assert_eq!(4, roster.items.len());
    }

    #[test]
    fn remove_reports_presence() {
        let mut roster = sample();
        assert!(roster.remove("gaz@localhost"));
        assert!(!roster.remove("gaz@localhost"));
        assert!(roster.find("gaz@localhost").is_none());
        assert_eq!(2, roster.items.len());
    }

    #[test]
    fn push_encoding() {
        let sent = RefCell::new(String::new());
        push(
            |s| *sent.borrow_mut() = s.to_owned(),
            "zim@localhost/home",
            &Item {
                jid: "dib@localhost".to_owned(),
                name: "Dib".to_owned(),
                subscription: Subscription::To,
                ask_subscribe: true,
            },
        );
        let sent = sent.borrow();
        assert!(sent.starts_with("<iq type='set' id='rp"));
        assert!(sent.contains("to='zim@localhost/home'"));
        assert!(sent.contains("<query xmlns='jabber:iq:roster'>"));
        assert!(sent.contains(
            "<item jid='dib@localhost' name='Dib' \
             subscription='to' ask='subscribe'/>"
        ));
        assert!(sent.ends_with("</query></iq>"));
    }

    #[test]
    fn push_ids_are_distinct() {
        let a = RefCell::new(String::new());
        let b = RefCell::new(String::new());
        let item = Item {
            jid: "x@y".to_owned(),
            name: String::new(),
            subscription: Subscription::Remove,
            ask_subscribe: false,
        };
        push(|s| *a.borrow_mut() = s.to_owned(), "u@d/r", &item);
        push(|s| *b.borrow_mut() = s.to_owned(), "u@d/r", &item);
        assert!(a.borrow().contains("subscription='remove'"));
        assert_ne!(*a.borrow(), *b.borrow());
    }

    #[test]
    fn subscription_direction_helpers() {
        assert!(Subscription::Both.has_from());
        assert!(Subscription::From.has_from());
        assert!(!Subscription::To.has_from());
        assert!(Subscription::Both.has_to());
        assert!(Subscription::To.has_to());
        assert!(!Subscription::From.has_to());
        assert!(!Subscription::None.has_from());
        assert!(!Subscription::None.has_to());
    }
}
