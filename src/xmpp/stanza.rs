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

use std::fmt::Write as _;

use rand::Rng;

use super::{NS_CLIENT, NS_STREAM};

/// A single XML attribute on a stanza element.
///
/// `ns` is the attribute's resolved namespace, or empty for unprefixed
/// attributes. `xmlns` declarations are never stored; they reappear at
/// serialisation time from the element namespaces themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub ns: String,
    pub value: String,
}

/// An in-memory XML element tree as produced by the stanza reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stanza {
    pub name: String,
    pub ns: String,
    pub attrs: Vec<Attr>,
    pub children: Vec<Stanza>,
    pub text: String,
}

impl Stanza {
    pub fn new(name: &str, ns: &str) -> Self {
        Stanza {
            name: name.to_owned(),
            ns: ns.to_owned(),
            ..Stanza::default()
        }
    }

    /// Returns the value of the first attribute with the given local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Sets or replaces the attribute with the given local name.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        for attr in &mut self.attrs {
            if attr.name == name {
                attr.value = value.to_owned();
                return;
            }
        }
        self.attrs.push(Attr {
            name: name.to_owned(),
            ns: String::new(),
            value: value.to_owned(),
        });
    }

    /// Returns the first direct child with the given local name.
    pub fn find_child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the first direct child with the given local name and
    /// namespace.
    pub fn find_child_ns(&self, name: &str, ns: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name && c.ns == ns)
    }

    pub fn first_child(&self) -> Option<&Stanza> {
        self.children.first()
    }

    /// Returns the text of the first direct child with the given name, or ""
    /// if there is no such child.
    pub fn child_text(&self, name: &str) -> &str {
        self.find_child(name).map(|c| c.text.as_str()).unwrap_or("")
    }

    /// Returns true if this node is the `<stream:stream>` open sentinel.
    pub fn is_stream_open(&self) -> bool {
        self.name == "stream" && self.ns == NS_STREAM
    }

    /// Serialises this element for an XMPP stream whose default namespace is
    /// `jabber:client`.
    ///
    /// `xmlns` is emitted only when the element's effective namespace differs
    /// from its parent's; `jabber:client` itself is the stream default and is
    /// never written. Elements with no children and no text are written
    /// self-closing.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into("", &mut out);
        out
    }

    fn serialize_into(&self, parent_ns: &str, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);

        let effective_ns =
            if self.ns == NS_CLIENT { "" } else { self.ns.as_str() };
        if !effective_ns.is_empty() && effective_ns != parent_ns {
            let _ = write!(out, " xmlns='{}'", escape_attr(effective_ns));
        }

        for attr in &self.attrs {
            let _ = write!(out, " {}='{}'", attr.name, escape_attr(&attr.value));
        }

        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        if !self.text.is_empty() {
            out.push_str(&escape_text(&self.text));
        }
        for child in &self.children {
            child.serialize_into(effective_ns, out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Escapes a string for use inside a single-quoted attribute value.
pub fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('\'', "&apos;")
}

/// Escapes a string for use as element text.
pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Returns a random lowercase hex string of length `len`, for stream ids and
/// default resource names.
pub fn generate_id(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect()
}
