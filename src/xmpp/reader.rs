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

//! Streaming stanza extraction.
//!
//! An XMPP stream is one unbounded XML document whose root is
//! `<stream:stream>`; every direct child of the root is a stanza.
//! `StanzaReader` pulls namespace-resolved events off the connection and
//! hands back one complete `Stanza` tree at a time.
//!
//! The `<stream:stream>` open tag itself is returned as a sentinel (see
//! `Stanza::is_stream_open`) without affecting depth tracking, so stanza
//! depth is counted relative to the stream root, not the document.

use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

use super::stanza::{Attr, Stanza};
use crate::support::error::Error;

pub struct StanzaReader<R: BufRead> {
    reader: NsReader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> StanzaReader<R> {
    /// Builds a reader over `inner`.
    ///
    /// The parser consumes bytes from `inner` only up to each parsed event,
    /// so the stream restart after SASL success is simply dropping this
    /// reader and constructing a fresh one over the same buffered source:
    /// bytes already buffered past the `<auth/>` element stay available.
    /// The connection loop passes `&mut BufReader<TcpStream>` for exactly
    /// that reason.
    pub fn new(inner: R) -> Self {
        StanzaReader {
            reader: NsReader::from_reader(inner),
            buf: Vec::new(),
        }
    }

    /// Reads the next complete stanza.
    ///
    /// Returns `Ok(None)` on a clean end of stream: either
    /// `</stream:stream>` or EOF between stanzas. Parse errors and I/O
    /// errors propagate; the caller is expected to drop the connection.
    pub fn read_stanza(&mut self) -> Result<Option<Stanza>, Error> {
        let mut stack: Vec<Stanza> = Vec::new();

        loop {
            self.buf.clear();
            let (resolved, event) =
                self.reader.read_resolved_event_into(&mut self.buf)?;
            let ns = match resolved {
                ResolveResult::Bound(Namespace(ns)) => {
                    String::from_utf8_lossy(ns).into_owned()
                },
                _ => String::new(),
            };

            match event {
                Event::Start(ref start) => {
                    let node = node_from_start(&self.reader, ns, start)?;
                    if stack.is_empty() && node.is_stream_open() {
                        return Ok(Some(node));
                    }
                    stack.push(node);
                },

                Event::Empty(ref start) => {
                    let node = node_from_start(&self.reader, ns, start)?;
                    if stack.is_empty() && node.is_stream_open() {
                        return Ok(Some(node));
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(Some(node)),
                    }
                },

                Event::End(_) => match stack.pop() {
                    // </stream:stream>: clean close.
                    None => return Ok(None),
                    Some(done) => match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => return Ok(Some(done)),
                    },
                },

                Event::Text(ref text) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text.unescape()?);
                    }
                },

                Event::CData(ref data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(data));
                    }
                },

                Event::Decl(_)
                | Event::PI(_)
                | Event::Comment(_)
                | Event::DocType(_) => (),

                Event::Eof => return Ok(None),
            }
        }
    }
}

fn node_from_start<R: BufRead>(
    reader: &NsReader<R>,
    ns: String,
    start: &BytesStart,
) -> Result<Stanza, Error> {
    let mut node = Stanza {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        ns,
        ..Stanza::default()
    };

    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        // Namespace declarations surface through element namespaces instead.
        if attr.key.as_ref() == b"xmlns"
            || attr.key.as_ref().starts_with(b"xmlns:")
        {
            continue;
        }

        let (resolved, local) = reader.resolve_attribute(attr.key);
        let attr_ns = match resolved {
            ResolveResult::Bound(Namespace(ns)) => {
                String::from_utf8_lossy(ns).into_owned()
            },
            _ => String::new(),
        };
        node.attrs.push(Attr {
            name: String::from_utf8_lossy(local.as_ref()).into_owned(),
            ns: attr_ns,
            value: attr.unescape_value()?.into_owned(),
        });
    }

    Ok(node)
}
