//-
// Copyright (c) 2020, 2026, Jason Lingle
//
// This file is part of Rookery.
//
// Rookery is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rookery is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rookery. If not, see <http://www.gnu.org/licenses/>.

//! Utilities for *writing* values under IMAP's lexical rules.
//!
//! We're conservative about encoding choices. A string is written as a quoted
//! string only if it is pure printable ASCII without backslash or
//! double-quote and shorter than 100 bytes; everything else becomes a
//! literal. Mailbox names are sent as UTF-8 rather than modified UTF-7.

/// Append `s` as an IMAP `string` (quoted or literal).
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    if s.len() < 100 && s.bytes().all(is_quotable) {
        out.push(b'"');
        out.extend_from_slice(s.as_bytes());
        out.push(b'"');
    } else {
        write_literal(out, s.as_bytes());
    }
}

/// Append `s` as an atom if it looks like one, otherwise as a string.
pub fn write_astring(out: &mut Vec<u8>, s: &str) {
    if !s.is_empty()
        && !s.eq_ignore_ascii_case("NIL")
        && s.bytes()
            .all(|c| c.is_ascii_alphanumeric() || b"?=+/_.-@".contains(&c))
    {
        out.extend_from_slice(s.as_bytes());
    } else {
        write_string(out, s);
    }
}

pub fn write_literal(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
}

/// Append a parenthesised flag list.
pub fn write_flags(out: &mut Vec<u8>, flags: &[String]) {
    out.push(b'(');
    for (ix, flag) in flags.iter().enumerate() {
        if ix > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(flag.as_bytes());
    }
    out.push(b')');
}

fn is_quotable(c: u8) -> bool {
    (b' '..0x7F).contains(&c) && b'"' != c && b'\\' != c
}

#[cfg(test)]
mod test {
    use super::*;

    fn string(s: &str) -> String {
        let mut out = Vec::new();
        write_string(&mut out, s);
        String::from_utf8(out).unwrap()
    }

    fn astring(s: &str) -> String {
        let mut out = Vec::new();
        write_astring(&mut out, s);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn encoding_choices() {
        assert_eq!("\"INBOX\"", string("INBOX"));
        assert_eq!("\"\"", string(""));
        assert_eq!("{3}\r\na\"b", string("a\"b"));
        assert_eq!("{6}\r\nSchön", string("Schön"));
        assert_eq!("{2}\r\n\r\n", string("\r\n"));

        assert_eq!("INBOX", astring("INBOX"));
        assert_eq!("dib@local.test", astring("dib@local.test"));
        assert_eq!("\"NIL\"", astring("NIL"));
        assert_eq!("\"My Stuff\"", astring("My Stuff"));
    }

    #[test]
    fn flag_lists() {
        let mut out = Vec::new();
        write_flags(&mut out, &[]);
        write_flags(&mut out, &["\\Seen".to_owned(), "$Junk".to_owned()]);
        assert_eq!(b"()(\\Seen $Junk)".to_vec(), out);
    }
}
