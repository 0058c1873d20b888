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

//! Decoding of part bodies: content transfer encoding, then charset.

use std::str;

use encoding_rs::Encoding;

/// Decodes quoted-printable encoding, as described by RFC 2045.
///
/// Encoded bytes and soft line endings are both handled, the latter by
/// discarding. UNIX line endings are handled as well as DOS line endings.
///
/// This never fails. Invalid sequences, including a trailing incomplete
/// escape, are passed through untransformed. 8-bit characters are passed
/// through, including invalid UTF-8.
pub fn decode_quoted_printable(s: &[u8]) -> Vec<u8> {
    let mut transformed = Vec::with_capacity(s.len());

    let mut split = s.split(|&b| b'=' == b);
    if let Some(prefix) = split.next() {
        transformed.extend_from_slice(prefix);
    }

    for element in split {
        if element.starts_with(b"\n") {
            // Soft line break with UNIX ending
            transformed.extend_from_slice(&element[1..]);
            continue;
        }

        if element.starts_with(b"\r\n") {
            // Soft line break with DOS ending
            transformed.extend_from_slice(&element[2..]);
            continue;
        }

        if let Some(ch) = element
            .get(..2)
            .and_then(|e| str::from_utf8(e).ok())
            .and_then(|e| u8::from_str_radix(e, 16).ok())
        {
            transformed.push(ch);
            transformed.extend_from_slice(&element[2..]);
        } else {
            transformed.push(b'=');
            transformed.extend_from_slice(element);
        }
    }

    transformed
}

/// Decode base64 content which may be broken across lines and may carry
/// stray whitespace or garbage. Undecodable input yields what could be
/// decoded before the error.
pub fn decode_base64_lenient(s: &[u8]) -> Vec<u8> {
    let cleaned = s
        .iter()
        .copied()
        .filter(|&b| b.is_ascii_alphanumeric() || b'+' == b || b'/' == b)
        .collect::<Vec<u8>>();

    // Decode whole quanta only; a trailing partial one is padding garbage
    // unless it carries at least two characters.
    let whole = cleaned.len() / 4 * 4;
    let mut ret = base64::decode(&cleaned[..whole]).unwrap_or_default();
    let tail = &cleaned[whole..];
    if tail.len() >= 2 {
        let mut padded = tail.to_vec();
        padded.resize(4, b'=');
        ret.extend(base64::decode(&padded).unwrap_or_default());
    }
    ret
}

/// Undo the given content transfer encoding. Identity encodings (`7bit`,
/// `8bit`, `binary`) and unknown ones pass through.
pub fn decode_transfer_encoding(encoding: &str, body: &[u8]) -> Vec<u8> {
    if encoding.eq_ignore_ascii_case("base64") {
        decode_base64_lenient(body)
    } else if encoding.eq_ignore_ascii_case("quoted-printable") {
        decode_quoted_printable(body)
    } else {
        body.to_vec()
    }
}

/// Convert `body` in `charset` to a Rust string. Unknown charsets are
/// treated as UTF-8, lossily.
pub fn decode_charset(charset: Option<&str>, body: &[u8]) -> String {
    let encoding = charset
        .and_then(|c| Encoding::for_label(c.trim().as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    encoding.decode_with_bom_removal(body).0.into_owned()
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn quoted_printable() {
        assert_eq!(
            b"hello world".to_vec(),
            decode_quoted_printable(b"hello world")
        );
        assert_eq!(b"\xabfoo".to_vec(), decode_quoted_printable(b"=ABfoo"));
        assert_eq!(
            b"foo\xab\xcd".to_vec(),
            decode_quoted_printable(b"foo=AB=CD")
        );
        assert_eq!(b"foobar".to_vec(), decode_quoted_printable(b"foo=\r\nbar"));
        assert_eq!(b"foobar".to_vec(), decode_quoted_printable(b"foo=\nbar"));
        assert_eq!(b"foo=ZZ".to_vec(), decode_quoted_printable(b"foo=ZZ"));
        assert_eq!(b"foo=".to_vec(), decode_quoted_printable(b"foo="));
        assert_eq!(b"foo=A".to_vec(), decode_quoted_printable(b"foo=A"));
    }

    #[test]
    fn base64_with_line_breaks() {
        assert_eq!(
            b"Hello, world!".to_vec(),
            decode_base64_lenient(b"SGVsbG8s\r\nIHdvcmxk\r\nIQ==\r\n")
        );
        assert_eq!(b"Hi".to_vec(), decode_base64_lenient(b"SGk"));
    }

    #[test]
    fn charsets() {
        assert_eq!("caf\u{e9}", decode_charset(Some("iso-8859-1"), b"caf\xe9"));
        assert_eq!("plain", decode_charset(Some("x-bogus"), b"plain"));
        assert_eq!("plain", decode_charset(None, b"plain"));
    }

    proptest! {
        #[test]
        fn qp_never_panics(s in prop::collection::vec(any::<u8>(), 0..100)) {
            decode_quoted_printable(&s);
        }

        #[test]
        fn base64_decodes_what_it_encodes(
            s in prop::collection::vec(any::<u8>(), 0..100)
        ) {
            let encoded = base64::encode(&s);
            prop_assert_eq!(s, decode_base64_lenient(encoded.as_bytes()));
        }
    }
}
