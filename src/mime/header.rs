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

//! Utilities for working with RFC 5322 header blocks and individual header
//! fields.

use std::borrow::Cow;
use std::collections::HashMap;

use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

use super::content::decode_quoted_printable;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?([^?\s]+)\?([bBqQ])\?([^?\s]*)\?=").unwrap();
    static ref BETWEEN_ENCODED_WORDS: Regex =
        Regex::new(r"(\?=)[ \t]+(=\?)").unwrap();
}

/// Split a message into its header block and body.
///
/// The header block includes the line ending of its final line but not the
/// blank line separating it from the body. A message without a blank line is
/// all header.
pub fn split_message(message: &[u8]) -> (&[u8], &[u8]) {
    if message.starts_with(b"\r\n") {
        return (&[], &message[2..]);
    }
    if message.starts_with(b"\n") {
        return (&[], &message[1..]);
    }

    let mut start = 0;
    while let Some(nl) = memchr::memchr(b'\n', &message[start..]) {
        let line_end = start + nl + 1;
        let rest = &message[line_end..];
        if rest.starts_with(b"\r\n") {
            return (&message[..line_end], &rest[2..]);
        }
        if rest.starts_with(b"\n") {
            return (&message[..line_end], &rest[1..]);
        }
        start = line_end;
    }

    (message, &[])
}

/// One header field, exactly as it appears in the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderField<'a> {
    /// The whole field, including any folded continuation lines, but not the
    /// line ending which terminates the field.
    pub raw: &'a [u8],
    /// The length of the field name within `raw`, not counting any whitespace
    /// before the colon.
    name_len: usize,
    /// The offset of the value, just after the colon.
    value_start: usize,
}

impl<'a> HeaderField<'a> {
    pub fn name(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(&self.raw[..self.name_len])
    }

    pub fn raw_name(&self) -> &'a [u8] {
        &self.raw[..self.name_len]
    }

    pub fn raw_value(&self) -> &'a [u8] {
        &self.raw[self.value_start..]
    }

    pub fn is(&self, name: &str) -> bool {
        self.raw_name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// The unfolded, trimmed value, with any encoded words decoded.
    pub fn value(&self) -> String {
        decode_encoded_words(&unfold(self.raw_value()))
    }
}

/// Split a header block into its fields.
///
/// Fails if a line is neither the start of a field nor a continuation.
pub fn fields(block: &[u8]) -> Result<Vec<HeaderField<'_>>, String> {
    let mut ret = Vec::<HeaderField<'_>>::new();
    let mut field_start = None::<(usize, usize, usize)>;
    let mut pos = 0;

    while pos < block.len() {
        let line_len = memchr::memchr(b'\n', &block[pos..])
            .map_or(block.len() - pos, |n| n + 1);
        let line = &block[pos..pos + line_len];

        if matches!(line[0], b' ' | b'\t') {
            if field_start.is_none() {
                return Err(
                    "header block starts with a continuation".to_owned()
                );
            }
        } else {
            if let Some((start, name_len, value_start)) = field_start.take() {
                ret.push(HeaderField {
                    raw: &block[start..prev_content_end(block, pos)],
                    name_len,
                    value_start,
                });
            }

            let Some(colon) = memchr::memchr(b':', trim_line_ending(line))
            else {
                return Err(format!(
                    "header line without colon: {:?}",
                    String::from_utf8_lossy(trim_line_ending(line)),
                ));
            };

            let name = line[..colon].trim_ascii_end();
            if name.is_empty() || name.iter().any(|&b| b <= b' ' || b >= 127) {
                return Err(format!(
                    "bad header name: {:?}",
                    String::from_utf8_lossy(name),
                ));
            }

            field_start = Some((pos, name.len(), colon + 1));
        }

        pos += line_len;
    }

    if let Some((start, name_len, value_start)) = field_start {
        ret.push(HeaderField {
            raw: &block[start..prev_content_end(block, block.len())],
            name_len,
            value_start,
        });
    }

    Ok(ret)
}

/// The end of the content of the line which ends just before `pos`.
fn prev_content_end(block: &[u8], pos: usize) -> usize {
    pos - (block[..pos].len() - trim_line_ending(&block[..pos]).len())
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Unfold a raw header value and trim surrounding whitespace.
pub fn unfold(value: &[u8]) -> String {
    let mut out = Vec::with_capacity(value.len());
    for &b in value {
        if b != b'\r' && b != b'\n' {
            out.push(b);
        }
    }

    String::from_utf8_lossy(&out).trim().to_owned()
}

/// Decode RFC 2047 encoded words appearing anywhere in `s`.
///
/// Undecodable words are left as they are. Whitespace between adjacent
/// encoded words is removed.
pub fn decode_encoded_words(s: &str) -> String {
    if !s.contains("=?") {
        return s.to_owned();
    }

    let s = BETWEEN_ENCODED_WORDS.replace_all(s, "$1$2");
    ENCODED_WORD
        .replace_all(&s, |c: &regex::Captures<'_>| {
            decode_encoded_word(&c[1], &c[2], &c[3])
                .unwrap_or_else(|| c[0].to_owned())
        })
        .into_owned()
}

fn decode_encoded_word(
    charset: &str,
    transfer: &str,
    content: &str,
) -> Option<String> {
    // RFC 2231 language suffix
    let charset = charset.split('*').next().unwrap_or(charset);
    let bytes = if transfer.eq_ignore_ascii_case("b") {
        base64::decode(content).ok()?
    } else {
        decode_quoted_printable(content.replace('_', " ").as_bytes())
    };

    let encoding = Encoding::for_label_no_replacement(charset.as_bytes())?;
    Some(encoding.decode_with_bom_removal(&bytes).0.into_owned())
}

/// The decoded fields of a header block, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn parse(block: &[u8]) -> Result<Self, String> {
        Ok(Self {
            fields: fields(block)?
                .into_iter()
                .map(|f| (f.name().into_owned(), f.value()))
                .collect(),
        })
    }

    /// The value of the first field called `name`.
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    /// The values of every field called `name`, in order.
    pub fn get_all<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            fields: pairs
                .iter()
                .map(|&(n, v)| (n.to_owned(), v.to_owned()))
                .collect(),
        }
    }
}

/// Parse a structured value of the form `type/subtype; k=v; k2="v2"`.
///
/// The returned value and parameter names are lowercased.
pub fn parse_parameterised(value: &str) -> (String, HashMap<String, String>) {
    let mut parts = split_unquoted(value, ';').into_iter();
    let head = parts.next().unwrap_or_default().trim().to_ascii_lowercase();

    let mut params = HashMap::new();
    for part in parts {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };

        let k = k.trim().to_ascii_lowercase();
        let k = k.trim_end_matches('*').to_owned();
        let v = v.trim();
        let v = if let Some(quoted) =
            v.strip_prefix('"').and_then(|v| v.strip_suffix('"'))
        {
            quoted.replace("\\\"", "\"").replace("\\\\", "\\")
        } else if let Some((charset, rest)) = rfc2231_value(v) {
            Encoding::for_label(charset.as_bytes())
                .unwrap_or(encoding_rs::UTF_8)
                .decode_without_bom_handling(&percent_decode(rest))
                .0
                .into_owned()
        } else {
            v.to_owned()
        };
        params.entry(k).or_insert(v);
    }

    (head, params)
}

/// Recognise `charset'lang'percent-encoded` (RFC 2231).
fn rfc2231_value(v: &str) -> Option<(&str, &str)> {
    let (charset, rest) = v.split_once('\'')?;
    let (_, encoded) = rest.split_once('\'')?;
    Some((charset, encoded))
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if b'%' == bytes[i] && i + 2 < bytes.len() {
            if let Some(b) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn split_unquoted(s: &str, delim: char) -> Vec<&str> {
    let mut ret = Vec::new();
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;
    for (ix, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if '\\' == c && in_quote {
            escaped = true;
        } else if '"' == c {
            in_quote = !in_quote;
        } else if delim == c && !in_quote {
            ret.push(&s[start..ix]);
            start = ix + c.len_utf8();
        }
    }
    ret.push(&s[start..]);
    ret
}

/// Extract the first addr-spec from an address header value, e.g.
/// `"Foo" <foo@example.com>` yields `foo@example.com`.
pub fn extract_address(value: &str) -> Option<String> {
    let candidate = match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => &value[open + 1..close],
        _ => split_unquoted(value, ',').into_iter().next().unwrap_or(value),
    };

    let candidate = candidate.trim();
    let candidate = candidate
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or(candidate);
    if candidate.contains('@') {
        Some(candidate.to_owned())
    } else {
        None
    }
}

/// The domain part of an address, lowercased.
pub fn address_domain(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim_end_matches('>').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn split_message_variants() {
        assert_eq!(
            (&b"Subject: Hi\r\n"[..], &b"Hello.\r\n"[..]),
            split_message(b"Subject: Hi\r\n\r\nHello.\r\n")
        );
        assert_eq!(
            (&b"A: b\n"[..], &b"body"[..]),
            split_message(b"A: b\n\nbody")
        );
        assert_eq!((&b""[..], &b"body"[..]), split_message(b"\r\nbody"));
        assert_eq!(
            (&b"A: b\r\n"[..], &b""[..]),
            split_message(b"A: b\r\n")
        );
    }

    #[test]
    fn field_splitting() {
        let block = b"Subject: Hello\r\n  world\r\nB : Y\r\nX-Empty:\r\n";
        let fields = fields(block).unwrap();
        assert_eq!(3, fields.len());
        assert_eq!(b"Subject: Hello\r\n  world", fields[0].raw);
        assert_eq!("Subject", fields[0].name());
        assert_eq!("Hello  world", fields[0].value());
        assert_eq!("B", fields[1].name());
        assert_eq!("Y", fields[1].value());
        assert!(fields[2].is("x-empty"));
        assert_eq!("", fields[2].value());

        assert!(super::fields(b" leading: space\r\n").is_err());
        assert!(super::fields(b"no colon here\r\n").is_err());
    }

    #[test]
    fn encoded_words() {
        assert_eq!(
            "Keld Jørn Simonsen",
            decode_encoded_words("=?ISO-8859-1?Q?Keld_J=F8rn_Simonsen?=")
        );
        assert_eq!(
            "If you can read this you understand the example.",
            decode_encoded_words(
                "=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?= \
                 =?ISO-8859-2?B?dSB1bmRlcnN0YW5kIHRoZSBleGFtcGxlLg==?="
            )
        );
        assert_eq!(
            "Re: =?bogus?Q?x?= ok",
            decode_encoded_words("Re: =?bogus?Q?x?= ok")
        );
    }

    #[test]
    fn parameterised_values() {
        let (ty, params) = parse_parameterised(
            "Multipart/Mixed; boundary=\"a;b\"; Charset=UTF-8",
        );
        assert_eq!("multipart/mixed", ty);
        assert_eq!("a;b", params["boundary"]);
        assert_eq!("UTF-8", params["charset"]);

        let (disp, params) =
            parse_parameterised("attachment; filename*=utf-8''n%C3%A4me.txt");
        assert_eq!("attachment", disp);
        assert_eq!("näme.txt", params["filename"]);
    }

    #[test]
    fn addresses() {
        assert_eq!(
            Some("foo@example.com".to_owned()),
            extract_address("\"Foo, Bar\" <foo@example.com>")
        );
        assert_eq!(
            Some("foo@example.com".to_owned()),
            extract_address("foo@example.com, bar@example.com")
        );
        assert_eq!(None, extract_address("undisclosed-recipients:;"));
        assert_eq!(
            Some("example.com".to_owned()),
            address_domain("Foo@Example.COM")
        );
        assert_eq!(None, address_domain("foo"));
    }

    proptest! {
        #[test]
        fn fields_never_panic(s in prop::collection::vec(any::<u8>(), 0..200)) {
            let _ = fields(&s);
        }

        #[test]
        fn encoded_word_decoding_never_panics(s in r"=\?.*\?.*\?.*\?=") {
            decode_encoded_words(&s);
        }
    }
}
