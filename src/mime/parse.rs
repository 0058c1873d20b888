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

//! Extraction of the searchable text of a message.
//!
//! The message is walked recursively. `text/plain` parts are preferred and
//! concatenated; if there are none, `text/html` parts are stripped of markup
//! and used instead. Parts with an `attachment` disposition contribute only
//! their metadata.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use super::content::{decode_charset, decode_transfer_encoding};
use super::header::{parse_parameterised, split_message, Headers};
use crate::support::error::Error;

const MAX_DEPTH: u32 = 20;
const SNIPPET_CHARS: usize = 200;

lazy_static! {
    static ref SCRIPT_OR_STYLE: Regex =
        Regex::new(r"(?is)<(script|style)\b.*?</(script|style)\s*>").unwrap();
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Decoded size in bytes.
    pub size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ParsedMessage {
    /// The top-level header of the message.
    pub headers: Headers,
    pub plaintext: String,
    pub attachments: Vec<Attachment>,
    pub snippet: String,
}

impl ParsedMessage {
    pub fn subject(&self) -> &str {
        self.headers.get("Subject").unwrap_or("")
    }

    pub fn message_id(&self) -> &str {
        self.headers.get("Message-ID").unwrap_or("")
    }

    /// The first address of the `From` header.
    pub fn from_address(&self) -> Option<String> {
        self.headers
            .get("From")
            .and_then(super::header::extract_address)
    }
}

#[derive(Default)]
struct Accumulator {
    plain: Vec<String>,
    html: Vec<String>,
    attachments: Vec<Attachment>,
}

/// Parse `raw`, failing with `MalformedMessage` if it has no header, a
/// malformed header, or a multipart structure that cannot be walked.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, Error> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::MalformedMessage("empty message".to_owned()));
    }

    let (header_block, body) = split_message(raw);
    let headers =
        Headers::parse(header_block).map_err(Error::MalformedMessage)?;

    let mut acc = Accumulator::default();
    walk(&headers, body, 0, &mut acc)?;

    let plaintext = if acc.plain.is_empty() {
        acc.html.join("\n")
    } else {
        acc.plain.join("\n")
    };
    let snippet = make_snippet(&plaintext);

    Ok(ParsedMessage {
        headers,
        plaintext,
        attachments: acc.attachments,
        snippet,
    })
}

fn walk(
    headers: &Headers,
    body: &[u8],
    depth: u32,
    acc: &mut Accumulator,
) -> Result<(), Error> {
    if depth > MAX_DEPTH {
        return Err(Error::MalformedMessage(
            "MIME structure nested too deeply".to_owned(),
        ));
    }

    let (content_type, params) = headers
        .get("Content-Type")
        .map(parse_parameterised)
        .unwrap_or_else(|| ("text/plain".to_owned(), Default::default()));
    let (disposition, disposition_params) = headers
        .get("Content-Disposition")
        .map(parse_parameterised)
        .unwrap_or_default();

    if content_type.starts_with("multipart/") {
        let Some(boundary) = params.get("boundary").filter(|b| !b.is_empty())
        else {
            return Err(Error::MalformedMessage(
                "multipart without boundary".to_owned(),
            ));
        };

        for part in split_multipart(body, boundary.as_bytes()) {
            let (part_header, part_body) = split_message(part);
            let part_headers = Headers::parse(part_header)
                .map_err(Error::MalformedMessage)?;
            walk(&part_headers, part_body, depth + 1, acc)?;
        }
        return Ok(());
    }

    let decoded = decode_transfer_encoding(
        headers.get("Content-Transfer-Encoding").unwrap_or("7bit").trim(),
        body,
    );

    if disposition.starts_with("attachment") {
        acc.attachments.push(Attachment {
            filename: disposition_params
                .get("filename")
                .or_else(|| params.get("name"))
                .cloned()
                .unwrap_or_else(|| "attachment".to_owned()),
            content_type,
            size: decoded.len() as u64,
        });
        return Ok(());
    }

    let charset = params.get("charset").map(String::as_str);
    match content_type.as_str() {
        "text/plain" => acc.plain.push(decode_charset(charset, &decoded)),
        "text/html" => {
            acc.html.push(strip_html(&decode_charset(charset, &decoded)))
        },
        _ => (),
    }

    Ok(())
}

/// Split the body of a multipart entity into its parts, ignoring the
/// preamble and epilogue. A missing close delimiter ends the last part at
/// the end of the body.
fn split_multipart<'a>(body: &'a [u8], boundary: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut part_start = None::<usize>;
    let mut pos = 0;

    while pos < body.len() {
        let line_len = memchr::memchr(b'\n', &body[pos..])
            .map_or(body.len() - pos, |n| n + 1);
        let line = body[pos..pos + line_len].trim_ascii_end();

        if let Some(rest) = line
            .strip_prefix(b"--")
            .and_then(|l| l.strip_prefix(boundary))
        {
            let is_close = rest.starts_with(b"--");
            if rest.is_empty() || is_close {
                if let Some(start) = part_start.take() {
                    parts.push(strip_final_line_ending(&body[start..pos]));
                }
                if is_close {
                    return parts;
                }
                part_start = Some(pos + line_len);
            }
        }

        pos += line_len;
    }

    if let Some(start) = part_start {
        parts.push(&body[start.min(body.len())..]);
    }
    parts
}

// The line ending before a delimiter belongs to the delimiter.
fn strip_final_line_ending(part: &[u8]) -> &[u8] {
    let part = part.strip_suffix(b"\n").unwrap_or(part);
    part.strip_suffix(b"\r").unwrap_or(part)
}

/// Reduce HTML to its visible text.
pub fn strip_html(html: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(html, " ");
    let text = TAG.replace_all(&without_code, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Whitespace-collapsed preview of `plaintext`, at most 200 characters.
pub fn make_snippet(plaintext: &str) -> String {
    let collapsed = WHITESPACE.replace_all(plaintext.trim(), " ");
    if collapsed.chars().count() <= SNIPPET_CHARS {
        return collapsed.into_owned();
    }

    let mut snippet =
        collapsed.chars().take(SNIPPET_CHARS - 3).collect::<String>();
    snippet.push_str("...");
    snippet
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn simple_message() {
        let parsed = parse_message(b"Subject: Hi\r\n\r\nHello.\r\n").unwrap();
        assert_eq!("Hi", parsed.subject());
        assert_eq!("Hello.\r\n", parsed.plaintext);
        assert_eq!("Hello.", parsed.snippet);
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn multipart_alternative_prefers_plain() {
        let raw = b"From: \"A\" <a@example.net>\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
preamble\r\n\
--b1\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Hello <b>html</b></p>\r\n\
--b1\r\n\
Content-Type: text/plain; charset=iso-8859-1\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
Caf=E9 plain\r\n\
--b1--\r\n\
epilogue\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!("Caf\u{e9} plain", parsed.plaintext);
        assert_eq!(Some("a@example.net".to_owned()), parsed.from_address());
    }

    #[test]
    fn html_only_falls_back_to_stripped_text() {
        let raw = b"Content-Type: text/html\r\n\r\n\
<html><style>p { x }</style><script>alert(1)</script>\
<p>Visible &amp; text</p></html>";
        let parsed = parse_message(raw).unwrap();
        assert_eq!("Visible & text", parsed.snippet);
        assert!(!parsed.plaintext.contains("alert"));
    }

    #[test]
    fn nested_multipart_with_attachment() {
        let raw = b"Content-Type: multipart/mixed; boundary=outer\r\n\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=inner\r\n\
\r\n\
--inner\r\n\
\r\n\
body text\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
SGVsbG8=\r\n\
--outer\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment\r\n\
\r\n\
xyz\r\n\
--outer--\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!("body text", parsed.plaintext);
        assert_eq!(
            vec![
                Attachment {
                    filename: "report.pdf".to_owned(),
                    content_type: "application/pdf".to_owned(),
                    size: 5,
                },
                Attachment {
                    filename: "attachment".to_owned(),
                    content_type: "application/octet-stream".to_owned(),
                    size: 3,
                },
            ],
            parsed.attachments
        );
    }

    #[test]
    fn malformed_messages() {
        assert_matches!(Err(Error::MalformedMessage(_)), parse_message(b""));
        assert_matches!(
            Err(Error::MalformedMessage(_)),
            parse_message(b"this is not a header\r\n\r\nbody")
        );
        assert_matches!(
            Err(Error::MalformedMessage(_)),
            parse_message(b"Content-Type: multipart/mixed\r\n\r\nbody")
        );

        let mut deep = Vec::new();
        for i in 0..=MAX_DEPTH + 1 {
            deep.extend_from_slice(
                format!(
                    "Content-Type: multipart/mixed; boundary=b{i}\r\n\
                     \r\n--b{i}\r\n"
                )
                .as_bytes(),
            );
        }
        assert_matches!(Err(Error::MalformedMessage(_)), parse_message(&deep));
    }

    #[test]
    fn snippet_truncation() {
        let long = "word ".repeat(100);
        let snippet = make_snippet(&long);
        assert_eq!(200, snippet.chars().count());
        assert!(snippet.ends_with("..."));

        assert_eq!("a b c", make_snippet("  a\r\n\tb   c \n"));
        let exact = "x".repeat(200);
        assert_eq!(exact, make_snippet(&exact));
    }

    proptest! {
        #[test]
        fn parse_never_panics(s in prop::collection::vec(any::<u8>(), 0..300)) {
            let _ = parse_message(&s);
        }

        #[test]
        fn snippet_is_bounded(s in ".*") {
            prop_assert!(make_snippet(&s).chars().count() <= SNIPPET_CHARS);
        }
    }
}
