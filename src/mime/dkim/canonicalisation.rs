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

//! DKIM canonicalisation, RFC 6376 § 3.4.
//!
//! Both forms operate on whole buffers. Bare LF line endings are treated as
//! CRLF, so a message re-encoded by a transport which converted its line
//! endings still verifies.

use super::header::{BodyCanonicalisation, HeaderCanonicalisation};

impl HeaderCanonicalisation {
    /// Canonicalise one header field and append it to `out`.
    ///
    /// `raw` is the whole field as it appears in the message, without the
    /// terminating line ending; this function writes the CRLF itself.
    pub fn write(self, out: &mut Vec<u8>, raw: &[u8]) {
        match self {
            Self::Simple => out.extend_from_slice(raw),

            Self::Relaxed => {
                let (name, value) = match memchr::memchr(b':', raw) {
                    Some(colon) => (&raw[..colon], &raw[colon + 1..]),
                    None => (raw, &[][..]),
                };

                // Lowercase the name and drop whitespace around the colon.
                out.extend(
                    name.trim_ascii().iter().map(u8::to_ascii_lowercase),
                );
                out.push(b':');

                // Unfold, collapse whitespace runs to one SP, and trim.
                for (ix, word) in value
                    .split(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
                    .filter(|w| !w.is_empty())
                    .enumerate()
                {
                    if 0 != ix {
                        out.push(b' ');
                    }
                    out.extend_from_slice(word);
                }
            },
        }

        out.extend_from_slice(b"\r\n");
    }
}

impl BodyCanonicalisation {
    /// Canonicalise a whole message body.
    pub fn apply(self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 2);
        // Blank lines are held back until something follows them, so that
        // trailing ones are dropped.
        let mut pending_blank_lines = 0usize;

        let mut lines = body.split(|&b| b'\n' == b).peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if is_last && line.is_empty() {
                // The body ended with a line ending.
                break;
            }

            let canonical = match self {
                Self::Simple => line.to_vec(),
                Self::Relaxed => relax_line(line),
            };

            if canonical.is_empty() {
                pending_blank_lines += 1;
                continue;
            }

            for _ in 0..pending_blank_lines {
                out.extend_from_slice(b"\r\n");
            }
            pending_blank_lines = 0;
            out.extend_from_slice(&canonical);
            out.extend_from_slice(b"\r\n");
        }

        // An empty body is a single CRLF under simple but empty under
        // relaxed.
        if out.is_empty() && Self::Simple == self {
            out.extend_from_slice(b"\r\n");
        }

        out
    }
}

fn relax_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut holding_space = false;
    for &b in line {
        if matches!(b, b' ' | b'\t') {
            holding_space = true;
        } else {
            if holding_space {
                out.push(b' ');
                holding_space = false;
            }
            out.push(b);
        }
    }
    out
}
