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

use openssl::hash::{hash, MessageDigest};

use super::{Failure, Header};
use crate::mime::header::HeaderField;

/// Generates the data covered by the signature of `header`: every field
/// named by its `h=` tag, then the `DKIM-Signature` field itself with the
/// `b=` value removed and no trailing CRLF.
pub(super) fn header_hash_data(
    header: &Header<'_>,
    fields: &[HeaderField<'_>],
) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(1024);
    let mut used = vec![false; fields.len()];

    // A single occurrence of a name in h= matches the last occurrence of that
    // field in the message; the Nth repetition matches the Nth from last.
    // Names which match nothing (more) contribute nothing.
    for name in &header.signed_headers {
        let found = fields
            .iter()
            .enumerate()
            .rev()
            .find(|&(ix, f)| !used[ix] && f.is(name));
        if let Some((ix, field)) = found {
            used[ix] = true;
            header.canonicalisation.header.write(&mut out, field.raw);
        }
    }

    header
        .canonicalisation
        .header
        .write(&mut out, header.raw_without_signature().as_bytes());
    // No CRLF after the DKIM-Signature header
    out.truncate(out.len() - 2);

    out
}

/// Compute the SHA-256 body hash for `header`, honouring its `l=` tag.
pub(super) fn body_hash(
    header: &Header<'_>,
    body: &[u8],
) -> Result<Vec<u8>, super::Error> {
    let canonical = header.canonicalisation.body.apply(body);
    let covered = match header.body_length {
        None => &canonical[..],
        Some(l) => {
            let l = usize::try_from(l).unwrap_or(usize::MAX);
            if l > canonical.len() {
                return Err(Failure::BodyTruncated.into());
            }
            &canonical[..l]
        },
    };

    Ok(hash(MessageDigest::sha256(), covered)?.to_vec())
}
