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

use chrono::prelude::*;
use openssl::pkey::{PKey, Private};

use super::{hash, Error, Header, PermanentError};
use crate::mime::header::{fields, split_message};

pub type KeyPair = PKey<Private>;

/// The fields covered by every signature this server produces, in `h=`
/// order. `From` is always listed, even when absent.
const SIGNED_HEADERS: &[&str] = &[
    "From",
    "To",
    "Subject",
    "Date",
    "Message-ID",
    "Content-Type",
    "MIME-Version",
];

/// Produces `rsa-sha256`, `relaxed/relaxed` signatures for one domain.
pub struct Signer {
    sdid: String,
    selector: String,
    key: KeyPair,
}

impl Signer {
    pub fn new(sdid: String, selector: String, key: KeyPair) -> Self {
        Self {
            sdid,
            selector,
            key,
        }
    }

    /// Load the signing key from a PEM file.
    pub fn load(
        sdid: String,
        selector: String,
        pem_path: &std::path::Path,
    ) -> Result<Self, crate::support::error::Error> {
        let pem = std::fs::read(pem_path)?;
        Ok(Self::new(sdid, selector, PKey::private_key_from_pem(&pem)?))
    }

    pub fn sdid(&self) -> &str {
        &self.sdid
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Sign `message`, returning it with the `DKIM-Signature` header
    /// prepended.
    pub fn sign(
        &self,
        message: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, Error> {
        let (header_block, body) = split_message(message);
        let fields = fields(header_block).map_err(|e| {
            Error::Permanent(super::PermanentError::HeaderParse(e))
        })?;

        let signed_headers = SIGNED_HEADERS
            .iter()
            .copied()
            .filter(|&name| "From" == name || fields.iter().any(|f| f.is(name)))
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
            .join(":");

        // bh= must be computed with the final canonicalisation, so parse a
        // draft of the header to get at it.
        let draft = format!(
            "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed; \
             d={d}; s={s}; t={t}; h={signed_headers}; bh=; b=",
            d = self.sdid,
            s = self.selector,
            t = now.timestamp(),
        );
        let draft_header = Header::parse(&draft)
            .map_err(|e| Error::Permanent(PermanentError::HeaderParse(e)))?;
        let body_hash = base64::encode(hash::body_hash(&draft_header, body)?);

        let unsigned = format!(
            "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed;\r\n\
             \td={d}; s={s}; t={t};\r\n\
             \th={signed_headers};\r\n\
             \tbh={body_hash};\r\n\
             \tb=",
            d = self.sdid,
            s = self.selector,
            t = now.timestamp(),
        );
        let header = Header::parse(&unsigned)
            .map_err(|e| Error::Permanent(PermanentError::HeaderParse(e)))?;

        let hash_data = hash::header_hash_data(&header, &fields);
        let mut signer = openssl::sign::Signer::new(
            openssl::hash::MessageDigest::sha256(),
            &self.key,
        )?;
        let signature = base64::encode(signer.sign_oneshot_to_vec(&hash_data)?);

        let mut out = Vec::with_capacity(message.len() + unsigned.len() + 512);
        out.extend_from_slice(unsigned.as_bytes());
        for (ix, chunk) in signature.as_bytes().chunks(72).enumerate() {
            if 0 != ix {
                out.extend_from_slice(b"\r\n\t");
            }
            out.extend_from_slice(chunk);
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(message);
        Ok(out)
    }
}

/// Generate a new 2048-bit RSA signing key.
pub fn generate_key() -> Result<KeyPair, openssl::error::ErrorStack> {
    PKey::from_rsa(openssl::rsa::Rsa::generate(2048)?)
}

/// The TXT record to publish at `<selector>._domainkey.<domain>` for `key`.
pub fn dns_txt_record(
    key: &KeyPair,
) -> Result<String, openssl::error::ErrorStack> {
    Ok(format!(
        "v=DKIM1; k=rsa; p={}",
        base64::encode(key.public_key_to_der()?),
    ))
}
