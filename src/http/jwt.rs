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

//! HS256 JSON Web Tokens (RFC 7519), just enough for API bearer tokens.

use chrono::prelude::*;
use openssl::{hash::MessageDigest, memcmp, pkey::PKey, sign::Signer};
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub email: String,
    pub role: String,
    /// Expiry, in seconds since the epoch.
    pub exp: i64,
}

fn b64(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE_NO_PAD)
}

fn mac(secret: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let key = PKey::hmac(secret)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

/// Produce a signed token carrying `claims`.
pub fn issue(secret: &[u8], claims: &Claims) -> Result<String, Error> {
    let payload = serde_json::to_vec(claims)
        .map_err(|e| Error::ValidationFailed(e.to_string()))?;
    let signing_input = format!("{}.{}", b64(HEADER.as_bytes()), b64(&payload));
    let signature = mac(secret, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", b64(&signature)))
}

/// Check the signature and expiry of `token` and return its claims.
///
/// Every way a token can be bad yields `InvalidCredentials`.
pub fn verify(
    secret: &[u8],
    token: &str,
    now: DateTime<Utc>,
) -> Result<Claims, Error> {
    let (signing_input, signature) =
        token.rsplit_once('.').ok_or(Error::InvalidCredentials)?;
    let (header, payload) = signing_input
        .split_once('.')
        .ok_or(Error::InvalidCredentials)?;

    let signature = base64::decode_config(signature, base64::URL_SAFE_NO_PAD)
        .map_err(|_| Error::InvalidCredentials)?;
    let expected = mac(secret, signing_input.as_bytes())?;
    if signature.len() != expected.len() || !memcmp::eq(&signature, &expected) {
        return Err(Error::InvalidCredentials);
    }

    let header = base64::decode_config(header, base64::URL_SAFE_NO_PAD)
        .map_err(|_| Error::InvalidCredentials)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header).map_err(|_| Error::InvalidCredentials)?;
    if header.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
        return Err(Error::InvalidCredentials);
    }

    let payload = base64::decode_config(payload, base64::URL_SAFE_NO_PAD)
        .map_err(|_| Error::InvalidCredentials)?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|_| Error::InvalidCredentials)?;
    if claims.exp <= now.timestamp() {
        return Err(Error::InvalidCredentials);
    }

    Ok(claims)
}
