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

use std::ops::Range;

use chrono::prelude::*;

pub const HEADER_NAME: &str = "DKIM-Signature";
const FWS: &[char] = &[' ', '\t', '\r', '\n'];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderCanonicalisation {
    Simple,
    Relaxed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyCanonicalisation {
    Simple,
    Relaxed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Canonicalisation {
    pub header: HeaderCanonicalisation,
    pub body: BodyCanonicalisation,
}

impl Default for Canonicalisation {
    fn default() -> Self {
        Self {
            header: HeaderCanonicalisation::Simple,
            body: BodyCanonicalisation::Simple,
        }
    }
}

impl Canonicalisation {
    pub const RELAXED: Self = Self {
        header: HeaderCanonicalisation::Relaxed,
        body: BodyCanonicalisation::Relaxed,
    };

    fn parse(s: &str) -> Result<Self, String> {
        let (header, body) = s.split_once('/').unwrap_or((s, "simple"));

        let header = match header {
            "simple" => HeaderCanonicalisation::Simple,
            "relaxed" => HeaderCanonicalisation::Relaxed,
            h => return Err(format!("unknown header canonicalisation: {h}")),
        };
        let body = match body {
            "simple" => BodyCanonicalisation::Simple,
            "relaxed" => BodyCanonicalisation::Relaxed,
            b => return Err(format!("unknown body canonicalisation: {b}")),
        };

        Ok(Self { header, body })
    }
}

/// The `a=` tag. Only `rsa-sha256` can be verified or produced; anything
/// else still parses so that the failure is attributed correctly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha256,
    Other(String),
}

/// A parsed `DKIM-Signature` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header<'a> {
    /// The full header, starting at the first byte of the field name and
    /// extending to but not including the line ending which terminates it.
    pub raw: &'a str,
    /// The range in `raw` of the value of the `b` tag. This is the portion of
    /// `raw` which is *not* used as input to the header hash.
    pub b_range: Range<usize>,
    pub version: u32,
    pub algorithm: Algorithm,
    /// The `b` tag, decoded.
    pub signature: Vec<u8>,
    /// The `bh` tag, decoded.
    pub body_hash: Vec<u8>,
    pub canonicalisation: Canonicalisation,
    /// The `d` tag, i.e. the signing domain.
    pub sdid: &'a str,
    /// The `h` tag, split but otherwise as written.
    pub signed_headers: Vec<&'a str>,
    /// The `l` tag.
    pub body_length: Option<u64>,
    /// The `s` tag.
    pub selector: &'a str,
    /// The `x` tag.
    pub signature_expiration: Option<DateTime<Utc>>,
}

impl<'a> Header<'a> {
    /// Parses the given string.
    ///
    /// The string must include the `DKIM-Signature:` prefix and must not
    /// contain the final line ending.
    pub fn parse(whole_header: &'a str) -> Result<Self, String> {
        let Some((header_name, s)) = whole_header.split_once(':') else {
            return Err("DKIM header didn't have :".to_owned());
        };

        let header_text_offset = header_name.len() + 1;

        let mut version = None::<u32>;
        let mut algorithm = None::<Algorithm>;
        let mut signature = None::<(Vec<u8>, Range<usize>)>;
        let mut body_hash = None::<Vec<u8>>;
        let mut canonicalisation = None::<Canonicalisation>;
        let mut sdid = None::<&'a str>;
        let mut signed_headers = None::<Vec<&'a str>>;
        let mut body_length = None::<u64>;
        let mut selector = None::<&'a str>;
        let mut signature_expiration = None::<DateTime<Utc>>;

        for (k, v, v_range) in split_kv_pairs(s) {
            let v_range = v_range.start + header_text_offset
                ..v_range.end + header_text_offset;

            match k {
                "v" => set_opt(
                    k,
                    &mut version,
                    v.parse().map_err(|_| format!("unparsable v={v}"))?,
                )?,
                "a" => set_opt(
                    k,
                    &mut algorithm,
                    if "rsa-sha256" == v {
                        Algorithm::RsaSha256
                    } else {
                        Algorithm::Other(v.to_owned())
                    },
                )?,
                "b" => set_opt(k, &mut signature, (decode_base64(v), v_range))?,
                "bh" => set_opt(k, &mut body_hash, decode_base64(v))?,
                "c" => set_opt(
                    k,
                    &mut canonicalisation,
                    Canonicalisation::parse(v)?,
                )?,
                "d" => set_opt(k, &mut sdid, v)?,
                "h" => set_opt(
                    k,
                    &mut signed_headers,
                    v.split(':').map(|s| s.trim_matches(FWS)).collect(),
                )?,
                "l" => set_opt(
                    k,
                    &mut body_length,
                    v.parse().map_err(|_| format!("unparsable l={v}"))?,
                )?,
                "s" => set_opt(k, &mut selector, v)?,
                "x" => set_opt(
                    k,
                    &mut signature_expiration,
                    decode_timestamp(v)?,
                )?,
                _ => (),
            }
        }

        let (signature, b_range) = signature.ok_or("missing b= tag")?;
        Ok(Self {
            raw: whole_header,
            b_range,
            version: version.ok_or("missing v= tag")?,
            algorithm: algorithm.ok_or("missing a= tag")?,
            signature,
            body_hash: body_hash.ok_or("missing bh= tag")?,
            canonicalisation: canonicalisation.unwrap_or_default(),
            sdid: sdid.ok_or("missing d= tag")?,
            signed_headers: signed_headers.ok_or("missing h= tag")?,
            body_length,
            selector: selector.ok_or("missing s= tag")?,
            signature_expiration,
        })
    }

    /// `raw` with the value of the `b` tag removed.
    pub fn raw_without_signature(&self) -> String {
        let mut s = String::with_capacity(self.raw.len());
        s.push_str(&self.raw[..self.b_range.start]);
        s.push_str(&self.raw[self.b_range.end..]);
        s
    }
}

/// A parsed DKIM key record stored in DNS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtRecord {
    /// The `k` tag.
    pub key_type: String,
    /// The `p` tag, decoded. Empty if the key was revoked.
    pub public_key: Vec<u8>,
    /// Whether `y` is set in the `t` tag.
    pub test_mode: bool,
}

impl TxtRecord {
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut version = None::<&str>;
        let mut key_type = None::<&str>;
        let mut public_key = None::<Vec<u8>>;
        let mut test_mode = false;

        for (k, v, _) in split_kv_pairs(s) {
            match k {
                "v" => set_opt(k, &mut version, v)?,
                "k" => set_opt(k, &mut key_type, v)?,
                "p" => set_opt(k, &mut public_key, decode_base64(v))?,
                "t" => {
                    test_mode =
                        v.split(':').any(|f| "y" == f.trim_matches(FWS));
                },
                _ => (),
            }
        }

        if version.is_some_and(|v| "DKIM1" != v) {
            return Err("not a DKIM1 record".to_owned());
        }

        Ok(Self {
            key_type: key_type.unwrap_or("rsa").to_owned(),
            public_key: public_key.ok_or("missing p= tag")?,
            test_mode,
        })
    }
}

/// Splits the given string into key-value pairs as per RFC 6376 § 3.2. Keys
/// and values are not decoded but are fully trimmed. The range associated
/// with each item is the range of the value *before* trimming; this is used
/// to locate the `b` tag.
fn split_kv_pairs(
    s: &str,
) -> impl Iterator<Item = (&str, &str, Range<usize>)> + '_ {
    let mut offset = 0usize;
    s.split(';')
        .map(move |group| {
            let start = offset;
            offset += group.len() + 1;
            (group, start)
        })
        .filter_map(|(group, offset)| {
            group.split_once('=').map(|(k, v)| {
                let v_start = offset + k.len() + 1;
                let v_end = v_start + v.len();
                (k.trim_matches(FWS), v.trim_matches(FWS), v_start..v_end)
            })
        })
}

/// Decode RFC 6376 base64 with embedded folding whitespace.
fn decode_base64(s: &str) -> Vec<u8> {
    let cleaned = s
        .chars()
        .filter(|&c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect::<String>();
    base64::decode(cleaned).unwrap_or_default()
}

fn set_opt<T>(k: &str, opt: &mut Option<T>, v: T) -> Result<(), String> {
    if opt.is_some() {
        return Err(format!("duplicate {k}= tag"));
    }

    *opt = Some(v);
    Ok(())
}

fn decode_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    // Unrepresentable far-future dates clamp to the maximum.
    let seconds = s
        .parse::<i64>()
        .map_err(|_| format!("unparsable timestamp: {s}"))?
        .max(0);
    Ok(DateTime::<Utc>::from_timestamp(seconds, 0)
        .unwrap_or(DateTime::<Utc>::MAX_UTC))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kv_pairs_track_raw_ranges() {
        let s = " a=1; b = x y ;c=";
        let pairs = split_kv_pairs(s).collect::<Vec<_>>();
        assert_eq!(3, pairs.len());
        assert_eq!(("b", "x y"), (pairs[1].0, pairs[1].1));
        assert_eq!(" x y ", &s[pairs[1].2.clone()]);
        assert_eq!(("c", ""), (pairs[2].0, pairs[2].1));
    }

    #[test]
    fn parse_signature_header() {
        let raw = "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed;\r\n\
                   \td=example.net; s=sel; h=From : To:Subject;\r\n\
                   \tbh=AAAA; x=2000000000; b=AB\r\n\tCD";
        let header = Header::parse(raw).unwrap();
        assert_eq!(1, header.version);
        assert_eq!(Algorithm::RsaSha256, header.algorithm);
        assert_eq!(Canonicalisation::RELAXED, header.canonicalisation);
        assert_eq!("example.net", header.sdid);
        assert_eq!("sel", header.selector);
        assert_eq!(vec!["From", "To", "Subject"], header.signed_headers);
        assert_eq!(vec![0u8, 0, 0], header.body_hash);
        assert_eq!(base64::decode("ABCD").unwrap(), header.signature);
        assert!(header.raw_without_signature().ends_with("b="));
        assert!(header.signature_expiration.is_some());
    }

    #[test]
    fn parse_signature_header_errors() {
        assert!(Header::parse("DKIM-Signature: v=1; a=rsa-sha256").is_err());
        assert!(Header::parse(
            "DKIM-Signature: v=1; v=1; a=rsa-sha256; b=; bh=; d=x; h=from; s=y"
        )
        .is_err());
        assert!(Header::parse(
            "DKIM-Signature: v=1; a=rsa-sha256; c=weird; b=; bh=; d=x; h=f; s=y"
        )
        .is_err());
        assert_matches!(
            Ok(Header {
                algorithm: Algorithm::Other(_),
                ..
            }),
            Header::parse(
                "DKIM-Signature: v=1; a=ed25519-sha256; b=; bh=; d=x; h=f; s=y"
            )
        );
    }

    #[test]
    fn parse_txt_record() {
        let record = TxtRecord::parse("v=DKIM1; k=rsa; t=y; p=AAAA").unwrap();
        assert_eq!("rsa", record.key_type);
        assert!(record.test_mode);
        assert_eq!(vec![0u8, 0, 0], record.public_key);

        assert!(TxtRecord::parse("p=").unwrap().public_key.is_empty());
        assert!(TxtRecord::parse("v=spf1 -all").is_err());
        assert!(TxtRecord::parse("v=DKIM2; p=AAAA").is_err());
    }
}
