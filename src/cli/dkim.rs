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

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use crate::mime::dkim;
use crate::support::system_config::SystemConfig;

pub(super) fn keygen(config: SystemConfig) {
    let path = &config.dkim.private_key;
    let key = match dkim::generate_key() {
        Ok(key) => key,
        Err(e) => die!(EX_SOFTWARE, "Failed to generate key: {}", e),
    };

    let pem = match key.private_key_to_pem_pkcs8() {
        Ok(pem) => pem,
        Err(e) => die!(EX_SOFTWARE, "Failed to encode key: {}", e),
    };

    let txt = match dkim::dns_txt_record(&key) {
        Ok(txt) => txt,
        Err(e) => die!(EX_SOFTWARE, "Failed to encode public key: {}", e),
    };

    if let Err(e) = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .and_then(|mut f| f.write_all(&pem).and_then(|_| f.sync_all()))
    {
        die!(EX_CANTCREAT, "Failed to write '{}': {}", path.display(), e);
    }

    println!("Wrote signing key to {}", path.display());
    println!("Publish this TXT record:\n");
    println!(
        "{}._domainkey.{}. IN TXT {}",
        config.dkim.selector,
        config.identity.domain,
        quote_txt(&txt),
    );
}

/// Split `txt` into the quoted character-strings of a TXT record, none of
/// which may exceed 255 bytes.
fn quote_txt(txt: &str) -> String {
    txt.as_bytes()
        .chunks(255)
        .map(|chunk| format!("\"{}\"", String::from_utf8_lossy(chunk)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_record_is_one_string() {
        assert_eq!("\"v=DKIM1; p=abc\"", quote_txt("v=DKIM1; p=abc"));
    }

    #[test]
    fn long_record_is_split() {
        let key = dkim::generate_key().unwrap();
        let txt = dkim::dns_txt_record(&key).unwrap();
        assert!(txt.len() > 255);

        let quoted = quote_txt(&txt);
        let parts = quoted.split("\" \"").collect::<Vec<_>>();
        assert_eq!((txt.len() + 254) / 255, parts.len());
        assert_eq!(txt, parts.concat().trim_matches('"'));
    }
}
