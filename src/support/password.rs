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

//! Password hashing for user accounts.

use rand::{rngs::OsRng, Rng};

use crate::support::error::Error;

/// Hash `password` into the self-describing Argon2 encoded form.
pub fn hash(password: &str) -> Result<String, Error> {
    let salt: [u8; 16] = OsRng.gen();
    let config = argon2::Config {
        variant: argon2::Variant::Argon2id,
        ..argon2::Config::default()
    };
    argon2::hash_encoded(password.as_bytes(), &salt, &config)
        .map_err(|e| Error::StorageFailure(format!("argon2: {e}")))
}

/// Check `password` against a hash produced by `hash`.
///
/// A malformed stored hash is treated as a mismatch.
pub fn verify(encoded: &str, password: &str) -> bool {
    argon2::verify_encoded(encoded, password.as_bytes()).unwrap_or(false)
}

/// Generate a random password of `len` characters from an alphabet without
/// easily confused characters.
pub fn generate(len: usize) -> String {
    const ALPHABET: &[u8] =
        b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = OsRng;
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0, ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let h = hash("hunter2").unwrap();
        assert!(h.starts_with("$argon2id$"));
        assert!(verify(&h, "hunter2"));
        assert!(!verify(&h, "hunter3"));
        assert!(!verify("garbage", "hunter2"));
        assert_ne!(h, hash("hunter2").unwrap());
    }

    #[test]
    fn generated_passwords() {
        let p = generate(16);
        assert_eq!(16, p.len());
        assert!(p.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
