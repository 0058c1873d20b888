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

//! DKIM (RFC 6376) signing and verification.
//!
//! Only `rsa-sha256` is supported. Signatures produced here always use
//! `relaxed/relaxed` canonicalisation; verification accepts either form.

mod canonicalisation;
mod error;
mod hash;
mod header;
mod sign;
mod verify;

pub use error::*;
pub use header::{
    Algorithm, BodyCanonicalisation, Canonicalisation, Header,
    HeaderCanonicalisation, TxtRecord, HEADER_NAME,
};
pub use sign::{dns_txt_record, generate_key, KeyPair, Signer};
pub use verify::{Outcome, Verifier};
