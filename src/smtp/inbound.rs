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

//! The inbound SMTP receiver (RFC 5321, port 25).
//!
//! `server` speaks the protocol; `smtpin` decides what is accepted; they talk
//! through `bridge`. Accepted messages are stored by `delivery`.

mod bridge;
mod delivery;
mod server;
mod smtpin;

#[cfg(test)]
mod integration_test_common;
#[cfg(test)]
mod smtpin_integration_tests;

pub use self::delivery::{Incoming, Ingester, Recipient};
pub use self::smtpin::{serve_smtpin, SmtpInContext};
