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

//! Messages passed between the SMTP protocol server and the service that
//! decides what to accept.
//!
//! The protocol server owns the socket and the command state machine. For
//! each command that needs a decision it sends a `Request` and waits for the
//! `Verdict` on the attached channel, so the service can be written as one
//! straight-line async function that also streams the message body.

use std::borrow::Cow;

use tokio::sync::oneshot;

use super::super::codes::*;

/// A reply to the client, minus the continuation/final distinction.
#[derive(Clone, Debug)]
pub struct SmtpResponse<'a>(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'a, str>,
);

/// `Ok` lets the server send its usual success reply; `Err` replaces it.
pub type Verdict = Result<(), SmtpResponse<'static>>;

impl SmtpResponse<'static> {
    /// The reply for a request the protocol server should never have let
    /// through in the current state. Tests treat this as a bug.
    pub fn out_of_sequence() -> Self {
        if cfg!(test) {
            panic!("request arrived out of sequence");
        }

        Self(
            pc::BadSequenceOfCommands,
            Some((cc::PermFail, sc::InvalidCommand)),
            Cow::Borrowed("Unexpected command"),
        )
    }
}

pub struct Request {
    pub payload: RequestPayload,
    pub respond: oneshot::Sender<Verdict>,
}

pub enum RequestPayload {
    Helo(HeloRequest),
    Mail(MailRequest),
    Recipient(RecipientRequest),
    Data(DataRequest),
    Reset,
}

/// HELO or EHLO. Sent again after STARTTLS.
pub struct HeloRequest {
    /// Whether the client used EHLO.
    pub extended: bool,
    pub host: String,
    /// Protocol and cipher, once TLS is up.
    pub tls: Option<String>,
}

pub struct MailRequest {
    /// Empty for the null sender.
    pub from: String,
    /// The client's `SIZE=` parameter.
    pub size: Option<u64>,
}

pub struct RecipientRequest {
    pub to: String,
}

/// Start of the message body.
///
/// The service first answers on `respond` whether it wants the body at all.
/// It then reads `data` until EOF and drops it. After that, `completion`
/// yields the channel for the final verdict; if `completion` is closed
/// instead, the client aborted and the body must be thrown away.
pub struct DataRequest {
    pub data: tokio::io::DuplexStream,
    pub completion: oneshot::Receiver<oneshot::Sender<Verdict>>,
}
