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

//! Bindings for the model types to `rusqlite`, plus the model types
//! themselves.

use std::fmt;
use std::str::FromStr;

use chrono::prelude::*;
use rand::{rngs::OsRng, Rng};
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};
use serde::Serialize;

/// A point in time, stored as integer milliseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixTimestamp(pub DateTime<Utc>);

impl UnixTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn from_millis(ms: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(ms).single().map(Self)
    }
}

impl std::ops::Add<chrono::Duration> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: chrono::Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl std::ops::Sub<chrono::Duration> for UnixTimestamp {
    type Output = Self;

    fn sub(self, rhs: chrono::Duration) -> Self {
        Self(self.0 - rhs)
    }
}

impl ToSql for UnixTimestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.millis()))
    }
}

impl FromSql for UnixTimestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        Self::from_millis(inner).ok_or(FromSqlError::OutOfRange(inner))
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

/// Generate a new server-assigned opaque identifier.
///
/// This is a random (version 4) UUID in its usual textual form.
pub fn new_id() -> String {
    let mut bytes: [u8; 16] = OsRng.gen();
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    let hex = bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// A mailbox-scoped message UID. Always non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub u32);

impl Uid {
    pub const MIN: Self = Uid(1);
}

impl ToSql for Uid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

impl FromSql for Uid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        u32::try_from(inner)
            .ok()
            .filter(|&u| u != 0)
            .map(Uid)
            .ok_or(FromSqlError::OutOfRange(inner))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! text_enum {
    ($t:ident { $($v:ident => $s:expr),* $(,)? }) => {
        impl $t {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($t::$v => $s,)*
                }
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                $(if s.eq_ignore_ascii_case($s) {
                    return Ok($t::$v);
                })*
                Err(())
            }
        }

        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Borrowed(ValueRef::Text(
                    self.as_str().as_bytes(),
                )))
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::from_str(s).map_err(|_| {
                    FromSqlError::Other(
                        format!("bad {} value: {s:?}", stringify!($t)).into(),
                    )
                })
            }
        }

        impl Serialize for $t {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

text_enum!(Role {
    User => "user",
    Admin => "admin",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Retrying,
    Sent,
    Failed,
}

text_enum!(QueueStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Retrying => "RETRYING",
    Sent => "SENT",
    Failed => "FAILED",
});

impl QueueStatus {
    /// Terminal states are never transitioned out of.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }
}

/// The outcome of an SPF, DKIM or DMARC check as recorded on a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

text_enum!(AuthOutcome {
    None => "none",
    Neutral => "neutral",
    Pass => "pass",
    Fail => "fail",
    SoftFail => "softfail",
    TempError => "temperror",
    PermError => "permerror",
});

/// The policy a domain publishes in its DMARC record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

text_enum!(DmarcPolicy {
    None => "none",
    Quarantine => "quarantine",
    Reject => "reject",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AuthResults {
    pub spf: AuthOutcome,
    pub dkim: AuthOutcome,
    pub dmarc: AuthOutcome,
    pub dmarc_policy: DmarcPolicy,
}

impl Default for AuthResults {
    fn default() -> Self {
        Self {
            spf: AuthOutcome::None,
            dkim: AuthOutcome::None,
            dmarc: AuthOutcome::None,
            dmarc_policy: DmarcPolicy::None,
        }
    }
}

/// A stored inbound message in one mailbox.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    /// The `Message-ID` header of the message.
    pub message_id: String,
    pub sender: String,
    /// The owning user.
    pub recipient: String,
    pub subject: String,
    pub snippet: String,
    /// Path of the body blob, relative to the blob root.
    pub body_path: String,
    pub size: u64,
    pub read_state: bool,
    pub received_at: UnixTimestamp,
    pub mailbox: String,
    #[serde(serialize_with = "serialize_uid")]
    pub uid: Uid,
    pub flags: Vec<String>,
    pub modseq: u64,
    pub auth: AuthResults,
}

fn serialize_uid<S: serde::Serializer>(
    uid: &Uid,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(uid.0)
}

impl FromRow for Message {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            sender: row.get("sender")?,
            recipient: row.get("recipient")?,
            subject: row.get("subject")?,
            snippet: row.get("snippet")?,
            body_path: row.get("body_path")?,
            size: row.get::<_, i64>("size")?.max(0) as u64,
            read_state: row.get("read_state")?,
            received_at: row.get("received_at")?,
            mailbox: row.get("mailbox")?,
            uid: row.get("uid")?,
            flags: split_flags(&row.get::<_, String>("flags")?),
            modseq: row.get::<_, i64>("modseq")?.max(0) as u64,
            auth: AuthResults {
                spf: row.get("spf_result")?,
                dkim: row.get("dkim_result")?,
                dmarc: row.get("dmarc_result")?,
                dmarc_policy: row.get("dmarc_policy")?,
            },
        })
    }
}

pub fn split_flags(s: &str) -> Vec<String> {
    s.split(' ')
        .filter(|f| !f.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn join_flags(flags: &[String]) -> String {
    flags.join(" ")
}

/// Everything the ingester knows about a message about to be stored in one
/// mailbox. The UID, modseq and receive time are assigned by the store.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub id: String,
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub snippet: String,
    pub body_path: String,
    pub size: u64,
    pub mailbox: String,
    pub flags: Vec<String>,
    pub auth: AuthResults,
}

#[derive(Clone, Debug, Default)]
pub struct MessageFilter {
    pub mailbox: Option<String>,
    pub is_read: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MailboxStatus {
    pub name: String,
    pub exists: u32,
    pub unseen: u32,
    pub uid_validity: u32,
    pub uid_next: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub quota_bytes: u64,
    pub used_bytes: u64,
    pub created_at: UnixTimestamp,
    pub last_login_at: Option<UnixTimestamp>,
}

impl FromRow for User {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            email: row.get("email")?,
            password_hash: row.get("password_hash")?,
            role: row.get("role")?,
            quota_bytes: row.get::<_, i64>("quota_bytes")?.max(0) as u64,
            used_bytes: row.get::<_, i64>("used_bytes")?.max(0) as u64,
            created_at: row.get("created_at")?,
            last_login_at: row.get("last_login_at")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub blob_key: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub next_retry_at: UnixTimestamp,
    pub last_error: Option<String>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

impl FromRow for OutboundMessage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            sender: row.get("sender")?,
            recipient: row.get("recipient")?,
            blob_key: row.get("blob_key")?,
            status: row.get("status")?,
            retry_count: row.get("retry_count")?,
            next_retry_at: row.get("next_retry_at")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// The key of a greylist entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Triplet {
    /// The sender's network, already masked to /24 or /64.
    pub ip_net: String,
    pub sender: String,
    pub recipient: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GreylistEntry {
    pub first_seen: UnixTimestamp,
    pub last_seen: UnixTimestamp,
    pub blocked_count: u32,
}

impl FromRow for GreylistEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
            blocked_count: row.get("blocked_count")?,
        })
    }
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub fn from_single<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! from_row_tuple {
    ($($ix:tt: $t:ident),*) => {
        impl<$($t: FromSql,)*> FromRow
        for ($($t,)*) {
            fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get($ix)?,)*))
            }
        }
    }
}

from_row_tuple!(0: A, 1: B);
from_row_tuple!(0: A, 1: B, 2: C);
