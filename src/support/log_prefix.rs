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

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// emitted on behalf of one session.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    peer: Option<String>,
    user: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                peer: None,
                user: None,
                helo: None,
            })),
        }
    }

    pub fn deep_clone(&self) -> Self {
        let inner = self.lock().clone();
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn set_peer(&self, peer: String) {
        self.lock().peer = Some(sanitise(peer));
    }

    pub fn set_user(&self, user: String) {
        self.lock().user = Some(sanitise(user));
    }

    pub fn set_helo(&self, helo: String) {
        self.lock().helo = Some(sanitise(helo));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while formatting a log line must not silence all further
        // logging for the session.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock();
        write!(f, "{}", inner.protocol)?;
        if let Some(ref peer) = inner.peer {
            write!(f, ":{peer}")?;
        }

        if inner.user.is_some() || inner.helo.is_some() {
            write!(f, "[")?;
            let mut first = true;
            if let Some(ref user) = inner.user {
                write!(f, "{user}")?;
                first = false;
            }

            if let Some(ref helo) = inner.helo {
                if !mem::take(&mut first) {
                    write!(f, " ")?;
                }
                write!(f, "helo={helo}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats_all_parts() {
        let prefix = LogPrefix::new("smtpin".to_owned());
        assert_eq!("smtpin", prefix.to_string());

        prefix.set_peer("192.0.2.7".to_owned());
        assert_eq!("smtpin:192.0.2.7", prefix.to_string());

        prefix.set_helo("mx.example.net".to_owned());
        assert_eq!("smtpin:192.0.2.7[helo=mx.example.net]", prefix.to_string());

        prefix.set_user("u@local".to_owned());
        assert_eq!(
            "smtpin:192.0.2.7[u@local helo=mx.example.net]",
            prefix.to_string()
        );
    }

    #[test]
    fn sanitises_hostile_input() {
        let prefix = LogPrefix::new("imap".to_owned());
        prefix.set_user(format!("evil\r\n{}", "x".repeat(100)));
        let s = prefix.to_string();
        assert!(!s.contains('\n'));
        assert_eq!("imap[".len() + 64 + "]".len(), s.len());
    }

    #[test]
    fn deep_clone_is_independent() {
        let a = LogPrefix::new("smtpin".to_owned());
        let b = a.deep_clone();
        b.set_user("x@y".to_owned());
        assert_eq!("smtpin", a.to_string());
    }
}
