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

use std::fmt::{self, Write as _};

use chrono::prelude::*;

/// A timestamped log of one delivery attempt.
///
/// On failure, the tail of the transcript becomes the `last_error` of the
/// queue row.
#[derive(Default)]
pub struct Transcript {
    buffer: String,
    last_entry: Option<DateTime<Utc>>,
}

/// The most of a transcript kept as `last_error`.
const MAX_SUMMARY: usize = 4096;

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        let now = Utc::now();
        let now_fmt = now.format("%Y-%m-%d %H:%M:%S");
        if let Some(last_entry) = self.last_entry {
            let delta =
                now.signed_duration_since(last_entry).num_milliseconds();
            let _ = writeln!(self.buffer, "{now_fmt} ({delta:+5}ms) {args}");
        } else {
            let _ = writeln!(self.buffer, "{now_fmt} {args}");
        }

        self.last_entry = Some(now);
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// The last `MAX_SUMMARY` bytes of the transcript, cut at a line
    /// boundary where possible.
    pub fn summary(&self) -> &str {
        if self.buffer.len() <= MAX_SUMMARY {
            return &self.buffer;
        }

        let mut start = self.buffer.len() - MAX_SUMMARY;
        while !self.buffer.is_char_boundary(start) {
            start += 1;
        }
        let tail = &self.buffer[start..];
        match tail.find('\n') {
            Some(nl) if nl + 1 < tail.len() => &tail[nl + 1..],
            _ => tail,
        }
    }
}
