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

use super::main::open_store;
use crate::store::OutboundMessage;
use crate::support::system_config::SystemConfig;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(super) fn list(config: SystemConfig) {
    let store = open_store(&config);
    let rows = match store.list_queue() {
        Ok(rows) => rows,
        Err(e) => die!(EX_UNAVAILABLE, "Failed to read queue: {}", e),
    };

    if rows.is_empty() {
        println!("Queue is empty");
        return;
    }

    println!(
        "{:<26} {:<10} {:>5} {:<19} {:<19} SENDER -> RECIPIENT",
        "ID", "STATUS", "TRIES", "CREATED", "NEXT RETRY",
    );
    for row in &rows {
        println!("{}", format_row(row));
    }
}

fn format_row(row: &OutboundMessage) -> String {
    let mut line = format!(
        "{:<26} {:<10} {:>5} {:<19} {:<19} <{}> -> <{}>",
        row.id,
        row.status,
        row.retry_count,
        row.created_at.0.format(TIME_FORMAT),
        if row.status.is_terminal() {
            "-".to_owned()
        } else {
            row.next_retry_at.0.format(TIME_FORMAT).to_string()
        },
        row.sender,
        row.recipient,
    );

    if let Some(ref last_error) = row.last_error {
        line.push_str("\n    ");
        line.push_str(last_error);
    }

    line
}
