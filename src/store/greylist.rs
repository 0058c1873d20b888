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

use rusqlite::OptionalExtension as _;

use super::{types::*, ConnectionExt as _, Store};
use crate::support::error::Error;

impl Store {
    /// Record a delivery attempt for `triplet` at `now` and decide whether it
    /// may proceed.
    ///
    /// The first attempt creates the entry and is refused. Later attempts are
    /// refused until `retry_delay` has elapsed since the first one, counting
    /// each refusal. The decision and the update happen in one transaction.
    pub fn greylist_observe(
        &self,
        triplet: &Triplet,
        now: UnixTimestamp,
        retry_delay: chrono::Duration,
    ) -> Result<bool, Error> {
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        let first_seen = txn
            .prepare_cached(
                "SELECT `first_seen` FROM `greylist` \
                 WHERE `ip_net` = ? AND `sender` = ? AND `recipient` = ?",
            )?
            .query_row(
                (&triplet.ip_net, &triplet.sender, &triplet.recipient),
                from_single::<UnixTimestamp>,
            )
            .optional()?;

        let allowed = match first_seen {
            None => {
                txn.execute(
                    "INSERT INTO `greylist` (\
                       `ip_net`, `sender`, `recipient`, \
                       `first_seen`, `last_seen`, `blocked_count`\
                     ) VALUES (?, ?, ?, ?, ?, 1)",
                    (
                        &triplet.ip_net,
                        &triplet.sender,
                        &triplet.recipient,
                        now,
                        now,
                    ),
                )?;
                false
            },

            Some(first_seen) if now.0 - first_seen.0 < retry_delay => {
                txn.execute(
                    "UPDATE `greylist` \
                     SET `last_seen` = ?, \
                         `blocked_count` = `blocked_count` + 1 \
                     WHERE `ip_net` = ? AND `sender` = ? AND `recipient` = ?",
                    (now, &triplet.ip_net, &triplet.sender, &triplet.recipient),
                )?;
                false
            },

            Some(_) => {
                txn.execute(
                    "UPDATE `greylist` SET `last_seen` = ? \
                     WHERE `ip_net` = ? AND `sender` = ? AND `recipient` = ?",
                    (now, &triplet.ip_net, &triplet.sender, &triplet.recipient),
                )?;
                true
            },
        };

        txn.commit()?;
        Ok(allowed)
    }

    pub fn greylist_entry(
        &self,
        triplet: &Triplet,
    ) -> Result<Option<GreylistEntry>, Error> {
        Ok(self
            .cxn()
            .prepare_cached(
                "SELECT * FROM `greylist` \
                 WHERE `ip_net` = ? AND `sender` = ? AND `recipient` = ?",
            )?
            .query_row(
                (&triplet.ip_net, &triplet.sender, &triplet.recipient),
                from_row,
            )
            .optional()?)
    }

    /// Delete every entry last seen strictly before `before`. Returns the
    /// number deleted.
    pub fn greylist_prune(
        &self,
        before: UnixTimestamp,
    ) -> Result<usize, Error> {
        Ok(self.cxn().execute(
            "DELETE FROM `greylist` WHERE `last_seen` < ?",
            (before,),
        )?)
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::super::test_support::*;
    use super::*;

    fn triplet() -> Triplet {
        Triplet {
            ip_net: "203.0.113.0/24".to_owned(),
            sender: "a@e.net".to_owned(),
            recipient: "u@local".to_owned(),
        }
    }

    #[test]
    fn retry_delay_boundary() {
        let ts = test_store();
        let delay = Duration::minutes(5);
        let t0 = UnixTimestamp::now();

        assert!(!ts.greylist_observe(&triplet(), t0, delay).unwrap());
        let just_before = t0 + delay - Duration::milliseconds(1);
        assert!(!ts
            .greylist_observe(&triplet(), just_before, delay)
            .unwrap());
        let entry = ts.greylist_entry(&triplet()).unwrap().unwrap();
        assert_eq!(2, entry.blocked_count);
        assert_eq!(t0.millis(), entry.first_seen.millis());

        let just_after = t0 + delay + Duration::milliseconds(1);
        assert!(ts
            .greylist_observe(&triplet(), just_after, delay)
            .unwrap());
        let entry = ts.greylist_entry(&triplet()).unwrap().unwrap();
        assert_eq!(2, entry.blocked_count);
        assert_eq!(t0.millis(), entry.first_seen.millis());
        assert!(entry.last_seen > entry.first_seen);
    }

    #[test]
    fn prune_respects_expiration() {
        let ts = test_store();
        let delay = Duration::minutes(5);
        let t0 = UnixTimestamp::now();
        let other = Triplet {
            recipient: "v@local".to_owned(),
            ..triplet()
        };

        ts.greylist_observe(&triplet(), t0, delay).unwrap();
        ts.greylist_observe(&other, t0 + Duration::hours(2), delay)
            .unwrap();

        assert_eq!(1, ts.greylist_prune(t0 + Duration::hours(1)).unwrap());
        assert!(ts.greylist_entry(&triplet()).unwrap().is_none());
        assert!(ts.greylist_entry(&other).unwrap().is_some());
        assert_eq!(0, ts.greylist_prune(t0 + Duration::hours(2)).unwrap());
    }
}
