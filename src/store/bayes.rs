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

use std::collections::{BTreeSet, HashMap};

use rusqlite::OptionalExtension as _;

use super::{types::*, ConnectionExt as _, Store};
use crate::support::error::Error;

/// Per-token and global training counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BayesCounts {
    pub spam: u64,
    pub ham: u64,
}

impl Store {
    /// The number of spam and ham documents trained so far.
    pub fn bayes_totals(&self) -> Result<BayesCounts, Error> {
        let (spam, ham) = self.cxn().query_row(
            "SELECT `total_spam`, `total_ham` FROM `bayes_global` \
             WHERE `id` = 1",
            (),
            from_row::<(i64, i64)>,
        )?;
        Ok(BayesCounts {
            spam: spam.max(0) as u64,
            ham: ham.max(0) as u64,
        })
    }

    /// The counts of every token in `tokens` which has been seen in training.
    pub fn bayes_counts(
        &self,
        tokens: &[String],
    ) -> Result<HashMap<String, BayesCounts>, Error> {
        let mut cxn = self.cxn();
        let txn = cxn.read_tx()?;
        let mut stmt = txn.prepare_cached(
            "SELECT `spam_count`, `ham_count` FROM `bayes_tokens` \
             WHERE `token` = ?",
        )?;

        let mut ret = HashMap::new();
        for token in tokens {
            if let Some((spam, ham)) = stmt
                .query_row((token,), from_row::<(i64, i64)>)
                .optional()?
            {
                ret.insert(
                    token.clone(),
                    BayesCounts {
                        spam: spam.max(0) as u64,
                        ham: ham.max(0) as u64,
                    },
                );
            }
        }

        Ok(ret)
    }

    /// Train one document. Each distinct token counts once, and the global
    /// document total increases by exactly one.
    pub fn bayes_train(
        &self,
        tokens: &[String],
        is_spam: bool,
    ) -> Result<(), Error> {
        let tokens = tokens.iter().collect::<BTreeSet<_>>();
        let (spam, ham) = if is_spam { (1, 0) } else { (0, 1) };

        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;
        {
            let mut stmt = txn.prepare_cached(
                "INSERT INTO `bayes_tokens` \
                   (`token`, `spam_count`, `ham_count`) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT (`token`) DO UPDATE SET \
                   `spam_count` = `spam_count` + `excluded`.`spam_count`, \
                   `ham_count` = `ham_count` + `excluded`.`ham_count`",
            )?;
            for token in tokens {
                stmt.execute((token, spam, ham))?;
            }
        }

        txn.execute(
            "UPDATE `bayes_global` \
             SET `total_spam` = `total_spam` + ?, \
                 `total_ham` = `total_ham` + ? \
             WHERE `id` = 1",
            (spam, ham),
        )?;
        txn.commit()?;
        Ok(())
    }
}
