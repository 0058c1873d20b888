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

//! Turns the classifier's opinion of a message into an action.

use std::fmt::Write as _;

use log::warn;

use super::bayes;
use crate::store::Store;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SpamConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Pass,
    /// Accept, but mark as spam.
    AddHeader,
    Reject,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    pub action: Action,
    pub score: f64,
    /// The classifier probability, if it could be computed.
    pub probability: Option<f64>,
}

impl Verdict {
    /// Whether the message should be marked and filed as spam.
    pub fn is_spam(&self) -> bool {
        Action::Pass != self.action
    }

    /// The `X-Spam-*` header block to prepend to the message, CRLF
    /// terminated.
    pub fn headers(&self) -> String {
        let mut h = format!(
            "X-Spam-Score: {:.2}\r\nX-Spam-Status: {}\r\n",
            self.score,
            if self.is_spam() { "Yes" } else { "No" },
        );
        if let Some(p) = self.probability {
            let _ = write!(h, "X-Spam-Details: Bayes:{p:.2};\r\n");
        }
        h
    }
}

/// The score contribution of a classifier probability.
pub fn probability_score(p: f64) -> f64 {
    if p > 0.9 {
        5.0
    } else if p > 0.7 {
        2.0
    } else if p < 0.1 {
        -2.0
    } else {
        0.0
    }
}

/// Decide what to do with a message of `score`.
pub fn decide(config: &SpamConfig, score: f64) -> Action {
    if config.reject_score > 0.0 && score >= config.reject_score {
        Action::Reject
    } else if config.header_score > 0.0 && score >= config.header_score {
        Action::AddHeader
    } else {
        Action::Pass
    }
}

/// Score the plaintext of a message.
///
/// A classifier failure is logged and contributes nothing.
pub fn check(
    log_prefix: &LogPrefix,
    config: &SpamConfig,
    store: &Store,
    plaintext: &str,
) -> Verdict {
    if !config.enabled {
        return Verdict {
            action: Action::Pass,
            score: 0.0,
            probability: None,
        };
    }

    let probability = match bayes::classify(store, plaintext) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("{log_prefix} Bayesian classification failed: {e}");
            None
        },
    };
    let score = probability.map_or(0.0, probability_score);

    Verdict {
        action: decide(config, score),
        score,
        probability,
    }
}
