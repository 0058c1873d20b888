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

//! Naive Bayesian content classification.
//!
//! Training is Bernoulli: a token counts at most once per document.

use std::collections::{HashMap, HashSet};

use crate::store::{BayesCounts, Store};
use crate::support::error::Error;

const MIN_TOKEN_LEN: usize = 3;
const MAX_TOKEN_LEN: usize = 20;
/// How many of the most decisive tokens are combined.
const INTERESTING_TOKENS: usize = 15;
/// The probability reported when nothing in the message has been seen.
const UNKNOWN_PROBABILITY: f64 = 0.4;

/// Split `text` into distinct lowercase tokens, in order of first
/// appearance.
///
/// Tokens are runs of letters, digits, `$` and `-`, between 3 and 20
/// characters long, not starting with a digit.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !(c.is_alphanumeric() || '$' == c || '-' == c))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| {
            let len = w.chars().count();
            (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&len)
                && !w.starts_with(|c: char| c.is_numeric())
        })
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Combine per-token counts into the probability that a message made of
/// `tokens` is spam.
///
/// Untrained classifiers and empty messages give 0.0.
pub fn combine(
    totals: BayesCounts,
    counts: &HashMap<String, BayesCounts>,
    tokens: &[String],
) -> f64 {
    if tokens.is_empty() || (0 == totals.spam && 0 == totals.ham) {
        return 0.0;
    }

    let freq = |n: u64, total: u64| {
        if 0 == total {
            0.0
        } else {
            n as f64 / total as f64
        }
    };

    let mut probabilities = tokens
        .iter()
        .filter_map(|t| counts.get(t))
        .filter_map(|c| {
            let spam = freq(c.spam, totals.spam);
            let ham = freq(c.ham, totals.ham);
            if 0.0 == spam && 0.0 == ham {
                None
            } else {
                Some((spam / (spam + ham)).clamp(0.01, 0.99))
            }
        })
        .collect::<Vec<f64>>();

    if probabilities.is_empty() {
        return UNKNOWN_PROBABILITY;
    }

    probabilities.sort_by(|a, b| {
        (b - 0.5).abs().total_cmp(&(a - 0.5).abs())
    });
    probabilities.truncate(INTERESTING_TOKENS);

    let (product, inverse) = probabilities
        .iter()
        .fold((1.0, 1.0), |(p, q), &prob| (p * prob, q * (1.0 - prob)));
    product / (product + inverse)
}

/// The probability that `text` is spam, according to training so far.
pub fn classify(store: &Store, text: &str) -> Result<f64, Error> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Ok(0.0);
    }

    let totals = store.bayes_totals()?;
    if 0 == totals.spam && 0 == totals.ham {
        return Ok(0.0);
    }

    let counts = store.bayes_counts(&tokens)?;
    Ok(combine(totals, &counts, &tokens))
}

/// Train `text` as one spam or ham document.
pub fn train(store: &Store, text: &str, is_spam: bool) -> Result<(), Error> {
    store.bayes_train(&tokenize(text), is_spam)
}
