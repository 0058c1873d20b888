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

//! Evaluation of parsed Sieve scripts.
//!
//! Evaluation is pure: it only decides where the message goes and whether a
//! vacation reply is wanted. Acting on that is up to the caller.

use lazy_static::lazy_static;
use regex::Regex;

use super::parse::{Command, MatchType, Script, Test, Vacation};
use crate::mime::header::Headers;
use crate::store::canonical_mailbox_name;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// The mailboxes the message is to be stored in, without duplicates, in
    /// the order they were chosen. Empty means discard.
    pub targets: Vec<String>,
    /// The first `vacation` action executed, if any.
    pub vacation: Option<Vacation>,
}

#[derive(Default)]
struct State {
    targets: Vec<String>,
    discarded: bool,
    stopped: bool,
    vacation: Option<Vacation>,
}

impl State {
    fn file_into(&mut self, mailbox: &str) {
        let mailbox = canonical_mailbox_name(mailbox);
        if !self.targets.iter().any(|t| t == mailbox) {
            self.targets.push(mailbox.to_owned());
        }
    }
}

/// Run `script` over a message with `headers`.
///
/// `implicit_keep` is the mailbox used when the script neither files nor
/// discards the message.
pub fn evaluate(
    script: &Script,
    headers: &Headers,
    implicit_keep: &str,
) -> Outcome {
    let mut state = State::default();
    run_block(&mut state, script, headers);

    if state.targets.is_empty() && !state.discarded {
        state.file_into(implicit_keep);
    }

    Outcome {
        targets: state.targets,
        vacation: state.vacation,
    }
}

fn run_block(state: &mut State, block: &[Command], headers: &Headers) {
    for command in block {
        if state.stopped {
            return;
        }

        match *command {
            Command::Require(_) | Command::Unknown(_) => {},
            Command::Keep => state.file_into("INBOX"),
            Command::Discard => state.discarded = true,
            Command::FileInto(ref mailbox) => state.file_into(mailbox),
            Command::Stop => state.stopped = true,
            Command::Vacation(ref vacation) => {
                if state.vacation.is_none() {
                    state.vacation = Some(vacation.clone());
                }
            },
            Command::If {
                ref branches,
                ref otherwise,
            } => {
                let chosen = branches
                    .iter()
                    .find(|(test, _)| test_matches(test, headers))
                    .map(|(_, block)| block)
                    .or(otherwise.as_ref());
                if let Some(block) = chosen {
                    run_block(state, block, headers);
                }
            },
        }
    }
}

fn test_matches(test: &Test, headers: &Headers) -> bool {
    match *test {
        Test::True => true,
        Test::False => false,
        Test::Not(ref inner) => !test_matches(inner, headers),
        Test::AnyOf(ref tests) => {
            tests.iter().any(|t| test_matches(t, headers))
        },
        Test::AllOf(ref tests) => {
            tests.iter().all(|t| test_matches(t, headers))
        },
        Test::Header {
            match_type,
            ref names,
            ref keys,
        } => names.iter().any(|name| {
            headers.get_all(name).any(|value| {
                keys.iter().any(|key| value_matches(match_type, value, key))
            })
        }),
    }
}

/// Compare `value` against `key` with the `i;ascii-casemap` comparator.
pub fn value_matches(match_type: MatchType, value: &str, key: &str) -> bool {
    match match_type {
        MatchType::Is => value.eq_ignore_ascii_case(key),
        MatchType::Contains => value
            .to_ascii_lowercase()
            .contains(&key.to_ascii_lowercase()),
        MatchType::Matches => glob_matches(value, key),
    }
}

/// `*` matches any sequence and `?` any single character. A backslash
/// escapes the next character.
fn glob_matches(value: &str, pattern: &str) -> bool {
    lazy_static! {
        static ref SPECIAL: Regex = Regex::new(r"\\.|\*|\?|[^\\*?]+").unwrap();
    }

    let mut regex = String::from("(?is)^");
    for piece in SPECIAL.find_iter(pattern) {
        match piece.as_str() {
            "*" => regex.push_str(".*"),
            "?" => regex.push('.'),
            s if s.starts_with('\\') => regex.push_str(&regex::escape(&s[1..])),
            s => regex.push_str(&regex::escape(s)),
        }
    }
    regex.push('$');

    Regex::new(&regex).is_ok_and(|r| r.is_match(value))
}

#[cfg(test)]
mod test {
    use super::super::parse::parse;
    use super::*;

    fn run(script: &str, headers: &[(&str, &str)]) -> Outcome {
        evaluate(
            &parse(script).unwrap(),
            &Headers::from_pairs(headers),
            "INBOX",
        )
    }

    fn targets(script: &str, headers: &[(&str, &str)]) -> Vec<String> {
        run(script, headers).targets
    }

    #[test]
    fn implicit_and_explicit_keep() {
        assert_eq!(vec!["INBOX"], targets("", &[]));
        assert_eq!(
            vec!["INBOX"],
            targets(
                "if header :contains \"Subject\" \"spam\" { discard; }",
                &[("Subject", "Hello")]
            )
        );
        assert_eq!(vec!["INBOX"], targets("keep; keep;", &[]));
        assert_eq!(
            vec!["Junk"],
            evaluate(&Vec::new(), &Headers::default(), "Junk").targets
        );
    }

    #[test]
    fn discard_and_fileinto() {
        assert!(targets("discard;", &[]).is_empty());
        assert_eq!(
            vec!["Junk"],
            targets("require \"fileinto\"; fileinto \"Junk\";", &[])
        );
        assert_eq!(
            vec!["Work", "INBOX"],
            targets("require \"fileinto\"; fileinto \"Work\"; keep;", &[])
        );
        assert_eq!(
            vec!["INBOX"],
            targets("fileinto \"inbox\"; fileinto \"InBox\";", &[])
        );
        // An explicit fileinto survives a later discard
        assert_eq!(vec!["Work"], targets("fileinto \"Work\"; discard;", &[]));
    }

    #[test]
    fn stop_ends_everything() {
        assert_eq!(
            vec!["INBOX"],
            targets(
                "if true { stop; } fileinto \"Never\";",
                &[]
            )
        );
        assert!(targets("discard; stop; keep;", &[]).is_empty());
    }

    #[test]
    fn branches() {
        let script = r#"
if header :is "X-List" "a" { fileinto "A"; }
elsif header :is "X-List" "b" { fileinto "B"; }
else { fileinto "Other"; }
"#;
        assert_eq!(vec!["A"], targets(script, &[("X-List", "A")]));
        assert_eq!(vec!["B"], targets(script, &[("x-list", "b")]));
        assert_eq!(vec!["Other"], targets(script, &[("X-List", "c")]));
        assert_eq!(vec!["Other"], targets(script, &[]));
    }

    #[test]
    fn compound_tests() {
        let script = r#"
if allof (header :contains "From" "boss", not header :is "Subject" "") {
    fileinto "Boss";
}
if anyof (false, header :matches "Subject" ["*invoice*", "receipt ?"]) {
    fileinto "Money";
}
"#;
        assert_eq!(
            vec!["Boss"],
            targets(script, &[("From", "The Boss <b@x>"), ("Subject", "hi")])
        );
        assert_eq!(
            vec!["Money"],
            targets(script, &[("From", "shop@x"), ("Subject", "Your INVOICE")])
        );
        assert_eq!(
            vec!["Money"],
            targets(script, &[("Subject", "receipt 7")])
        );
        assert_eq!(
            vec!["INBOX"],
            targets(script, &[("Subject", "receipt 77")])
        );
    }

    #[test]
    fn every_header_instance_is_tested() {
        assert_eq!(
            vec!["Found"],
            targets(
                "if header :is \"Received\" \"b\" { fileinto \"Found\"; }",
                &[("Received", "a"), ("Received", "b")]
            )
        );
    }

    #[test]
    fn glob() {
        assert!(glob_matches("foo.bar", "foo.bar"));
        assert!(!glob_matches("fooxbar", "foo.bar"));
        assert!(glob_matches("anything", "*"));
        assert!(glob_matches("", "*"));
        assert!(!glob_matches("", "?"));
        assert!(glob_matches("a*b", "a\\*b"));
        assert!(!glob_matches("axb", "a\\*b"));
        assert!(glob_matches("Multi\nLine", "multi*line"));
    }

    #[test]
    fn vacation_is_reported_once() {
        let outcome = run(
            "vacation :days 2 \"one\"; vacation \"two\"; discard;",
            &[],
        );
        assert!(outcome.targets.is_empty());
        let vacation = outcome.vacation.unwrap();
        assert_eq!("one", vacation.reason);
        assert_eq!(Some(2), vacation.days);
    }
}
