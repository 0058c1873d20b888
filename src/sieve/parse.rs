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

//! Sieve (RFC 5228) lexing and parsing.
//!
//! Parsing happens in two stages. The first builds a generic command tree
//! straight from the grammar in RFC 5228 § 8; the second lowers that into the
//! `Command` and `Test` types the interpreter understands, validating the
//! arguments of the commands and tests we support along the way.
//!
//! Commands we don't know become `Command::Unknown` and do nothing. Unknown
//! tests are an error, since there is no sensible value to give them.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take, take_until, take_while},
    character::complete::{
        char, digit1, line_ending, multispace1, not_line_ending, one_of,
    },
    combinator::{map, map_res, opt, recognize, value},
    multi::{fold_many0, many0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("line {0}: syntax error")]
    Syntax(usize),
    #[error("line {line}: expected {expected}")]
    Expected {
        line: usize,
        expected: &'static str,
    },
    #[error("unexpected end of script")]
    UnexpectedEnd,
    #[error("line {line}: {message}")]
    Invalid { line: usize, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Require(Vec<String>),
    Keep,
    Discard,
    FileInto(String),
    Stop,
    Vacation(Vacation),
    If {
        /// Each test with the block to run if it is the first to match.
        branches: Vec<(Test, Vec<Command>)>,
        otherwise: Option<Vec<Command>>,
    },
    /// Any command we don't support, which is ignored.
    Unknown(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Test {
    True,
    False,
    Not(Box<Test>),
    AnyOf(Vec<Test>),
    AllOf(Vec<Test>),
    Header {
        match_type: MatchType,
        names: Vec<String>,
        keys: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Is,
    Contains,
    Matches,
}

/// The arguments of a `vacation` action (RFC 5230).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vacation {
    pub days: Option<u64>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub handle: Option<String>,
    pub addresses: Vec<String>,
    pub mime: bool,
    pub reason: String,
}

pub type Script = Vec<Command>;

/// Parse a complete script.
pub fn parse(script: &str) -> Result<Script, Error> {
    let tokens = lex(script)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let mut raw = Vec::new();
    while !parser.at_end() {
        raw.push(parser.command()?);
    }
    lower_block(raw)
}

// ==================== LEXER ====================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Identifier(String),
    Tag(String),
    Number(u64),
    String(String),
    Punct(char),
}

fn hash_comment(i: &str) -> IResult<&str, &str> {
    recognize(pair(char('#'), not_line_ending))(i)
}

fn bracket_comment(i: &str) -> IResult<&str, &str> {
    recognize(delimited(tag("/*"), take_until("*/"), tag("*/")))(i)
}

fn skip(i: &str) -> IResult<&str, ()> {
    value((), many0(alt((multispace1, hash_comment, bracket_comment))))(i)
}

fn identifier(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        one_of("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_"),
        take_while(|c: char| c.is_ascii_alphanumeric() || '_' == c),
    ))(i)
}

fn number(i: &str) -> IResult<&str, u64> {
    map_res(
        pair(digit1, opt(one_of("KkMmGg"))),
        |(digits, unit): (&str, Option<char>)| {
            let multiplier = match unit {
                Some('K') | Some('k') => 1 << 10,
                Some('M') | Some('m') => 1 << 20,
                Some('G') | Some('g') => 1 << 30,
                _ => 1,
            };
            digits.parse::<u64>().map(|n| n.saturating_mul(multiplier))
        },
    )(i)
}

fn quoted(i: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((preceded(char('\\'), take(1usize)), is_not("\\\""))),
            String::new(),
            |mut accum, piece| {
                accum.push_str(piece);
                accum
            },
        ),
        char('"'),
    )(i)
}

/// `text:` through a line consisting of a single `.`, with dot-stuffing
/// removed.
fn multiline(i: &str) -> IResult<&str, String> {
    let (mut i, _) = tuple((
        tag_no_case("text:"),
        take_while(|c| ' ' == c || '\t' == c),
        opt(hash_comment),
        line_ending,
    ))(i)?;

    let mut text = String::new();
    loop {
        let (rest, line) = terminated(not_line_ending, line_ending)(i)?;
        i = rest;
        if "." == line {
            return Ok((i, text));
        }

        text.push_str(line.strip_prefix('.').unwrap_or(line));
        text.push_str("\r\n");
    }
}

fn token(i: &str) -> IResult<&str, Token> {
    alt((
        map(multiline, Token::String),
        map(identifier, |s| Token::Identifier(s.to_ascii_lowercase())),
        map(preceded(char(':'), identifier), |s| {
            Token::Tag(s.to_ascii_lowercase())
        }),
        map(number, Token::Number),
        map(quoted, Token::String),
        map(one_of("[](){},;"), Token::Punct),
    ))(i)
}

fn lex(script: &str) -> Result<Vec<(usize, Token)>, Error> {
    let line_of = |rest: &str| {
        script[..script.len() - rest.len()].matches('\n').count() + 1
    };

    let mut tokens = Vec::new();
    let mut i = script;
    loop {
        i = skip(i).map_err(|_| Error::Syntax(line_of(i)))?.0;
        if i.is_empty() {
            return Ok(tokens);
        }

        let (rest, token) = token(i).map_err(|_| Error::Syntax(line_of(i)))?;
        tokens.push((line_of(i), token));
        i = rest;
    }
}

// ==================== GENERIC GRAMMAR ====================

#[derive(Clone, Debug)]
enum Arg {
    Tag(String),
    Number(u64),
    Strings(Vec<String>),
}

#[derive(Clone, Debug)]
struct RawTest {
    line: usize,
    name: String,
    args: Vec<Arg>,
    tests: Vec<RawTest>,
}

#[derive(Clone, Debug)]
struct RawCommand {
    line: usize,
    name: String,
    args: Vec<Arg>,
    tests: Vec<RawTest>,
    block: Option<Vec<RawCommand>>,
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |&(line, _)| line)
    }

    fn next(&mut self) -> Result<&Token, Error> {
        let (_, token) =
            self.tokens.get(self.pos).ok_or(Error::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn is_punct(&self, c: char) -> bool {
        matches!(self.peek(), Some(&Token::Punct(p)) if p == c)
    }

    fn expect_punct(
        &mut self,
        c: char,
        expected: &'static str,
    ) -> Result<(), Error> {
        if self.is_punct(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::Expected {
                line: self.line(),
                expected,
            })
        }
    }

    fn identifier(&mut self) -> Result<(usize, String), Error> {
        let line = self.line();
        match *self.next()? {
            Token::Identifier(ref name) => Ok((line, name.clone())),
            _ => Err(Error::Expected {
                line,
                expected: "identifier",
            }),
        }
    }

    fn string(&mut self) -> Result<String, Error> {
        let line = self.line();
        match *self.next()? {
            Token::String(ref s) => Ok(s.clone()),
            _ => Err(Error::Expected {
                line,
                expected: "string",
            }),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Arg>, Error> {
        let mut args = Vec::new();
        loop {
            match self.peek() {
                Some(&Token::Tag(ref tag)) => {
                    args.push(Arg::Tag(tag.clone()));
                    self.pos += 1;
                },
                Some(&Token::Number(n)) => {
                    args.push(Arg::Number(n));
                    self.pos += 1;
                },
                Some(&Token::String(ref s)) => {
                    args.push(Arg::Strings(vec![s.clone()]));
                    self.pos += 1;
                },
                Some(&Token::Punct('[')) => {
                    self.pos += 1;
                    let mut list = vec![self.string()?];
                    while self.is_punct(',') {
                        self.pos += 1;
                        list.push(self.string()?);
                    }
                    self.expect_punct(']', "']'")?;
                    args.push(Arg::Strings(list));
                },
                _ => return Ok(args),
            }
        }
    }

    fn tests(&mut self) -> Result<Vec<RawTest>, Error> {
        if self.is_punct('(') {
            self.pos += 1;
            let mut tests = vec![self.test()?];
            while self.is_punct(',') {
                self.pos += 1;
                tests.push(self.test()?);
            }
            self.expect_punct(')', "')'")?;
            Ok(tests)
        } else if matches!(self.peek(), Some(&Token::Identifier(..))) {
            Ok(vec![self.test()?])
        } else {
            Ok(Vec::new())
        }
    }

    fn test(&mut self) -> Result<RawTest, Error> {
        let (line, name) = self.identifier()?;
        let args = self.arguments()?;
        let tests = self.tests()?;
        Ok(RawTest {
            line,
            name,
            args,
            tests,
        })
    }

    fn command(&mut self) -> Result<RawCommand, Error> {
        let (line, name) = self.identifier()?;
        let args = self.arguments()?;
        let tests = self.tests()?;

        let block = if self.is_punct('{') {
            self.pos += 1;
            let mut block = Vec::new();
            while !self.is_punct('}') {
                if self.at_end() {
                    return Err(Error::UnexpectedEnd);
                }
                block.push(self.command()?);
            }
            self.pos += 1;
            Some(block)
        } else {
            self.expect_punct(';', "';'")?;
            None
        };

        Ok(RawCommand {
            line,
            name,
            args,
            tests,
            block,
        })
    }
}

// ==================== LOWERING ====================

fn invalid(line: usize, message: impl Into<String>) -> Error {
    Error::Invalid {
        line,
        message: message.into(),
    }
}

fn lower_block(raw: Vec<RawCommand>) -> Result<Vec<Command>, Error> {
    let mut out = Vec::<Command>::with_capacity(raw.len());
    for cmd in raw {
        let line = cmd.line;
        match &*cmd.name {
            "if" => {
                let (test, block) = lower_conditional(cmd)?;
                out.push(Command::If {
                    branches: vec![(test, block)],
                    otherwise: None,
                });
            },

            "elsif" | "else" => {
                let Some(Command::If {
                    branches,
                    otherwise,
                }) = out.last_mut()
                else {
                    return Err(invalid(
                        line,
                        format!("{} without if", cmd.name),
                    ));
                };
                if otherwise.is_some() {
                    return Err(invalid(
                        line,
                        format!("{} after else", cmd.name),
                    ));
                }

                if "elsif" == cmd.name {
                    branches.push(lower_conditional(cmd)?);
                } else {
                    if !cmd.args.is_empty() || !cmd.tests.is_empty() {
                        return Err(invalid(line, "else takes no arguments"));
                    }
                    let block = cmd
                        .block
                        .ok_or_else(|| invalid(line, "else requires a block"))?;
                    *otherwise = Some(lower_block(block)?);
                }
            },

            _ => out.push(lower_command(cmd)?),
        }
    }

    Ok(out)
}

fn lower_conditional(cmd: RawCommand) -> Result<(Test, Vec<Command>), Error> {
    let line = cmd.line;
    if !cmd.args.is_empty() {
        return Err(invalid(line, format!("{} takes only a test", cmd.name)));
    }
    let mut tests = cmd.tests;
    if 1 != tests.len() {
        return Err(invalid(
            line,
            format!("{} requires exactly one test", cmd.name),
        ));
    }
    let block = cmd
        .block
        .ok_or_else(|| {
            invalid(line, format!("{} requires a block", cmd.name))
        })?;

    Ok((lower_test(tests.remove(0))?, lower_block(block)?))
}

fn no_args(cmd: &RawCommand, command: Command) -> Result<Command, Error> {
    if !cmd.args.is_empty() || !cmd.tests.is_empty() || cmd.block.is_some() {
        return Err(invalid(
            cmd.line,
            format!("{} takes no arguments", cmd.name),
        ));
    }
    Ok(command)
}

fn lower_command(cmd: RawCommand) -> Result<Command, Error> {
    let line = cmd.line;
    match &*cmd.name {
        "require" => match &*cmd.args {
            [Arg::Strings(ref capabilities)] => {
                Ok(Command::Require(capabilities.clone()))
            },
            _ => Err(invalid(line, "require takes a string list")),
        },
        "keep" => no_args(&cmd, Command::Keep),
        "discard" => no_args(&cmd, Command::Discard),
        "stop" => no_args(&cmd, Command::Stop),
        "fileinto" => {
            // Tags of extensions we don't implement, like :copy, are ignored.
            let mut strings = cmd.args.iter().filter_map(|a| match *a {
                Arg::Strings(ref s) => Some(s),
                _ => None,
            });
            match (strings.next().map(Vec::as_slice), strings.next()) {
                (Some([mailbox]), None) if !mailbox.is_empty() => {
                    Ok(Command::FileInto(mailbox.clone()))
                },
                _ => Err(invalid(line, "fileinto takes one mailbox name")),
            }
        },
        "vacation" => lower_vacation(&cmd).map(Command::Vacation),
        _ => Ok(Command::Unknown(cmd.name)),
    }
}

fn lower_vacation(cmd: &RawCommand) -> Result<Vacation, Error> {
    let line = cmd.line;
    let mut vacation = Vacation::default();
    let mut reason = None;

    let single_string =
        |args: &mut std::slice::Iter<'_, Arg>, tag: &str| match args.next() {
            Some(&Arg::Strings(ref s)) if 1 == s.len() => Ok(s[0].clone()),
            _ => Err(invalid(line, format!(":{tag} requires a string"))),
        };

    let mut args = cmd.args.iter();
    while let Some(arg) = args.next() {
        match *arg {
            Arg::Tag(ref tag) => match &**tag {
                "days" => match args.next() {
                    Some(&Arg::Number(n)) => vacation.days = Some(n),
                    _ => return Err(invalid(line, ":days requires a number")),
                },
                "subject" => {
                    vacation.subject = Some(single_string(&mut args, tag)?)
                },
                "from" => vacation.from = Some(single_string(&mut args, tag)?),
                "handle" => {
                    vacation.handle = Some(single_string(&mut args, tag)?)
                },
                "addresses" => match args.next() {
                    Some(&Arg::Strings(ref s)) => {
                        vacation.addresses = s.clone()
                    },
                    _ => {
                        return Err(invalid(line, ":addresses requires strings"))
                    },
                },
                "mime" => vacation.mime = true,
                _ => return Err(invalid(line, format!("unknown tag :{tag}"))),
            },
            Arg::Strings(ref s) if 1 == s.len() && reason.is_none() => {
                reason = Some(s[0].clone());
            },
            _ => return Err(invalid(line, "unexpected vacation argument")),
        }
    }

    vacation.reason =
        reason.ok_or_else(|| invalid(line, "vacation requires a reason"))?;
    Ok(vacation)
}

fn lower_test(test: RawTest) -> Result<Test, Error> {
    let line = test.line;
    let no_args = |t: &RawTest, v: Test| {
        if t.args.is_empty() && t.tests.is_empty() {
            Ok(v)
        } else {
            Err(invalid(line, format!("{} takes no arguments", t.name)))
        }
    };

    match &*test.name {
        "true" => no_args(&test, Test::True),
        "false" => no_args(&test, Test::False),
        "not" => {
            let mut tests = test.tests;
            if 1 != tests.len() || !test.args.is_empty() {
                return Err(invalid(line, "not takes exactly one test"));
            }
            Ok(Test::Not(Box::new(lower_test(tests.remove(0))?)))
        },
        "anyof" | "allof" => {
            if test.tests.is_empty() || !test.args.is_empty() {
                return Err(invalid(
                    line,
                    format!("{} takes a test list", test.name),
                ));
            }
            let tests = test
                .tests
                .into_iter()
                .map(lower_test)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if "anyof" == test.name {
                Test::AnyOf(tests)
            } else {
                Test::AllOf(tests)
            })
        },
        "header" => lower_header(test),
        _ => Err(invalid(line, format!("unsupported test {}", test.name))),
    }
}

fn lower_header(test: RawTest) -> Result<Test, Error> {
    let line = test.line;
    let mut match_type = MatchType::Is;
    let mut lists = Vec::new();

    let mut args = test.args.into_iter();
    while let Some(arg) = args.next() {
        match arg {
            Arg::Tag(tag) => match &*tag {
                "is" => match_type = MatchType::Is,
                "contains" => match_type = MatchType::Contains,
                "matches" => match_type = MatchType::Matches,
                // Only the default comparator is implemented; the names of
                // the others are accepted but have no effect.
                "comparator" => match args.next() {
                    Some(Arg::Strings(..)) => {},
                    _ => {
                        return Err(invalid(
                            line,
                            ":comparator requires a string",
                        ))
                    },
                },
                _ => return Err(invalid(line, format!("unknown tag :{tag}"))),
            },
            Arg::Strings(list) => lists.push(list),
            Arg::Number(_) => {
                return Err(invalid(line, "header does not take a number"))
            },
        }
    }

    let mut lists = lists.into_iter();
    match (lists.next(), lists.next(), lists.next()) {
        (Some(names), Some(keys), None) if test.tests.is_empty() => {
            Ok(Test::Header {
                match_type,
                names,
                keys,
            })
        },
        _ => Err(invalid(line, "header takes a name list and a key list")),
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn strings(s: &[&str]) -> Vec<String> {
        s.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn simple_actions() {
        assert_eq!(
            vec![
                Command::Require(strings(&["fileinto"])),
                Command::FileInto("Work".to_owned()),
                Command::Keep,
                Command::Stop,
                Command::Discard,
            ],
            parse(
                "require \"fileinto\"; # comment\n\
                 fileinto \"Work\";\r\n\
                 keep; /* block\n comment */ STOP; discard;"
            )
            .unwrap()
        );
        assert_eq!(Vec::<Command>::new(), parse("  # nothing\n").unwrap());
    }

    #[test]
    fn conditionals() {
        let script = parse(
            r#"
if header :contains ["Subject", "X-Subject"] "spam" {
    fileinto "Junk";
} elsif anyof (not true, header :matches "From" "*@example.com") {
    discard;
    stop;
} else {
    keep;
}
"#,
        )
        .unwrap();

        assert_eq!(
            vec![Command::If {
                branches: vec![
                    (
                        Test::Header {
                            match_type: MatchType::Contains,
                            names: strings(&["Subject", "X-Subject"]),
                            keys: strings(&["spam"]),
                        },
                        vec![Command::FileInto("Junk".to_owned())],
                    ),
                    (
                        Test::AnyOf(vec![
                            Test::Not(Box::new(Test::True)),
                            Test::Header {
                                match_type: MatchType::Matches,
                                names: strings(&["From"]),
                                keys: strings(&["*@example.com"]),
                            },
                        ]),
                        vec![Command::Discard, Command::Stop],
                    ),
                ],
                otherwise: Some(vec![Command::Keep]),
            }],
            script
        );
    }

    #[test]
    fn vacation_arguments() {
        let script = parse(
            "require \"vacation\";\n\
             vacation :days 3 :subject \"Away\" :from \"me@example.com\" \
             :addresses [\"a@example.com\", \"b@example.com\"] :mime \
             text:\n\
             I am away.\n\
             ..and unreachable\n\
             .\n\
             ;",
        )
        .unwrap();
        assert_eq!(
            Command::Vacation(Vacation {
                days: Some(3),
                subject: Some("Away".to_owned()),
                from: Some("me@example.com".to_owned()),
                handle: None,
                addresses: strings(&["a@example.com", "b@example.com"]),
                mime: true,
                reason: "I am away.\r\n.and unreachable\r\n".to_owned(),
            }),
            script[1]
        );

        assert_matches!(
            Err(Error::Invalid { line: 1, .. }),
            parse("vacation :days 3;")
        );
    }

    #[test]
    fn unknown_commands_are_kept_as_no_ops() {
        assert_eq!(
            vec![
                Command::Unknown("redirect".to_owned()),
                Command::Unknown("setflag".to_owned()),
            ],
            parse("redirect \"x@example.com\"; setflag [\"\\\\Seen\"];")
                .unwrap()
        );
    }

    #[test]
    fn quoted_escapes_and_numbers() {
        assert_eq!(
            vec![Command::FileInto("a\"b\\c".to_owned())],
            parse(r#"fileinto "a\"b\\c";"#).unwrap()
        );
        assert_matches!(
            Command::Vacation(Vacation {
                days: Some(1024),
                ..
            }),
            parse("vacation :days 1K \"r\";").unwrap().remove(0)
        );
    }

    #[test]
    fn errors() {
        assert_matches!(Err(Error::Expected { line: 1, .. }), parse("keep"));
        assert_matches!(Err(Error::UnexpectedEnd), parse("if true {"));
        assert_matches!(Err(Error::Syntax(2)), parse("keep;\n@"));
        assert_matches!(Err(Error::Syntax(1)), parse("fileinto \"Work;"));
        assert_matches!(Err(Error::Invalid { .. }), parse("else { keep; }"));
        assert_matches!(
            Err(Error::Invalid { .. }),
            parse("if size :over 1M { discard; }")
        );
        assert_matches!(Err(Error::Invalid { .. }), parse("if true keep;"));
        assert_matches!(Err(Error::Invalid { .. }), parse("fileinto;"));
        assert_matches!(
            Err(Error::Invalid { .. }),
            parse("if header \"Subject\" { keep; }")
        );
        assert_matches!(
            Err(Error::Invalid { .. }),
            parse("if true { keep; } else { keep; } else { keep; }")
        );
    }

    proptest! {
        #[test]
        fn parse_never_panics(script in "[a-z:;{}()\\[\\]\",# \n0-9.*]{0,80}") {
            let _ = parse(&script);
        }

        #[test]
        fn quoted_strings_round_trip(s in "[^\r\n]{0,40}") {
            let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
            let script = format!("fileinto \"{escaped}\";");
            if s.is_empty() {
                prop_assert!(parse(&script).is_err());
            } else {
                prop_assert_eq!(
                    vec![Command::FileInto(s)],
                    parse(&script).unwrap()
                );
            }
        }
    }
}
