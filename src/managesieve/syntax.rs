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

//! Command grammar of RFC 5804.
//!
//! Like IMAP, the input is a whole command with its literals already read
//! in and its line ending removed.

use std::str;

use nom::{
    branch::alt,
    bytes::complete::{tag, take, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt},
    error::ErrorKind,
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

type PResult<'a, T> = IResult<&'a [u8], T>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    StartTls,
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
    PutScript {
        name: String,
        content: String,
    },
    ListScripts,
    GetScript(String),
    DeleteScript(String),
    SetActive(String),
    HaveSpace {
        name: String,
        size: u64,
    },
    RenameScript {
        old_name: String,
        new_name: String,
    },
    CheckScript(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Arg {
    Str(String),
    Num(u64),
}

fn fail(i: &[u8]) -> nom::Err<(&[u8], ErrorKind)> {
    nom::Err::Error((i, ErrorKind::Verify))
}

fn number(i: &[u8]) -> PResult<'_, u64> {
    map_res(digit1, |d: &[u8]| {
        str::from_utf8(d)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u64>().map_err(|_| ()))
    })(i)
}

fn quoted(i: &[u8]) -> PResult<'_, String> {
    let (mut i, _) = char('"')(i)?;
    let mut out = Vec::new();
    loop {
        match i.split_first() {
            Some((b'"', rest)) => {
                i = rest;
                break;
            },
            Some((b'\\', rest)) => match rest.split_first() {
                Some((&c, rest)) if b'"' == c || b'\\' == c => {
                    out.push(c);
                    i = rest;
                },
                _ => return Err(fail(i)),
            },
            Some((&c, rest)) if b'\r' != c && b'\n' != c && 0 != c => {
                out.push(c);
                i = rest;
            },
            _ => return Err(fail(i)),
        }
    }

    let s = String::from_utf8(out).map_err(|_| fail(i))?;
    Ok((i, s))
}

fn literal(i: &[u8]) -> PResult<'_, String> {
    let (i, len) = terminated(
        delimited(char('{'), number, pair(opt(char('+')), char('}'))),
        tag("\r\n"),
    )(i)?;
    let (i, data) = take(len as usize)(i)?;
    let s = str::from_utf8(data).map_err(|_| fail(i))?;
    Ok((i, s.to_owned()))
}

fn string(i: &[u8]) -> PResult<'_, String> {
    alt((quoted, literal))(i)
}

fn verb(i: &[u8]) -> PResult<'_, String> {
    map_res(take_while1(|c: u8| c.is_ascii_alphabetic()), |v: &[u8]| {
        str::from_utf8(v).map(str::to_ascii_uppercase)
    })(i)
}

fn arg(i: &[u8]) -> PResult<'_, Arg> {
    alt((map(string, Arg::Str), map(number, Arg::Num)))(i)
}

fn words(i: &[u8]) -> PResult<'_, (String, Vec<Arg>)> {
    pair(verb, many0(preceded(char(' '), arg)))(i)
}

/// Parse one command. The error is suitable for a `NO` response.
pub fn parse_command(line: &[u8]) -> Result<Command, String> {
    let (verb, args) = match all_consuming(words)(line) {
        Ok((_, v)) => v,
        Err(_) => return Err("Syntax error".to_owned()),
    };

    let mut args = args.into_iter();
    let mut next_str = || match args.next() {
        Some(Arg::Str(s)) => Ok(s),
        Some(Arg::Num(n)) => Ok(n.to_string()),
        None => Err(format!("Missing argument to {verb}")),
    };

    let command = match verb.as_str() {
        "CAPABILITY" => Command::Capability,
        "NOOP" => {
            // An optional tag to echo; not supported, but tolerated.
            let _ = next_str();
            Command::Noop
        },
        "LOGOUT" => Command::Logout,
        "STARTTLS" => Command::StartTls,
        "AUTHENTICATE" => Command::Authenticate {
            mechanism: next_str()?,
            initial: next_str().ok(),
        },
        "PUTSCRIPT" => Command::PutScript {
            name: next_str()?,
            content: next_str()?,
        },
        "LISTSCRIPTS" => Command::ListScripts,
        "GETSCRIPT" => Command::GetScript(next_str()?),
        "DELETESCRIPT" => Command::DeleteScript(next_str()?),
        "SETACTIVE" => Command::SetActive(next_str()?),
        "HAVESPACE" => {
            let name = next_str()?;
            let size = match args.next() {
                Some(Arg::Num(n)) => n,
                _ => return Err("HAVESPACE needs a size".to_owned()),
            };
            Command::HaveSpace { name, size }
        },
        "RENAMESCRIPT" => Command::RenameScript {
            old_name: next_str()?,
            new_name: next_str()?,
        },
        "CHECKSCRIPT" => Command::CheckScript(next_str()?),
        _ => return Err(format!("Unknown command {verb}")),
    };

    if args.next().is_some() {
        return Err("Too many arguments".to_owned());
    }

    Ok(command)
}

/// Parse the client's reply to an `AUTHENTICATE` continuation: a string, or
/// a bare token for clients which do not quote it.
pub fn parse_sasl_reply(line: &[u8]) -> Option<String> {
    all_consuming(alt((
        string,
        map_res(take_while1(|c: u8| c > b' ' && c < 0x7F), |v: &[u8]| {
            str::from_utf8(v).map(str::to_owned)
        }),
    )))(line)
    .ok()
    .map(|(_, s)| s)
}

/// Append `s` to `out` as a quoted string, or as a literal if quoting cannot
/// represent it.
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    if s.len() < 1024
        && !s.bytes().any(|b| b'\r' == b || b'\n' == b || 0 == b)
    {
        out.push(b'"');
        for b in s.bytes() {
            if b'"' == b || b'\\' == b {
                out.push(b'\\');
            }
            out.push(b);
        }
        out.push(b'"');
    } else {
        out.extend_from_slice(format!("{{{}}}\r\n", s.len()).as_bytes());
        out.extend_from_slice(s.as_bytes());
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(Ok(Command::Capability), parse_command(b"capability"));
        assert_eq!(Ok(Command::ListScripts), parse_command(b"LISTSCRIPTS"));
        assert_eq!(
            Ok(Command::Authenticate {
                mechanism: "PLAIN".to_owned(),
                initial: Some("AGZvbwBiYXI=".to_owned()),
            }),
            parse_command(b"AUTHENTICATE \"PLAIN\" \"AGZvbwBiYXI=\""),
        );
        assert_eq!(
            Ok(Command::PutScript {
                name: "vacation".to_owned(),
                content: "keep;\r\n".to_owned(),
            }),
            parse_command(b"PUTSCRIPT \"vacation\" {7+}\r\nkeep;\r\n"),
        );
        assert_eq!(
            Ok(Command::HaveSpace {
                name: "big".to_owned(),
                size: 123456,
            }),
            parse_command(b"HAVESPACE \"big\" 123456"),
        );
        assert_eq!(
            Ok(Command::RenameScript {
                old_name: "a".to_owned(),
                new_name: "b\"c".to_owned(),
            }),
            parse_command(b"RENAMESCRIPT \"a\" \"b\\\"c\""),
        );
        assert_eq!(
            Ok(Command::SetActive(String::new())),
            parse_command(b"SETACTIVE \"\"")
        );
    }

    #[test]
    fn reject_bad_commands() {
        assert!(parse_command(b"FROB").is_err());
        assert!(parse_command(b"GETSCRIPT").is_err());
        assert!(parse_command(b"GETSCRIPT \"a\" \"b\"").is_err());
        assert!(parse_command(b"HAVESPACE \"a\" \"b\"").is_err());
        assert!(parse_command(b"PUTSCRIPT \"a\" {10+}\r\nshort").is_err());
        assert!(parse_command(b"GETSCRIPT \"unterminated").is_err());
    }

    #[test]
    fn sasl_replies() {
        assert_eq!(Some("abc=".to_owned()), parse_sasl_reply(b"\"abc=\""));
        assert_eq!(Some("abc=".to_owned()), parse_sasl_reply(b"abc="));
        assert_eq!(Some("*".to_owned()), parse_sasl_reply(b"\"*\""));
        assert_eq!(None, parse_sasl_reply(b"two words"));
    }

    proptest! {
        #[test]
        fn written_strings_parse_back(
            s in "[^\r\n\0]{0,40}|(?s).{0,8}\r\n.{0,8}",
        ) {
            let mut line = b"GETSCRIPT ".to_vec();
            write_string(&mut line, &s);
            prop_assert_eq!(Ok(Command::GetScript(s)), parse_command(&line));
        }
    }
}
