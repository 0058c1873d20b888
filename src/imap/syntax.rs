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

//! Parser for the part of the IMAP4rev1 command grammar the server accepts.
//!
//! The parser runs over a complete command whose literals have already been
//! read in: every `{N}` in the buffer is followed by CRLF and exactly N bytes,
//! and the command's own line ending has been removed.

use std::str;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt, value},
    error::ErrorKind,
    multi::{separated_list, separated_nonempty_list},
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult,
};

type PResult<'a, T> = IResult<&'a [u8], T>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub tag: String,
    pub command: Command,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    StartTls,
    Idle,
    Close,
    Unselect,
    Login {
        user: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
    Select(String),
    Examine(String),
    Create(String),
    List {
        reference: String,
        pattern: String,
    },
    Fetch {
        uid: bool,
        set: SeqSet,
        items: Vec<FetchAtt>,
    },
    Store {
        uid: bool,
        set: SeqSet,
        action: StoreAction,
        silent: bool,
        flags: Vec<String>,
    },
    Copy {
        uid: bool,
        set: SeqSet,
        dest: String,
    },
    GetQuotaRoot(String),
    GetQuota(String),
    SetAcl {
        mailbox: String,
        identifier: String,
        rights: String,
    },
    DeleteAcl {
        mailbox: String,
        identifier: String,
    },
    GetAcl(String),
    ListRights {
        mailbox: String,
        identifier: String,
    },
    MyRights(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqBound {
    Num(u32),
    /// `*`: the largest number in use.
    Star,
}

/// A sequence set as written, each range with its two ends in the order the
/// client gave them.
pub type SeqSet = Vec<(SeqBound, SeqBound)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Full,
    Header,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchAtt {
    Uid,
    Flags,
    Rfc822Size,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Text,
    Body { section: Section, peek: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreAction {
    Replace,
    Add,
    Remove,
}

/// Parse one command.
///
/// On failure, returns the tag if at least that much could be understood.
pub fn parse_command_line(line: &[u8]) -> Result<CommandLine, Option<String>> {
    let (rest, tag) = match terminated(command_tag, char(' '))(line) {
        Ok(v) => v,
        Err(_) => return Err(None),
    };

    match all_consuming(command)(rest) {
        Ok((_, command)) => Ok(CommandLine { tag, command }),
        Err(_) => Err(Some(tag)),
    }
}

fn fail(i: &[u8]) -> nom::Err<(&[u8], ErrorKind)> {
    nom::Err::Error((i, ErrorKind::Verify))
}

fn is_atom_char(c: u8) -> bool {
    c > b' ' && c < 0x7F && !b"(){%*\"\\]".contains(&c)
}

fn is_astring_char(c: u8) -> bool {
    is_atom_char(c) || b']' == c
}

fn is_list_char(c: u8) -> bool {
    is_astring_char(c) || b'%' == c || b'*' == c
}

fn is_tag_char(c: u8) -> bool {
    is_astring_char(c) && b'+' != c
}

fn ascii(b: &[u8]) -> Result<String, str::Utf8Error> {
    str::from_utf8(b).map(str::to_owned)
}

fn sp(i: &[u8]) -> PResult<'_, char> {
    char(' ')(i)
}

fn command_tag(i: &[u8]) -> PResult<'_, String> {
    map_res(take_while1(is_tag_char), ascii)(i)
}

fn number(i: &[u8]) -> PResult<'_, u32> {
    map_res(digit1, |d: &[u8]| {
        str::from_utf8(d)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u32>().map_err(|_| ()))
    })(i)
}

fn nz_number(i: &[u8]) -> PResult<'_, u32> {
    map_res(number, |n| if 0 == n { Err(()) } else { Ok(n) })(i)
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

pub(super) fn astring(i: &[u8]) -> PResult<'_, String> {
    alt((map_res(take_while1(is_astring_char), ascii), string))(i)
}

fn list_mailbox(i: &[u8]) -> PResult<'_, String> {
    alt((map_res(take_while1(is_list_char), ascii), string))(i)
}

fn atom(i: &[u8]) -> PResult<'_, String> {
    map_res(take_while1(is_atom_char), ascii)(i)
}

fn seq_bound(i: &[u8]) -> PResult<'_, SeqBound> {
    alt((
        value(SeqBound::Star, char('*')),
        map(nz_number, SeqBound::Num),
    ))(i)
}

fn seq_range(i: &[u8]) -> PResult<'_, (SeqBound, SeqBound)> {
    let (i, a) = seq_bound(i)?;
    let (i, b) = opt(preceded(char(':'), seq_bound))(i)?;
    Ok((i, (a, b.unwrap_or(a))))
}

fn seq_set(i: &[u8]) -> PResult<'_, SeqSet> {
    separated_nonempty_list(char(','), seq_range)(i)
}

fn flag(i: &[u8]) -> PResult<'_, String> {
    alt((
        map_res(
            preceded(char('\\'), take_while1(is_atom_char)),
            |a: &[u8]| str::from_utf8(a).map(|a| format!("\\{a}")),
        ),
        atom,
    ))(i)
}

fn flag_list(i: &[u8]) -> PResult<'_, Vec<String>> {
    delimited(char('('), separated_list(sp, flag), char(')'))(i)
}

fn section(i: &[u8]) -> PResult<'_, Section> {
    delimited(
        char('['),
        alt((
            value(Section::Header, tag_no_case("HEADER")),
            value(Section::Text, tag_no_case("TEXT")),
            value(Section::Full, tag("")),
        )),
        char(']'),
    )(i)
}

fn fetch_att(i: &[u8]) -> PResult<'_, FetchAtt> {
    alt((
        value(FetchAtt::Uid, tag_no_case("UID")),
        value(FetchAtt::Flags, tag_no_case("FLAGS")),
        value(FetchAtt::Rfc822Size, tag_no_case("RFC822.SIZE")),
        value(FetchAtt::Rfc822Header, tag_no_case("RFC822.HEADER")),
        value(FetchAtt::Rfc822Text, tag_no_case("RFC822.TEXT")),
        value(FetchAtt::Rfc822, tag_no_case("RFC822")),
        value(FetchAtt::InternalDate, tag_no_case("INTERNALDATE")),
        map(preceded(tag_no_case("BODY.PEEK"), section), |section| {
            FetchAtt::Body {
                section,
                peek: true,
            }
        }),
        map(preceded(tag_no_case("BODY"), section), |section| {
            FetchAtt::Body {
                section,
                peek: false,
            }
        }),
    ))(i)
}

fn fetch_atts(i: &[u8]) -> PResult<'_, Vec<FetchAtt>> {
    // ALL and FULL would add ENVELOPE and BODY, which are not offered; all
    // three macros are served as FAST.
    let fast = vec![
        FetchAtt::Flags,
        FetchAtt::InternalDate,
        FetchAtt::Rfc822Size,
    ];
    alt((
        value(
            fast,
            alt((tag_no_case("FAST"), tag_no_case("ALL"), tag_no_case("FULL"))),
        ),
        delimited(char('('), separated_nonempty_list(sp, fetch_att), char(')')),
        map(fetch_att, |a| vec![a]),
    ))(i)
}

fn store_args(
    i: &[u8],
) -> PResult<'_, (SeqSet, StoreAction, bool, Vec<String>)> {
    let (i, set) = terminated(seq_set, sp)(i)?;
    let (i, action) = alt((
        value(StoreAction::Add, char('+')),
        value(StoreAction::Remove, char('-')),
        value(StoreAction::Replace, tag("")),
    ))(i)?;
    let (i, _) = tag_no_case("FLAGS")(i)?;
    let (i, silent) = map(opt(tag_no_case(".SILENT")), |s| s.is_some())(i)?;
    let (i, _) = sp(i)?;
    let (i, flags) = alt((flag_list, separated_nonempty_list(sp, flag)))(i)?;
    Ok((i, (set, action, silent, flags)))
}

fn keyword(i: &[u8]) -> PResult<'_, Vec<u8>> {
    map(take_while1(|c: u8| c.is_ascii_alphabetic()), |k: &[u8]| {
        k.to_ascii_uppercase()
    })(i)
}

fn command(i: &[u8]) -> PResult<'_, Command> {
    let (i, keyword) = keyword(i)?;
    match &keyword[..] {
        b"CAPABILITY" => Ok((i, Command::Capability)),
        b"NOOP" => Ok((i, Command::Noop)),
        b"LOGOUT" => Ok((i, Command::Logout)),
        b"STARTTLS" => Ok((i, Command::StartTls)),
        b"IDLE" => Ok((i, Command::Idle)),
        b"CLOSE" => Ok((i, Command::Close)),
        b"UNSELECT" => Ok((i, Command::Unselect)),
        b"LOGIN" => map(
            pair(preceded(sp, astring), preceded(sp, astring)),
            |(user, password)| Command::Login { user, password },
        )(i),
        b"AUTHENTICATE" => map(
            pair(
                preceded(sp, atom),
                opt(preceded(
                    sp,
                    map_res(
                        take_while1(|c: u8| {
                            c.is_ascii_alphanumeric() || b"+/=".contains(&c)
                        }),
                        ascii,
                    ),
                )),
            ),
            |(mechanism, initial)| Command::Authenticate { mechanism, initial },
        )(i),
        b"SELECT" => map(preceded(sp, astring), Command::Select)(i),
        b"EXAMINE" => map(preceded(sp, astring), Command::Examine)(i),
        b"CREATE" => map(preceded(sp, astring), Command::Create)(i),
        b"LIST" => map(
            pair(preceded(sp, astring), preceded(sp, list_mailbox)),
            |(reference, pattern)| Command::List { reference, pattern },
        )(i),
        b"FETCH" => map(preceded(sp, fetch_args), |(set, items)| {
            Command::Fetch {
                uid: false,
                set,
                items,
            }
        })(i),
        b"STORE" => map(
            preceded(sp, store_args),
            |(set, action, silent, flags)| Command::Store {
                uid: false,
                set,
                action,
                silent,
                flags,
            },
        )(i),
        b"COPY" => map(preceded(sp, copy_args), |(set, dest)| Command::Copy {
            uid: false,
            set,
            dest,
        })(i),
        b"UID" => preceded(sp, uid_command)(i),
        b"GETQUOTAROOT" => map(preceded(sp, astring), Command::GetQuotaRoot)(i),
        b"GETQUOTA" => map(preceded(sp, astring), Command::GetQuota)(i),
        b"SETACL" => map(
            pair(
                pair(preceded(sp, astring), preceded(sp, astring)),
                preceded(sp, astring),
            ),
            |((mailbox, identifier), rights)| Command::SetAcl {
                mailbox,
                identifier,
                rights,
            },
        )(i),
        b"DELETEACL" => map(
            pair(preceded(sp, astring), preceded(sp, astring)),
            |(mailbox, identifier)| Command::DeleteAcl {
                mailbox,
                identifier,
            },
        )(i),
        b"GETACL" => map(preceded(sp, astring), Command::GetAcl)(i),
        b"LISTRIGHTS" => map(
            pair(preceded(sp, astring), preceded(sp, astring)),
            |(mailbox, identifier)| Command::ListRights {
                mailbox,
                identifier,
            },
        )(i),
        b"MYRIGHTS" => map(preceded(sp, astring), Command::MyRights)(i),
        _ => Err(fail(i)),
    }
}

fn fetch_args(i: &[u8]) -> PResult<'_, (SeqSet, Vec<FetchAtt>)> {
    separated_pair(seq_set, sp, fetch_atts)(i)
}

fn copy_args(i: &[u8]) -> PResult<'_, (SeqSet, String)> {
    separated_pair(seq_set, sp, astring)(i)
}

fn uid_command(i: &[u8]) -> PResult<'_, Command> {
    let (i, keyword) = keyword(i)?;
    match &keyword[..] {
        b"FETCH" => map(preceded(sp, fetch_args), |(set, items)| {
            Command::Fetch {
                uid: true,
                set,
                items,
            }
        })(i),
        b"STORE" => map(
            preceded(sp, store_args),
            |(set, action, silent, flags)| Command::Store {
                uid: true,
                set,
                action,
                silent,
                flags,
            },
        )(i),
        b"COPY" => map(preceded(sp, copy_args), |(set, dest)| Command::Copy {
            uid: true,
            set,
            dest,
        })(i),
        _ => Err(fail(i)),
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn parse(s: &str) -> Command {
        parse_command_line(s.as_bytes()).unwrap().command
    }

    #[test]
    fn simple_commands() {
        assert_eq!(
            CommandLine {
                tag: "a1".to_owned(),
                command: Command::Capability,
            },
            parse_command_line(b"a1 capability").unwrap()
        );
        assert_eq!(Command::Idle, parse("x IDLE"));
        assert_eq!(
            Command::Login {
                user: "dib@local.test".to_owned(),
                password: "pass word".to_owned(),
            },
            parse("x LOGIN dib@local.test \"pass word\"")
        );
        assert_eq!(
            Command::Login {
                user: "dib".to_owned(),
                password: "a\"b\\c".to_owned(),
            },
            parse("x LOGIN dib \"a\\\"b\\\\c\"")
        );
        assert_eq!(
            Command::Authenticate {
                mechanism: "PLAIN".to_owned(),
                initial: Some("AGRpYgBwYXNz".to_owned()),
            },
            parse("x AUTHENTICATE PLAIN AGRpYgBwYXNz")
        );
        assert_eq!(
            Command::List {
                reference: String::new(),
                pattern: "*".to_owned(),
            },
            parse("x LIST \"\" *")
        );
    }

    #[test]
    fn literals() {
        assert_eq!(
            Command::Select("Other\r\nStuff".to_owned()),
            parse("x SELECT {12}\r\nOther\r\nStuff")
        );
        assert_eq!(
            Command::Login {
                user: "dib".to_owned(),
                password: "hunter2".to_owned(),
            },
            parse("x LOGIN {3+}\r\ndib {7}\r\nhunter2")
        );
        // Literal shorter than declared
        assert_eq!(
            Err(Some("x".to_owned())),
            parse_command_line(b"x SELECT {12}\r\nINBOX")
        );
    }

    #[test]
    fn uid_commands() {
        assert_eq!(
            Command::Fetch {
                uid: true,
                set: vec![
                    (SeqBound::Num(1), SeqBound::Num(3)),
                    (SeqBound::Num(7), SeqBound::Num(7)),
                    (SeqBound::Num(9), SeqBound::Star),
                ],
                items: vec![
                    FetchAtt::Uid,
                    FetchAtt::Flags,
                    FetchAtt::Body {
                        section: Section::Full,
                        peek: true,
                    },
                    FetchAtt::Body {
                        section: Section::Header,
                        peek: false,
                    },
                    FetchAtt::Rfc822Size,
                ],
            },
            parse(
                "x UID FETCH 1:3,7,9:* \
                 (UID FLAGS BODY.PEEK[] body[header] RFC822.SIZE)"
            )
        );
        assert_eq!(
            Command::Fetch {
                uid: false,
                set: vec![(SeqBound::Star, SeqBound::Star)],
                items: vec![
                    FetchAtt::Flags,
                    FetchAtt::InternalDate,
                    FetchAtt::Rfc822Size
                ],
            },
            parse("x FETCH * FAST")
        );
        assert_eq!(
            Command::Store {
                uid: true,
                set: vec![(SeqBound::Num(4), SeqBound::Num(4))],
                action: StoreAction::Add,
                silent: true,
                flags: vec!["\\Seen".to_owned(), "$Important".to_owned()],
            },
            parse("x UID STORE 4 +FLAGS.SILENT (\\Seen $Important)")
        );
        assert_eq!(
            Command::Store {
                uid: false,
                set: vec![(SeqBound::Num(1), SeqBound::Num(2))],
                action: StoreAction::Replace,
                silent: false,
                flags: vec!["\\Flagged".to_owned()],
            },
            parse("x STORE 1:2 FLAGS \\Flagged")
        );
        assert_eq!(
            Command::Copy {
                uid: true,
                set: vec![(SeqBound::Num(2), SeqBound::Num(5))],
                dest: "Junk".to_owned(),
            },
            parse("x UID COPY 2:5 Junk")
        );
    }

    #[test]
    fn acl_commands() {
        assert_eq!(
            Command::SetAcl {
                mailbox: "INBOX".to_owned(),
                identifier: "zim@local.test".to_owned(),
                rights: "+lr".to_owned(),
            },
            parse("x SETACL INBOX zim@local.test +lr")
        );
        assert_eq!(
            Command::ListRights {
                mailbox: "INBOX".to_owned(),
                identifier: "anyone".to_owned(),
            },
            parse("x LISTRIGHTS INBOX anyone")
        );
    }

    #[test]
    fn bad_syntax() {
        assert_eq!(Err(None), parse_command_line(b""));
        assert_eq!(Err(None), parse_command_line(b"+ hello"));
        assert_eq!(
            Err(Some("a".to_owned())),
            parse_command_line(b"a FROBNICATE")
        );
        assert_eq!(Err(Some("a".to_owned())), parse_command_line(b"a NOOP x"));
        assert_eq!(
            Err(Some("a".to_owned())),
            parse_command_line(b"a UID FETCH 0 FLAGS")
        );
        assert_eq!(
            Err(Some("a".to_owned())),
            parse_command_line(b"a SELECT \"unterminated")
        );
    }

    proptest! {
        #[test]
        fn written_strings_parse_back(s in "[^\\x00]{0,120}") {
            let mut encoded = Vec::new();
            super::super::lex::write_string(&mut encoded, &s);
            let (rest, parsed) = astring(&encoded).unwrap();
            prop_assert!(rest.is_empty());
            prop_assert_eq!(s, parsed);
        }
    }
}
