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

//! The syntax for SPF TXT records.
//! RFC 7208 § 12

use std::net::{Ipv4Addr, Ipv6Addr};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term<'a> {
    Directive(Directive<'a>),
    Modifier(Modifier<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive<'a> {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mechanism<'a> {
    All,
    Include(DomainSpec<'a>),
    A(Option<DomainSpec<'a>>, Option<u32>, Option<u32>),
    Mx(Option<DomainSpec<'a>>, Option<u32>, Option<u32>),
    Ptr(Option<DomainSpec<'a>>),
    Ip4(Ipv4Addr, Option<u32>),
    Ip6(Ipv6Addr, Option<u32>),
    Exists(DomainSpec<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modifier<'a> {
    Redirect(DomainSpec<'a>),
    Explanation(DomainSpec<'a>),
    Unknown,
}

/// A `domain-spec` as written in the record.
///
/// Macro expansion is not supported; a spec containing a macro has no
/// literal domain, and the term using it never matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainSpec<'a>(&'a str);

impl<'a> DomainSpec<'a> {
    pub fn new(s: &'a str) -> Self {
        Self(s)
    }

    /// The domain this names, if it is free of macros.
    pub fn literal(self) -> Option<&'a str> {
        if self.0.contains('%') {
            None
        } else {
            Some(self.0.trim_end_matches('.'))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid IP address")]
    InvalidIpAddress,
    #[error("unknown character: {0}")]
    UnknownCharacter(char),
    #[error("unknown mechanism")]
    UnknownMechanism,
    #[error("unused argument for {0}")]
    UnusedArgument(&'static str),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("empty directive")]
    EmptyDirective,
    #[error("more than one {0}= modifier")]
    DuplicateModifier(&'static str),
}

/// Whether `txt` is an SPF version 1 record.
pub fn is_spf1(txt: &str) -> bool {
    let mut words = txt.split(' ');
    words
        .next()
        .is_some_and(|v| v.eq_ignore_ascii_case("v=spf1"))
}

/// Parse every term of an SPF record.
///
/// The version term is parsed as an unknown modifier and dropped.
pub fn parse_record(txt: &str) -> Result<Vec<Term<'_>>, Error> {
    let terms = txt
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(Term::parse)
        .filter(|t| !matches!(*t, Ok(Term::Modifier(Modifier::Unknown))))
        .collect::<Result<Vec<_>, _>>()?;

    // RFC 7208 § 6: redirect and exp may each appear at most once.
    let count = |pred: fn(&Term<'_>) -> bool| {
        terms.iter().filter(|t| pred(t)).count()
    };
    if count(|t| matches!(*t, Term::Modifier(Modifier::Redirect(..)))) > 1 {
        return Err(Error::DuplicateModifier("redirect"));
    }
    if count(|t| matches!(*t, Term::Modifier(Modifier::Explanation(..)))) > 1 {
        return Err(Error::DuplicateModifier("exp"));
    }

    Ok(terms)
}

impl<'a> Term<'a> {
    /// Parses a single term.
    ///
    /// `word` is a non-empty item from the SPF record after splitting on
    /// space.
    pub fn parse(word: &'a str) -> Result<Self, Error> {
        lazy_static! {
            static ref MODIFIER: Regex =
                Regex::new("^([a-zA-Z][a-zA-Z0-9._-]*)=(.*)$").unwrap();
        }

        if let Some(captures) = MODIFIER.captures(word) {
            let (Some(name), Some(value)) = (captures.get(1), captures.get(2))
            else {
                return Err(Error::EmptyDirective);
            };
            Ok(Self::Modifier(Modifier::parse(name.as_str(), value.as_str())))
        } else {
            Directive::parse(word).map(Self::Directive)
        }
    }
}

impl<'a> Modifier<'a> {
    fn parse(name: &str, value: &'a str) -> Self {
        if name.eq_ignore_ascii_case("redirect") {
            Self::Redirect(DomainSpec(value))
        } else if name.eq_ignore_ascii_case("exp") {
            Self::Explanation(DomainSpec(value))
        } else {
            Self::Unknown
        }
    }
}

impl<'a> Directive<'a> {
    fn parse(word: &'a str) -> Result<Self, Error> {
        let mut chars = word.chars();
        let (qualifier, rest) = match chars.next() {
            None => return Err(Error::EmptyDirective),
            Some('+') => (Qualifier::Pass, chars.as_str()),
            Some('-') => (Qualifier::Fail, chars.as_str()),
            Some('?') => (Qualifier::Neutral, chars.as_str()),
            Some('~') => (Qualifier::SoftFail, chars.as_str()),
            Some(c) if !c.is_ascii_alphabetic() => {
                return Err(Error::UnknownCharacter(c));
            },
            Some(_) => (Qualifier::Pass, word),
        };

        let mechanism = Mechanism::parse(rest)?;
        Ok(Self {
            qualifier,
            mechanism,
        })
    }
}

impl<'a> Mechanism<'a> {
    fn parse(word: &'a str) -> Result<Self, Error> {
        fn parse_cidr_length(s: &str, max: u32) -> Result<u32, Error> {
            let l = s.parse::<u32>().map_err(|_| Error::InvalidInteger)?;
            if l > max {
                return Err(Error::InvalidInteger);
            }

            Ok(l)
        }

        fn parse_arg_dual_cidr_length(
            arg: &str,
        ) -> Result<(&str, Option<u32>, Option<u32>), Error> {
            lazy_static! {
                static ref R: Regex =
                    Regex::new("(?:/([0-9]+))?(?://([0-9]+))?$").unwrap();
            }

            let Some(captures) = R.captures(arg) else {
                return Ok((arg, None, None));
            };
            let v4 = captures
                .get(1)
                .map(|c| parse_cidr_length(c.as_str(), 32))
                .transpose()?;
            let v6 = captures
                .get(2)
                .map(|c| parse_cidr_length(c.as_str(), 128))
                .transpose()?;
            let start = captures.get(0).map_or(arg.len(), |m| m.start());
            Ok((&arg[..start], v4, v6))
        }

        fn domain_and_cidr(
            arg: Option<&str>,
        ) -> Result<(Option<DomainSpec<'_>>, Option<u32>, Option<u32>), Error>
        {
            let Some(arg) = arg else {
                return Ok((None, None, None));
            };
            let (domain, v4, v6) = parse_arg_dual_cidr_length(arg)?;
            Ok((Some(DomainSpec(domain)), v4, v6))
        }

        fn ip_and_cidr(arg: &str) -> (&str, Option<&str>) {
            arg.split_once('/')
                .map(|(addr, cidr_len)| (addr, Some(cidr_len)))
                .unwrap_or((arg, None))
        }

        let (name, arg) = word
            .split_once(':')
            .map(|(n, a)| (n, Some(a)))
            .unwrap_or((word, None));

        if "all".eq_ignore_ascii_case(name) {
            if arg.is_some() {
                return Err(Error::UnusedArgument("all"));
            }

            Ok(Self::All)
        } else if "include".eq_ignore_ascii_case(name) {
            let arg = arg.ok_or(Error::MissingArgument("include"))?;
            Ok(Self::Include(DomainSpec(arg)))
        } else if "a".eq_ignore_ascii_case(name) {
            let (domain, v4, v6) = domain_and_cidr(arg)?;
            Ok(Self::A(domain, v4, v6))
        } else if "mx".eq_ignore_ascii_case(name) {
            let (domain, v4, v6) = domain_and_cidr(arg)?;
            Ok(Self::Mx(domain, v4, v6))
        } else if "ptr".eq_ignore_ascii_case(name) {
            Ok(Self::Ptr(arg.map(DomainSpec)))
        } else if "ip4".eq_ignore_ascii_case(name) {
            let arg = arg.ok_or(Error::MissingArgument("ip4"))?;
            let (addr, cidr_len) = ip_and_cidr(arg);
            let addr = addr
                .parse::<Ipv4Addr>()
                .map_err(|_| Error::InvalidIpAddress)?;
            let cidr_len =
                cidr_len.map(|c| parse_cidr_length(c, 32)).transpose()?;

            Ok(Self::Ip4(addr, cidr_len))
        } else if "ip6".eq_ignore_ascii_case(name) {
            let arg = arg.ok_or(Error::MissingArgument("ip6"))?;
            let (addr, cidr_len) = ip_and_cidr(arg);
            let addr = addr
                .parse::<Ipv6Addr>()
                .map_err(|_| Error::InvalidIpAddress)?;
            let cidr_len =
                cidr_len.map(|c| parse_cidr_length(c, 128)).transpose()?;

            Ok(Self::Ip6(addr, cidr_len))
        } else if "exists".eq_ignore_ascii_case(name) {
            let arg = arg.ok_or(Error::MissingArgument("exists"))?;
            Ok(Self::Exists(DomainSpec(arg)))
        } else {
            // The a and mx mechanisms can take a CIDR without any argument.
            if let Ok((prefix, v4, v6)) = parse_arg_dual_cidr_length(word) {
                if v4.is_some() || v6.is_some() {
                    if "a".eq_ignore_ascii_case(prefix) {
                        return Ok(Self::A(None, v4, v6));
                    } else if "mx".eq_ignore_ascii_case(prefix) {
                        return Ok(Self::Mx(None, v4, v6));
                    }
                }
            }

            Err(Error::UnknownMechanism)
        }
    }
}
