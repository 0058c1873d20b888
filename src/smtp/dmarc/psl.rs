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

//! Organisational domain discovery (RFC 7489 § 3.2).
//!
//! Rather than shipping the whole public suffix list, this knows the
//! multi-label suffixes under which mail domains are commonly registered.
//! Any other final label is treated as a single-label public suffix. DMARC
//! only needs to strip subdomains sensibly, so a miss here makes alignment
//! stricter, never looser.

/// Public suffixes of more than one label, in lower case.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "ac.jp", "ac.nz", "ac.uk", "ac.za", "co.at", "co.id", "co.il", "co.in",
    "co.jp", "co.kr", "co.nz", "co.th", "co.uk", "co.za", "com.ar",
    "com.au", "com.br", "com.cn", "com.co", "com.hk", "com.mx", "com.my",
    "com.ph", "com.pl", "com.sg", "com.tr", "com.tw", "com.ua", "edu.au",
    "gen.nz", "go.jp", "gov.au", "gov.uk", "ltd.uk", "me.uk", "ne.jp",
    "net.au", "net.br", "net.cn", "net.nz", "or.jp", "org.au", "org.br",
    "org.cn", "org.nz", "org.uk", "org.za", "plc.uk", "sch.uk",
];

/// Return the organisational domain of `domain`: the public suffix plus one
/// label. The result is lower case without a trailing dot.
///
/// A domain which is itself a public suffix is returned as-is.
pub fn organisational_domain(domain: &str) -> String {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let labels = domain.split('.').collect::<Vec<_>>();
    if labels.len() <= 1 {
        return domain;
    }

    let tail = labels[labels.len() - 2..].join(".");
    let suffix_labels = if MULTI_LABEL_SUFFIXES.binary_search(&&*tail).is_ok()
    {
        2
    } else {
        1
    };

    let keep = (suffix_labels + 1).min(labels.len());
    labels[labels.len() - keep..].join(".")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffix_list_is_sorted() {
        let mut sorted = MULTI_LABEL_SUFFIXES.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, MULTI_LABEL_SUFFIXES);
    }

    #[test]
    fn organisational_domains() {
        assert_eq!("example.com", organisational_domain("example.com"));
        assert_eq!("example.com", organisational_domain("mail.Example.COM."));
        assert_eq!("example.com", organisational_domain("a.b.c.example.com"));
        assert_eq!("example.co.uk", organisational_domain("www.example.co.uk"));
        assert_eq!("example.co.uk", organisational_domain("example.co.uk"));
        assert_eq!("co.uk", organisational_domain("co.uk"));
        assert_eq!("localhost", organisational_domain("localhost"));
    }
}
