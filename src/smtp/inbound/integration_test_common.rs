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

//! A blocking SMTP client for driving the inbound server from tests.

use std::io::{self, BufRead, Read, Write};
use std::mem;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

pub use crate::support::async_io::test_support::{
    self_signed_acceptor as ssl_acceptor,
};

pub trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

pub struct SmtpClient {
    name: &'static str,
    io: io::BufReader<Box<dyn ReadWrite>>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: io::BufReader::new(Box::new(io)),
        }
    }

    /// Reads one reply, returning every line of it including the CRLF.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut lines = Vec::<String>::new();
        loop {
            let mut line = String::new();
            self.io.read_line(&mut line).unwrap();
            println!("[{}] >> {line:?}", self.name);
            assert!(!line.is_empty(), "server hung up mid-reply");

            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);
            if !more {
                return lines;
            }
        }
    }

    /// Sends `s`, which must already carry its line ending.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'));
        println!("[{}] << {s:?}", self.name);
        self.send(s.as_bytes());
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] << ({} bytes)", self.name, data.len());
        self.send(data);
    }

    fn send(&mut self, data: &[u8]) {
        let io = self.io.get_mut();
        io.write_all(data).unwrap();
        io.flush().unwrap();
    }

    /// Consumes the greeting, then sends `hello` (EHLO or HELO) and checks
    /// that it was accepted.
    pub fn skip_pleasantries(&mut self, hello: &str) {
        self.read_responses();
        self.hello(hello);
    }

    fn hello(&mut self, hello: &str) {
        self.write_line(&format!("{hello}\r\n"));
        let reply = self.read_responses();
        assert!(reply.last().is_some_and(|l| l.starts_with("250")));
    }

    /// Sends `command` and expects a single-line reply beginning with
    /// `prefix`.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{command}\r\n"));
        let reply = self.read_responses();
        assert_eq!(1, reply.len(), "{reply:?}");
        assert!(reply[0].starts_with(prefix), "{reply:?}");
    }

    /// Upgrades the connection without verifying the server certificate.
    pub fn start_tls(&mut self) {
        assert!(self.io.buffer().is_empty());
        let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);

        println!("[{}] <> TLS handshake", self.name);
        let plain = mem::replace(
            &mut self.io,
            io::BufReader::new(Box::new(io::empty())),
        )
        .into_inner();
        let secure = builder
            .build()
            .connect("localhost", plain)
            .unwrap_or_else(|_| panic!("[{}] TLS handshake failed", self.name));
        self.io = io::BufReader::new(Box::new(secure));
    }

    /// Like `skip_pleasantries`, followed by STARTTLS and a fresh `hello`.
    pub fn skip_pleasantries_with_tls(&mut self, hello: &str) {
        self.skip_pleasantries(hello);
        self.simple_command("STARTTLS", "220 2.0.0");
        self.start_tls();
        self.hello(hello);
    }

    /// Runs MAIL, RCPT for each of `to`, and DATA with `body`, expecting all
    /// but the final reply to succeed. Returns the final reply.
    pub fn send_mail(&mut self, from: &str, to: &[&str], body: &str) -> String {
        self.simple_command(&format!("MAIL FROM:<{from}>"), "250 ");
        for recipient in to {
            self.simple_command(&format!("RCPT TO:<{recipient}>"), "250 ");
        }
        self.simple_command("DATA", "354 ");
        self.write_raw(body.as_bytes());
        self.write_raw(b".\r\n");

        let mut reply = self.read_responses();
        assert_eq!(1, reply.len(), "{reply:?}");
        reply.remove(0)
    }
}
