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

//! HTTP/1.1 framing: requests with `Content-Length` bodies in, responses with
//! JSON bodies out. Chunked requests are refused.

use std::io;
use std::str;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const MAX_BODY: usize = 1024 * 1024;
const MAX_HEAD_LINE: u64 = 8192;
const MAX_HEADERS: usize = 100;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Decoded query parameters in the order given.
    pub query: Vec<(String, String)>,
    /// Header names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Whether the client asked for the connection to stay open.
    pub keep_alive: bool,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The token from an `Authorization: Bearer` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
    }
}

/// Why a request could not be read. Each maps to a status the server sends
/// before closing the connection.
#[derive(Debug)]
pub enum ReadError {
    /// Clean EOF before any byte of a request.
    Closed,
    BadRequest(&'static str),
    TooLarge,
    Io(io::Error),
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

async fn read_head_line(
    reader: &mut (impl AsyncBufRead + Unpin),
    line: &mut Vec<u8>,
) -> Result<usize, ReadError> {
    line.clear();
    let nread = (&mut *reader)
        .take(MAX_HEAD_LINE)
        .read_until(b'\n', line)
        .await?;
    if nread > 0 && !line.ends_with(b"\n") {
        return Err(if nread as u64 >= MAX_HEAD_LINE {
            ReadError::TooLarge
        } else {
            ReadError::BadRequest("Truncated request")
        });
    }
    while line.ends_with(b"\n") || line.ends_with(b"\r") {
        line.pop();
    }
    Ok(nread)
}

/// Read one request from `reader`.
pub async fn read_request(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> Result<Request, ReadError> {
    let mut line = Vec::new();
    // RFC 7230 3.5: ignore empty lines before the request line
    loop {
        if 0 == read_head_line(reader, &mut line).await? {
            return Err(ReadError::Closed);
        }
        if !line.is_empty() {
            break;
        }
    }

    let request_line = str::from_utf8(&line)
        .map_err(|_| ReadError::BadRequest("Request line is not UTF-8"))?;
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ReadError::BadRequest("Malformed request line"));
    };
    let keep_alive_default = match version {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        _ => return Err(ReadError::BadRequest("Unsupported HTTP version")),
    };

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let mut request = Request {
        method: method.to_owned(),
        path: path.to_owned(),
        query: url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        keep_alive: keep_alive_default,
        ..Request::default()
    };

    loop {
        if 0 == read_head_line(reader, &mut line).await? {
            return Err(ReadError::BadRequest("EOF in headers"));
        }
        if line.is_empty() {
            break;
        }
        if request.headers.len() >= MAX_HEADERS {
            return Err(ReadError::TooLarge);
        }

        let header = str::from_utf8(&line)
            .map_err(|_| ReadError::BadRequest("Header is not UTF-8"))?;
        let (name, value) = header
            .split_once(':')
            .ok_or(ReadError::BadRequest("Malformed header"))?;
        request
            .headers
            .push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }

    if let Some(connection) = request.header("connection") {
        if connection.eq_ignore_ascii_case("close") {
            request.keep_alive = false;
        } else if connection.eq_ignore_ascii_case("keep-alive") {
            request.keep_alive = true;
        }
    }

    if request.header("transfer-encoding").is_some() {
        return Err(ReadError::BadRequest("Transfer-Encoding not supported"));
    }

    let length = match request.header("content-length") {
        None => 0,
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ReadError::BadRequest("Bad Content-Length"))?,
    };
    if length > MAX_BODY {
        return Err(ReadError::TooLarge);
    }

    request.body.resize(length, 0);
    reader.read_exact(&mut request.body).await?;
    Ok(request)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

const JSON: &str = "application/json";

impl Response {
    pub fn json(status: u16, value: &impl Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: JSON,
                body,
            },
            Err(_) => Self::error(500, "Serialisation failed"),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: JSON,
            body: serde_json::json!({ "error": message })
                .to_string()
                .into_bytes(),
        }
    }

    pub fn text(status: u16, content_type: &'static str, body: String) -> Self {
        Self {
            status,
            content_type,
            body: body.into_bytes(),
        }
    }

    /// Render the status line, headers and body.
    pub fn render(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: {}\r\n\
             \r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" },
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::main(flavor = "current_thread")]
    async fn read(data: &'static [u8]) -> Result<Request, ReadError> {
        let mut reader = tokio::io::BufReader::new(data);
        read_request(&mut reader).await
    }

    #[test]
    fn parse_requests() {
        let request = read(
            b"\r\nGET /api/v1/messages?mailbox=Junk&limit=5&q=hello%20world \
              HTTP/1.1\r\n\
              Host: mail.local.test\r\n\
              Authorization: Bearer abc.def.ghi\r\n\r\n",
        )
        .unwrap();
        assert_eq!("GET", request.method);
        assert_eq!("/api/v1/messages", request.path);
        assert_eq!(Some("Junk"), request.query_param("mailbox"));
        assert_eq!(Some("5"), request.query_param("limit"));
        assert_eq!(Some("hello world"), request.query_param("q"));
        assert_eq!(Some("abc.def.ghi"), request.bearer_token());
        assert!(request.keep_alive);
        assert!(request.body.is_empty());

        let request = read(
            b"POST /send HTTP/1.0\r\nContent-Length: 4\r\n\r\nbody",
        )
        .unwrap();
        assert_eq!(b"body", &request.body[..]);
        assert!(!request.keep_alive);
    }

    #[test]
    fn reject_bad_requests() {
        assert_matches!(Err(ReadError::Closed), read(b""));
        assert_matches!(Err(ReadError::BadRequest(_)), read(b"GET /\r\n\r\n"));
        assert_matches!(
            Err(ReadError::BadRequest(_)),
            read(b"GET / HTTP/2\r\n\r\n")
        );
        assert_matches!(
            Err(ReadError::BadRequest(_)),
            read(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
        );
        assert_matches!(
            Err(ReadError::TooLarge),
            read(b"POST / HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n")
        );
        assert_matches!(
            Err(ReadError::Io(_)),
            read(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort")
        );
    }

    #[test]
    fn render_response() {
        let rendered = Response::error(404, "No such message").render(false);
        assert_eq!(
            "HTTP/1.1 404 Not Found\r\n\
             Content-Type: application/json\r\n\
             Content-Length: 27\r\n\
             Connection: close\r\n\
             \r\n\
             {\"error\":\"No such message\"}",
            String::from_utf8(rendered).unwrap(),
        );
    }
}
