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

//! The JSON API: routing and handlers.
//!
//! Handlers are synchronous and never touch the network; `server` does the
//! framing.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::jwt::{self, Claims};
use super::wire::{Request, Response};
use crate::{
    antiabuse::bayes,
    smtp::outbound::Submitter,
    store::{new_id, Message, MessageFilter, Role, Store},
    support::{
        error::Error,
        log_prefix::LogPrefix,
        metrics::{self, Counter, METRICS},
        system_config::SystemConfig,
    },
};

const JUNK: &str = "Junk";
const MAX_TOKEN_LIFETIME: u64 = 10 * 365 * 86400;

/// Everything HTTP sessions share.
pub struct ApiContext {
    pub config: Arc<SystemConfig>,
    pub store: Arc<Store>,
    pub submitter: Submitter,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    email: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct MessageList {
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct MessageDetail {
    #[serde(flatten)]
    message: Message,
    body: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MessageUpdate {
    read_state: Option<bool>,
    mailbox: Option<String>,
}

#[derive(Deserialize)]
struct SendRequest {
    to: String,
    subject: String,
    #[serde(default)]
    body: String,
}

#[derive(Serialize)]
struct SendResponse {
    id: String,
    status: &'static str,
    message_id: String,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BackupRequest {
    location: Option<PathBuf>,
}

#[derive(Serialize)]
struct BackupResponse {
    status: &'static str,
    path: PathBuf,
}

/// Dispatch `request` to its handler.
pub fn route(
    context: &ApiContext,
    log_prefix: &LogPrefix,
    request: &Request,
    now: DateTime<Utc>,
) -> Response {
    metrics::incr(Counter::ApiRequests);
    let response = dispatch(context, log_prefix, request, now);
    if response.status >= 500 {
        metrics::incr(Counter::ApiErrors);
    }
    response
}

fn dispatch(
    context: &ApiContext,
    log_prefix: &LogPrefix,
    request: &Request,
    now: DateTime<Utc>,
) -> Response {
    let segments = request
        .path
        .trim_end_matches('/')
        .split('/')
        .skip(1)
        .collect::<Vec<_>>();

    let result = match (request.method.as_str(), &segments[..]) {
        ("GET", ["health"]) => {
            Ok(Response::json(200, &serde_json::json!({ "status": "ok" })))
        },
        ("POST", ["api", "v1", "auth", "login"]) => {
            login(context, log_prefix, request, now)
        },
        (method, ["metrics"]) | (method, ["api", "v1", "admin", ..]) => {
            if let Err(e) = authorise_admin(context, request, now) {
                return error_response(log_prefix, e);
            }
            match (method, &segments[..]) {
                ("GET", ["metrics"]) => Ok(Response::text(
                    200,
                    "text/plain; version=0.0.4",
                    METRICS.prometheus(),
                )),
                ("GET", [_, _, _, "metrics"]) => {
                    Ok(Response::json(200, &METRICS.snapshot()))
                },
                ("POST", [_, _, _, "backup"]) => {
                    backup(context, log_prefix, request, now)
                },
                _ => Ok(Response::error(404, "No such endpoint")),
            }
        },
        (method, ["api", "v1", "messages", ..])
        | (method @ "POST", ["send"]) => {
            let claims = match authorise(context, request, now) {
                Ok(c) => c,
                Err(e) => return error_response(log_prefix, e),
            };
            match (method, &segments[..]) {
                ("GET", [_, _, _]) => list_messages(context, &claims, request),
                ("GET", [_, _, _, "search"]) => {
                    search_messages(context, &claims, request)
                },
                ("GET", [_, _, _, id]) => get_message(context, &claims, id),
                ("PATCH", [_, _, _, id]) => {
                    update_message(context, log_prefix, &claims, id, request)
                },
                ("POST", [_, _, _, "send"]) | ("POST", ["send"]) => {
                    send_message(context, log_prefix, &claims, request, now)
                },
                _ => Ok(Response::error(404, "No such endpoint")),
            }
        },
        _ => Ok(Response::error(404, "No such endpoint")),
    };

    result.unwrap_or_else(|e| error_response(log_prefix, e))
}

fn error_response(log_prefix: &LogPrefix, e: Error) -> Response {
    match e {
        Error::NotFound => Response::error(404, "Not found"),
        Error::InvalidCredentials => Response::error(401, "Unauthorised"),
        Error::PermissionDenied => Response::error(403, "Forbidden"),
        Error::AlreadyExists => Response::error(409, "Already exists"),
        Error::OverQuota => Response::error(409, "Quota exceeded"),
        Error::ValidationFailed(ref msg) => Response::error(400, msg),
        e => {
            warn!("{log_prefix} Request failed: {e}");
            Response::error(500, "Internal error")
        },
    }
}

fn parse_json<'a, T: Deserialize<'a>>(
    request: &'a Request,
) -> Result<T, Error> {
    serde_json::from_slice(&request.body)
        .map_err(|e| {
            Error::ValidationFailed(format!("Invalid request body: {e}"))
        })
}

fn authorise(
    context: &ApiContext,
    request: &Request,
    now: DateTime<Utc>,
) -> Result<Claims, Error> {
    let token = request.bearer_token().ok_or(Error::InvalidCredentials)?;
    let claims =
        jwt::verify(context.config.http.jwt_secret.as_bytes(), token, now)?;
    // Tokens of deleted users die with them.
    match context.store.user_exists(&claims.email) {
        Ok(true) => Ok(claims),
        Ok(false) => Err(Error::InvalidCredentials),
        Err(e) => Err(e),
    }
}

fn authorise_admin(
    context: &ApiContext,
    request: &Request,
    now: DateTime<Utc>,
) -> Result<Claims, Error> {
    let claims = authorise(context, request, now)?;
    if Role::Admin.as_str() == claims.role {
        Ok(claims)
    } else {
        Err(Error::PermissionDenied)
    }
}

fn login(
    context: &ApiContext,
    log_prefix: &LogPrefix,
    request: &Request,
    now: DateTime<Utc>,
) -> Result<Response, Error> {
    let body = parse_json::<LoginRequest>(request)?;
    let user = match context.store.authenticate(&body.email, &body.password) {
        Ok(user) => user,
        Err(Error::InvalidCredentials) => {
            warn!("{log_prefix} Failed login for {:?}", body.email);
            return Err(Error::InvalidCredentials);
        },
        Err(e) => return Err(e),
    };

    let lifetime = context
        .config
        .http
        .token_lifetime_secs
        .min(MAX_TOKEN_LIFETIME);
    let expires_at = now + chrono::Duration::seconds(lifetime as i64);
    let token = jwt::issue(
        context.config.http.jwt_secret.as_bytes(),
        &Claims {
            email: user.email.clone(),
            role: user.role.to_string(),
            exp: expires_at.timestamp(),
        },
    )?;

    info!("{log_prefix} Issued token to {}", user.email);
    Ok(Response::json(
        200,
        &LoginResponse {
            token,
            email: user.email,
            expires_at,
        },
    ))
}

fn backup(
    context: &ApiContext,
    log_prefix: &LogPrefix,
    request: &Request,
    now: DateTime<Utc>,
) -> Result<Response, Error> {
    let body = if request.body.is_empty() {
        BackupRequest::default()
    } else {
        parse_json::<BackupRequest>(request)?
    };

    let location = match body.location {
        None => context.config.backup.location.clone(),
        Some(location) if location.is_absolute() => location,
        Some(_) => {
            return Err(Error::ValidationFailed(
                "location must be an absolute path".to_owned(),
            ))
        },
    };

    let path = context.store.backup(&location, now)?;
    info!("{log_prefix} Backup written to {}", path.display());
    Ok(Response::json(
        200,
        &BackupResponse {
            status: "completed",
            path,
        },
    ))
}

fn numeric_param(request: &Request, name: &str) -> Result<u32, Error> {
    request.query_param(name).map_or(Ok(0), |v| {
        v.parse()
            .map_err(|_| Error::ValidationFailed(format!("Bad {name}")))
    })
}

fn list_messages(
    context: &ApiContext,
    claims: &Claims,
    request: &Request,
) -> Result<Response, Error> {
    let is_read = match request.query_param("is_read") {
        None => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(_) => {
            return Err(Error::ValidationFailed("Bad is_read".to_owned()))
        },
    };
    let filter = MessageFilter {
        mailbox: request
            .query_param("mailbox")
            .filter(|m| !m.is_empty())
            .map(str::to_owned),
        is_read,
        limit: numeric_param(request, "limit")?,
        offset: numeric_param(request, "offset")?,
    };

    let messages = context.store.list_messages(&claims.email, &filter)?;
    Ok(Response::json(200, &MessageList { messages }))
}

fn search_messages(
    context: &ApiContext,
    claims: &Claims,
    request: &Request,
) -> Result<Response, Error> {
    let query = request
        .query_param("q")
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| Error::ValidationFailed("Missing q".to_owned()))?;
    let messages = context.store.search(
        &claims.email,
        query,
        numeric_param(request, "limit")?,
    )?;
    Ok(Response::json(200, &MessageList { messages }))
}

fn get_message(
    context: &ApiContext,
    claims: &Claims,
    id: &str,
) -> Result<Response, Error> {
    let message = context.store.find_message(&claims.email, id)?;
    let body = context.store.blobs().read_blob(&message.body_path)?;
    Ok(Response::json(
        200,
        &MessageDetail {
            message,
            body: String::from_utf8_lossy(&body).into_owned(),
        },
    ))
}

fn update_message(
    context: &ApiContext,
    log_prefix: &LogPrefix,
    claims: &Claims,
    id: &str,
    request: &Request,
) -> Result<Response, Error> {
    let update = parse_json::<MessageUpdate>(request)?;
    let store = &context.store;
    let mut message = store.find_message(&claims.email, id)?;

    if let Some(read) = update.read_state {
        message = store.update_read_state(&claims.email, id, read)?;
    }

    if let Some(dest) = update.mailbox {
        let source = message.mailbox.clone();
        message = store.move_message(&claims.email, id, &dest)?;

        let training = if JUNK == message.mailbox && JUNK != source {
            Some(true)
        } else if JUNK == source && JUNK != message.mailbox {
            Some(false)
        } else {
            None
        };
        if let Some(is_spam) = training {
            if let Err(e) = store
                .message_plaintext(&claims.email, id)
                .and_then(|text| bayes::train(store, &text, is_spam))
            {
                warn!("{log_prefix} Failed to train on {id}: {e}");
            } else {
                info!(
                    "{log_prefix} Trained {id} as {}",
                    if is_spam { "spam" } else { "ham" },
                );
            }
        }
    }

    Ok(Response::json(200, &message))
}

/// Whether `s` can go into a header field without breaking the message.
fn is_header_safe(s: &str) -> bool {
    !s.chars().any(|c| '\r' == c || '\n' == c || '\0' == c)
}

fn send_message(
    context: &ApiContext,
    log_prefix: &LogPrefix,
    claims: &Claims,
    request: &Request,
    now: DateTime<Utc>,
) -> Result<Response, Error> {
    let body = parse_json::<SendRequest>(request)?;
    let to = body.to.trim();
    if to.is_empty() || body.subject.is_empty() {
        return Err(Error::ValidationFailed(
            "to and subject are required".to_owned(),
        ));
    }
    if !is_header_safe(to)
        || !is_header_safe(&body.subject)
        || to.contains(char::is_whitespace)
        || to
            .rsplit_once('@')
            .map_or(true, |(l, d)| l.is_empty() || d.is_empty())
    {
        return Err(Error::ValidationFailed(
            "Invalid recipient or subject".to_owned(),
        ));
    }

    let message_id = format!(
        "<{}@{}>",
        new_id(),
        context.config.identity.domain
    );
    let mut text = body.body.replace("\r\n", "\n").replace('\n', "\r\n");
    if !text.ends_with("\r\n") {
        text.push_str("\r\n");
    }
    let raw = format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n\
         Message-ID: {message_id}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {text}",
        from = claims.email,
        subject = body.subject,
        date = now.to_rfc2822(),
    );

    let row = context
        .submitter
        .submit(&claims.email, to, raw.as_bytes())?;
    info!("{log_prefix} Submitted {message_id} as {}", row.id);

    Ok(Response::json(
        202,
        &SendResponse {
            id: row.id,
            status: "queued",
            message_id,
        },
    ))
}
