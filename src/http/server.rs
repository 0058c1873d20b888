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

//! One HTTP connection: a keep-alive loop of requests and responses.

use std::rc::Rc;
use std::time::Duration;

use chrono::prelude::*;
use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use super::api::{self, ApiContext};
use super::wire::{self, ReadError, Response};
use crate::support::{async_io::SessionIo, error::Error, log_prefix::LogPrefix};

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Serve requests on `io` until the client closes the connection or asks for
/// it to be closed.
///
/// With an acceptor, TLS is negotiated before the first request.
pub async fn serve_http(
    io: SessionIo,
    context: Rc<ApiContext>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
) -> Result<(), Error> {
    if let Some(ref ssl_acceptor) = ssl_acceptor {
        io.ssl_accept(ssl_acceptor).await?;
    }

    let mut reader = BufReader::new(io.clone());
    let mut writer = BufWriter::new(io);

    loop {
        let request = match tokio::time::timeout(
            KEEP_ALIVE,
            wire::read_request(&mut reader),
        )
        .await
        {
            Err(_) | Ok(Err(ReadError::Closed)) => return Ok(()),
            Ok(Err(ReadError::Io(e))) => return Err(e.into()),
            Ok(Err(ReadError::BadRequest(msg))) => {
                warn!("{log_prefix} Bad request: {msg}");
                let response = Response::error(400, msg);
                writer.write_all(&response.render(false)).await?;
                writer.flush().await?;
                return Ok(());
            },
            Ok(Err(ReadError::TooLarge)) => {
                warn!("{log_prefix} Request too large");
                let response = Response::error(413, "Request too large");
                writer.write_all(&response.render(false)).await?;
                writer.flush().await?;
                return Ok(());
            },
            Ok(Ok(request)) => request,
        };

        let response = api::route(&context, &log_prefix, &request, Utc::now());
        info!(
            "{log_prefix} {} {} {}",
            request.method, request.path, response.status,
        );
        writer
            .write_all(&response.render(request.keep_alive))
            .await?;
        writer.flush().await?;

        if !request.keep_alive {
            return Ok(());
        }
    }
}
