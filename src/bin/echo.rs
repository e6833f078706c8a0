// Minimal HTTP/1.1 server on top of a multi-reactor event loop.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2023 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2023 UBIDECO Institute, Switzerland
// Copyright 2021 Alexis Sellier <alexis@cloudhead.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Demo server: echoes the request target of `GET` requests and the body of any other request,
//! or serves a single file to every request when `--file` is given.
//!
//! Runs until a line is entered on the standard input.

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, process};

use clap::Parser;
use httpd::{HandlerError, Request, Response, Server, ServerConfig};

#[derive(Clone, Debug, Parser)]
#[command(name = "echo-server", about = "Minimal multi-reactor HTTP echo server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1", env = "HTTPD_HOST")]
    host: IpAddr,

    /// Port to listen on; 0 picks a free one
    #[arg(short, long, default_value_t = 8080, env = "HTTPD_PORT")]
    port: u16,

    /// Number of worker reactors; defaults to the number of CPUs minus one
    #[arg(short, long, env = "HTTPD_WORKERS")]
    workers: Option<usize>,

    /// Seconds of silence after which a connection is closed; 0 disables idle reaping
    #[arg(long, default_value_t = 60, env = "HTTPD_IDLE_TIMEOUT")]
    idle_timeout: u64,

    /// File to serve instead of echoing requests
    #[arg(short, long, env = "HTTPD_FILE")]
    file: Option<PathBuf>,

    /// Content type of the served file
    #[arg(long, default_value = "application/octet-stream")]
    content_type: String,
}

fn echo(request: Request) -> Result<Response, HandlerError> {
    let body = match request.method() {
        "GET" => request.target().as_bytes().to_vec(),
        _ => request.into_body(),
    };
    Ok(Response::with_status(200).with_header("Content-Type", "text/plain").with_body(body))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = ServerConfig::new((args.host, args.port))
        .with_idle_timeout(Some(Duration::from_secs(args.idle_timeout)).filter(|t| !t.is_zero()));
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }

    let mut server = match args.file {
        Some(path) => {
            let content_type = args.content_type;
            Server::new(config, move |_: Request| -> Result<Response, HandlerError> {
                let data = fs::read(&path)?;
                Ok(Response::with_status(200)
                    .with_header("Content-Type", content_type.as_str())
                    .with_body(data))
            })
        }
        None => Server::new(config, echo),
    };

    match server.start() {
        Ok(addr) => log::info!("Serving on http://{addr}; press Enter to stop"),
        Err(err) => {
            log::error!("Unable to start the server: {err}");
            process::exit(1);
        }
    }

    let mut line = String::new();
    if let Err(err) = io::stdin().lock().read_line(&mut line) {
        log::warn!("Unable to read standard input: {err}");
    }
    server.stop();
}
