// Copyright 2024 Google LLC
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

//! liblinch-connector is the shared runtime that linch-mind
//! data-source connectors are built on. A connector binary parses
//! [`Args`], implements [`Connector`], and hands both to [`run`];
//! everything else (daemon discovery, the IPC client, configuration,
//! status and heartbeat, the filesystem monitor, batched event
//! submission, signal-driven shutdown) lives here.

use std::{env, fs, io, sync::Mutex, time};

use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod chunker;
pub mod config;
pub mod connector;
pub mod consts;
pub mod discovery;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod status;

pub use connector::{register_signal_handlers, request_stop, stop_requested, Connector, Runtime};
pub use error::ConnectorError;

/// The command line arguments a connector binary accepts.
///
/// NOTE: You must check `version()` and handle it yourself. Clap
/// won't do a good job with its automatic version support for a
/// library.
#[derive(Parser, Debug)]
#[clap(about, disable_version_flag = true)]
pub struct Args {
    #[clap(short = 'V', long, action, help = "Print version and exit")]
    pub version: bool,

    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        help = "Override the daemon environment name (default: development)"
    )]
    pub environment: Option<String>,

    #[clap(
        short = 't',
        long,
        action,
        default_value = "30",
        help = "Seconds to wait for the daemon at startup"
    )]
    pub daemon_timeout: u64,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        self.version
    }

    /// Parse the process arguments, warning about unknown flags and
    /// carrying on rather than dying on them.
    pub fn parse_lenient() -> Args {
        Self::parse_lenient_from(env::args())
    }

    pub fn parse_lenient_from<I>(argv: I) -> Args
    where
        I: IntoIterator<Item = String>,
    {
        let mut argv: Vec<String> = argv.into_iter().collect();

        // Strip one unknown flag per round; a handful of rounds is
        // plenty for any sane command line.
        loop {
            match Args::try_parse_from(&argv) {
                Ok(args) => return args,
                Err(err) if err.kind() == clap::error::ErrorKind::UnknownArgument => {
                    let unknown = err
                        .get(clap::error::ContextKind::InvalidArg)
                        .map(|value| value.to_string());
                    let Some(unknown) = unknown else { err.exit() };

                    // tracing is not up yet at parse time
                    eprintln!("warning: ignoring unknown flag {}", unknown);
                    let before = argv.len();
                    argv.retain(|arg| {
                        arg != &unknown && !arg.starts_with(&format!("{}=", unknown))
                    });
                    if argv.len() == before {
                        err.exit();
                    }
                }
                Err(err) => err.exit(),
            }
        }
    }
}

/// Run a connector with the given arguments until a terminating
/// signal arrives.
pub fn run(args: Args, connector: Box<dyn Connector>) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    if let Some(environment) = &args.environment {
        env::set_var(consts::ENVIRONMENT_VAR, environment);
    }

    register_signal_handlers()?;

    let mut runtime = Runtime::new(connector);
    let res = runtime.run(time::Duration::from_secs(args.daemon_timeout));

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
