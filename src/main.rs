//! Purpose: `levelhost` CLI entry point.
//! Role: Binary crate root; parses args, dispatches commands, maps errors to exit codes.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::net::{IpAddr, SocketAddr};

use clap::{Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod serve;

use levelhost::api::{Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `levelhost --help`."));
            }
        },
    };

    command_dispatch::dispatch_command(cli.command)
}

#[derive(Parser)]
#[command(
    name = "levelhost",
    version,
    about = "Keep levels open in memory and convert them over HTTP",
    long_about = "Keep expensive-to-open levels loaded, share them between requests, and run chunk copies between formats.\n\nLogging honors RUST_LOG (default: info)."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run the HTTP conversion server")]
    Serve {
        #[arg(long, default_value = "0.0.0.0", help = "Address to bind")]
        host: IpAddr,
        #[arg(long, default_value_t = 8080, help = "Port to bind")]
        port: u16,
        #[arg(
            long,
            default_value_t = 4,
            help = "Conversions allowed to run at once; extra requests get 429"
        )]
        max_concurrent_jobs: usize,
    },
    #[command(about = "List the target formats this build can write (JSON)")]
    Formats,
}

impl Command {
    fn serve_config(host: IpAddr, port: u16, max_concurrent_jobs: usize) -> serve::ServeConfig {
        serve::ServeConfig {
            bind: SocketAddr::new(host, port),
            max_concurrent_jobs,
        }
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Load => "failed to load level".to_string(),
        ErrorKind::UnknownFormat => "unknown format".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Closed => "level is closed".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Job => "job failed".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, error_json, error_text};
    use clap::Parser;
    use levelhost::api::{Error, ErrorKind};

    #[test]
    fn serve_defaults_bind_all_interfaces() {
        let cli = Cli::try_parse_from(["levelhost", "serve"]).expect("parse");
        let Command::Serve {
            host,
            port,
            max_concurrent_jobs,
        } = cli.command
        else {
            panic!("expected serve");
        };
        let config = Command::serve_config(host, port, max_concurrent_jobs);
        assert_eq!(config.bind.to_string(), "0.0.0.0:8080");
        assert_eq!(config.max_concurrent_jobs, 4);
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(Cli::try_parse_from(["levelhost", "serve", "--port", "nope"]).is_err());
    }

    #[test]
    fn error_json_carries_kind_hint_and_path() {
        let err = Error::new(ErrorKind::AlreadyExists)
            .with_message("Already exists path: /tmp/out")
            .with_hint("Choose another path.")
            .with_path("/tmp/out");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "AlreadyExists");
        assert_eq!(value["error"]["hint"], "Choose another path.");
        assert_eq!(value["error"]["path"], "/tmp/out");
        assert!(error_text(&err).starts_with("error: Already exists path"));
    }
}
