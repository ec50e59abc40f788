//! Purpose: Hold top-level CLI command dispatch for `levelhost`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.

use super::*;
use levelhost::api::FormatRegistry;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Serve {
            host,
            port,
            max_concurrent_jobs,
        } => {
            let config = Command::serve_config(host, port, max_concurrent_jobs);
            serve::validate_config(&config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Formats => {
            let registry = FormatRegistry::with_builtin();
            let value = json!({ "formats": registry.names() });
            let text = serde_json::to_string_pretty(&value).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode formats")
                    .with_source(err)
            })?;
            println!("{text}");
            Ok(RunOutcome::ok())
        }
    }
}
