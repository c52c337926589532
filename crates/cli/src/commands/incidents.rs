use concord_db::FileIncidentLog;

use crate::commands::{load_config, runtime, CommandResult};

pub fn run(tail: usize) -> CommandResult {
    let config = match load_config("incidents") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("incidents") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let log = FileIncidentLog::new(config.storage.incident_log_path);
    match runtime.block_on(log.tail(tail)) {
        Ok(entries) if entries.is_empty() => CommandResult {
            exit_code: 0,
            output: format!("no entries in `{}`", log.path().display()),
        },
        Ok(entries) => CommandResult { exit_code: 0, output: entries.join("\n\n") },
        Err(error) => CommandResult::failure("incidents", "log_read", error.to_string(), 4),
    }
}
