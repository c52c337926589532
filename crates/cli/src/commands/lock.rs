use concord_core::audit::ActModeLockStore;
use concord_db::FileLockStore;

use crate::commands::{load_config, runtime, CommandResult};

pub fn status() -> CommandResult {
    let store = match lock_store("lock status") {
        Ok(store) => store,
        Err(failure) => return failure,
    };
    let runtime = match runtime("lock status") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    match runtime.block_on(store.read_lock()) {
        Ok(None) => CommandResult::success(
            "lock status",
            format!("no act-mode lock at `{}`", store.path().display()),
        ),
        Ok(Some(lock)) => CommandResult::success(
            "lock status",
            format!(
                "act-mode lock present since {}: {}",
                lock.timestamp.to_rfc3339(),
                lock.reason
            ),
        ),
        Err(error) => CommandResult::failure("lock status", "lock_read", error.to_string(), 4),
    }
}

/// Operators clear the lock by hand after auditing the shutdown.
pub fn clear() -> CommandResult {
    let store = match lock_store("lock clear") {
        Ok(store) => store,
        Err(failure) => return failure,
    };
    let runtime = match runtime("lock clear") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    match runtime.block_on(store.clear()) {
        Ok(true) => CommandResult::success(
            "lock clear",
            format!("removed act-mode lock `{}`", store.path().display()),
        ),
        Ok(false) => CommandResult::success("lock clear", "no act-mode lock present"),
        Err(error) => CommandResult::failure("lock clear", "lock_write", error.to_string(), 4),
    }
}

fn lock_store(command: &str) -> Result<FileLockStore, CommandResult> {
    let config = load_config(command)?;
    Ok(FileLockStore::new(config.storage.lock_path))
}
