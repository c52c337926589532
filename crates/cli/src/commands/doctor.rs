use concord_core::audit::ActModeLockStore;
use concord_core::config::{AppConfig, LoadOptions};
use concord_db::{connect_with_settings, FileLockStore};
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Exit code is 0 only when every check passes.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => {
                    checks.push(check_database_connectivity(&runtime, &config));
                    checks.push(check_act_mode_lock(&runtime, &config));
                }
                Err(error) => {
                    let details = format!("failed to initialize async runtime: {error}");
                    checks.push(failed("database_connectivity", details.clone()));
                    checks.push(failed("act_mode_lock", details));
                }
            }
        }
        Err(error) => {
            checks.push(failed("config_validation", error.to_string()));
            checks.push(skipped("database_connectivity"));
            checks.push(skipped("act_mode_lock"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database_connectivity(runtime: &Runtime, config: &AppConfig) -> DoctorCheck {
    let storage = &config.storage;
    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &storage.database_url,
            storage.max_connections,
            storage.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", storage.database_url),
        },
        Err(error) => failed("database_connectivity", error),
    }
}

/// A present lock means an emergency shutdown has not been audited yet.
fn check_act_mode_lock(runtime: &Runtime, config: &AppConfig) -> DoctorCheck {
    let store = FileLockStore::new(config.storage.lock_path.clone());
    match runtime.block_on(store.read_lock()) {
        Ok(None) => DoctorCheck {
            name: "act_mode_lock",
            status: CheckStatus::Pass,
            details: format!("no lock at `{}`", store.path().display()),
        },
        Ok(Some(lock)) => failed(
            "act_mode_lock",
            format!(
                "lock present since {} ({}); audit then run `concord lock clear`",
                lock.timestamp.to_rfc3339(),
                lock.reason
            ),
        ),
        Err(error) => failed("act_mode_lock", error.to_string()),
    }
}

fn failed(name: &'static str, details: String) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Fail, details }
}

fn skipped(name: &'static str) -> DoctorCheck {
    DoctorCheck {
        name,
        status: CheckStatus::Skipped,
        details: "skipped because configuration did not load".to_string(),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
