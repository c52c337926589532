use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use concord_core::{GovernanceOrchestrator, GovernanceStatus};
use concord_db::DbPool;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    core: Arc<GovernanceOrchestrator>,
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub kill_switch: HealthCheck,
    pub database: HealthCheck,
    pub governance: GovernanceStatus,
    pub checked_at: String,
}

pub fn router(core: Arc<GovernanceOrchestrator>, db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { core, db_pool })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    core: Arc<GovernanceOrchestrator>,
    db_pool: DbPool,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(core, db_pool)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let governance = state.core.status().await;
    let database = database_check(&state.db_pool).await;
    let kill_switch = kill_switch_check(&governance);

    let ready = kill_switch.status == "ready" && database.status == "ready";
    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        kill_switch,
        database,
        governance,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn kill_switch_check(governance: &GovernanceStatus) -> HealthCheck {
    if governance.safety.is_active {
        return HealthCheck {
            status: "tripped",
            detail: format!("emergency shutdown: {}", governance.safety.last_reasons.join("; ")),
        };
    }
    match governance.act_mode_locked {
        Some(true) => HealthCheck {
            status: "ready",
            detail: "act-mode lock present from an earlier shutdown; audit pending".to_string(),
        },
        Some(false) => HealthCheck { status: "ready", detail: "kill switch armed".to_string() },
        None => HealthCheck { status: "ready", detail: "act-mode lock unreadable".to_string() },
    }
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use concord_core::domain::resource::ResourceUsage;
    use concord_core::{Collaborators, GovernanceConfig, GovernanceOrchestrator, StatusColor};
    use concord_db::connect_with_settings;

    use crate::health::{health, HealthState};

    fn core() -> Arc<GovernanceOrchestrator> {
        Arc::new(GovernanceOrchestrator::new(
            GovernanceConfig::default(),
            Collaborators::in_memory(8),
        ))
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) =
            health(State(HealthState { core: core(), db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.kill_switch.status, "ready");
        assert_eq!(payload.governance.health.color, StatusColor::Blue);
        assert_eq!(payload.governance.act_mode_locked, Some(false));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_kill_switch_trips() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let core = core();
        core.safety()
            .monitor(ResourceUsage { cpu: 99.0, memory: 10.0, tokens: 0.0, cost: 0.0 })
            .await;

        let (status, Json(payload)) =
            health(State(HealthState { core, db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.kill_switch.status, "tripped");
        assert!(payload.kill_switch.detail.contains("CPU threshold exceeded"));
        assert_eq!(payload.governance.act_mode_locked, Some(true));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) = health(State(HealthState { core: core(), db_pool: pool })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.kill_switch.status, "ready");
    }
}
