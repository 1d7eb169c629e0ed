mod adapters;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use duebill_infra::{BillingCoreService, CoreConfig, CoreDependencies, LoggingEntitlementGate};

use crate::adapters::{FileAccountFacts, LoggingInvoiceGenerator, NoGatewayExecutor};

const SCHEMA: &str = include_str!("../../../migrations/0001_deferred_work.sql");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    duebill_observability::init();

    let config = CoreConfig::from_env().context("invalid DUEBILL_* configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let facts_path = std::env::var("DUEBILL_ACCOUNT_FACTS_PATH").unwrap_or_else(|_| {
        tracing::warn!("DUEBILL_ACCOUNT_FACTS_PATH not set; using ./account_facts.json");
        "account_facts.json".to_string()
    });

    let pool = PgPoolOptions::new()
        .max_connections(config.max_concurrent as u32 + 2)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .context("failed to apply schema")?;

    let deps = CoreDependencies::postgres(
        pool,
        Arc::new(FileAccountFacts::new(facts_path)),
        Arc::new(LoggingEntitlementGate),
        Arc::new(NoGatewayExecutor),
        Arc::new(LoggingInvoiceGenerator),
    );
    let service = BillingCoreService::start(deps, config)
        .await
        .context("failed to start billing core")?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    service.shutdown().await;
    Ok(())
}
