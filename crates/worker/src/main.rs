//! Standalone executor process: reads `EXECUTOR_*` settings, picks a store
//! and runs the worker pool until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;

use forgeexec_commands::{CommandOutcome, CommandRegistry, Invocation};
use forgeexec_infra::{
    Engine, ExecutorConfig, InMemoryRequestStore, PostgresRequestStore, RequestAdmin,
    RequestQuery, RequestStore, RequeueStore,
};

const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_DATABASE_MAX_CONNECTIONS: &str = "DATABASE_MAX_CONNECTIONS";

fn main() -> anyhow::Result<()> {
    forgeexec_observability::init();

    let config = ExecutorConfig::from_env().context("invalid executor configuration")?;
    let registry = builtin_commands();

    match std::env::var(ENV_DATABASE_URL) {
        Ok(url) => {
            let max_connections = std::env::var(ENV_DATABASE_MAX_CONNECTIONS)
                .ok()
                .map(|v| v.parse::<u32>())
                .transpose()
                .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?
                .unwrap_or_else(|| default_max_connections(config.pool_size));
            let store = PostgresRequestStore::connect(&url, max_connections)
                .context("failed to connect to postgres")?;
            tracing::info!(max_connections, "using postgres request store");
            run(Arc::new(store), registry, config)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; requests are kept in memory only");
            run(InMemoryRequestStore::arc(), registry, config)
        }
    }
}

/// One connection per worker plus headroom for the sweeper and API calls.
fn default_max_connections(pool_size: usize) -> u32 {
    u32::try_from(pool_size).unwrap_or(u32::MAX).saturating_add(2)
}

fn run<S>(store: Arc<S>, registry: CommandRegistry, config: ExecutorConfig) -> anyhow::Result<()>
where
    S: RequestStore + RequestQuery + RequestAdmin + RequeueStore + 'static,
{
    let engine = Engine::new(store, registry, config).context("failed to build executor")?;

    engine.start();
    if !engine.is_active() {
        anyhow::bail!("executor failed to start; see logs");
    }
    tracing::info!(
        name = %engine.config().name,
        pool_size = engine.config().pool_size,
        "executor running; press Ctrl-C to stop"
    );

    wait_for_ctrl_c()?;

    tracing::info!("shutdown requested");
    engine.stop();
    Ok(())
}

/// The engine itself is thread-based; a small runtime only listens for the signal.
fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")
}

/// Commands available out of the box.
///
/// `log` writes its context to the log and completes; `*` catches every
/// unregistered name so unknown work fails loudly instead of piling up.
fn builtin_commands() -> CommandRegistry {
    CommandRegistry::new()
        .with("log", |inv: &Invocation<'_>| {
            let context = inv.context.clone().into_value();
            tracing::info!(
                request_id = %inv.request_id,
                business_key = inv.business_key.unwrap_or("-"),
                %context,
                "log command"
            );
            CommandOutcome::success()
        })
        .with("*", |inv: &Invocation<'_>| {
            CommandOutcome::failure(format!("no handler installed for '{}'", inv.command_name))
        })
}
