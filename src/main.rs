use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fable_bot::channels::{Channel, CliChannel, TelegramChannel};
use fable_bot::config::BotConfig;
use fable_bot::engine::ConversationEngine;
use fable_bot::engine::pipeline::GenerationPipeline;
use fable_bot::guard::RateGuard;
use fable_bot::llm::{DeepSeekGenerator, OpenAiRouter};
use fable_bot::morals::MoralCatalog;
use fable_bot::profile::{ProfileCache, ProfileStore};
use fable_bot::stats::{StatsRouteState, stats_routes};
use fable_bot::store::{Database, LibSqlBackend};

/// How often idle sessions, rate windows, and cache entries are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::from_env().context("Failed to load configuration")?;

    // Held for the life of main so buffered log lines are flushed on exit
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📖 Fable Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Router: {}", config.router.model);
    eprintln!("   Writer: {} ({})", config.generator.model, config.generator.language);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?
        .with_history_keep(config.history_keep);
    let db: Arc<dyn Database> = Arc::new(backend);
    eprintln!("   Database: {}", config.db_path.display());

    let cache = Arc::new(ProfileCache::new(config.cache_ttl));
    let profiles = ProfileStore::new(Arc::clone(&db), Arc::clone(&cache));
    let guard = Arc::new(RateGuard::new(config.cooldown, config.daily_limit));
    eprintln!(
        "   Limits: {} per day, {}s cooldown",
        config.daily_limit,
        config.cooldown.as_secs()
    );

    // ── Stats server ─────────────────────────────────────────────────────
    if let Some(port) = config.stats_port {
        let app = stats_routes(StatsRouteState {
            db: Arc::clone(&db),
        });
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind stats port {port}"))?;
        tokio::spawn(async move {
            tracing::info!(port, "Stats server started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Stats server stopped");
            }
        });
        eprintln!("   Stats: http://0.0.0.0:{port}/api/stats");
    }

    // ── Channel ──────────────────────────────────────────────────────────
    let channel: Arc<dyn Channel> = match &config.telegram_token {
        Some(token) => {
            let telegram = TelegramChannel::new(token.clone());
            telegram
                .health_check()
                .await
                .context("Telegram bot token was rejected")?;
            eprintln!("   Channel: telegram\n");
            Arc::new(telegram)
        }
        None => {
            eprintln!("   Channel: cli (set TELEGRAM_BOT_TOKEN for Telegram)");
            eprintln!("   Type /start to begin; !<button_id> presses a button.\n");
            Arc::new(CliChannel::new())
        }
    };

    // ── Engine ───────────────────────────────────────────────────────────
    let pipeline = GenerationPipeline::new(
        profiles.clone(),
        Arc::clone(&guard),
        Arc::new(OpenAiRouter::new(config.router.clone())),
        Arc::new(DeepSeekGenerator::new(config.generator.clone())),
        Arc::clone(&channel),
    )
    .with_morals(MoralCatalog::new(config.moral_bounds))
    .with_context_exclusions(config.exclude_context_for.iter().copied());

    let engine = Arc::new(
        ConversationEngine::new(profiles, Arc::clone(&guard), Arc::new(pipeline), channel)
            .with_idle_timeout(config.session_idle),
    );

    let sweeper = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        interval.tick().await; // Skip immediate first tick
        loop {
            interval.tick().await;
            let now = Utc::now();
            let sessions = sweeper.prune_idle_sessions_at(now);
            let rates = guard.prune_idle_at(now);
            let profiles = cache.prune_expired_at(now).await;
            tracing::debug!(sessions, rates, profiles, "Periodic prune");
        }
    });

    engine.run().await?;
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fable-bot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
