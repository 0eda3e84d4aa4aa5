//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::guard::{DEFAULT_COOLDOWN, DEFAULT_DAILY_LIMIT};
use crate::llm::{DeepSeekConfig, IntentKind, RouterConfig};
use crate::morals::DEFAULT_BOUNDS;
use crate::profile::cache::DEFAULT_TTL;
use crate::store::history::DEFAULT_KEEP;

/// Everything the bot reads from its environment.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Without a token the bot talks over stdin/stdout.
    pub telegram_token: Option<SecretString>,
    pub router: RouterConfig,
    pub generator: DeepSeekConfig,
    pub db_path: PathBuf,
    pub cooldown: Duration,
    pub daily_limit: u32,
    pub cache_ttl: Duration,
    pub history_keep: usize,
    pub session_idle: Duration,
    /// Stats HTTP server port; disabled when unset.
    pub stats_port: Option<u16>,
    /// Directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Intents whose prompt leaves out the active situation.
    pub exclude_context_for: Vec<IntentKind>,
    /// Upper age bounds of the first three moral brackets.
    pub moral_bounds: [u32; 3],
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| var(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let mut router = RouterConfig::new(SecretString::from(required("OPENAI_API_KEY")?));
        if let Some(model) = var("OPENAI_ROUTER_MODEL") {
            router.model = model;
        }
        if let Some(url) = var("OPENAI_API_URL") {
            router.api_url = url;
        }

        let mut generator = DeepSeekConfig::new(SecretString::from(required("DEEPSEEK_API_KEY")?));
        if let Some(model) = var("DEEPSEEK_MODEL") {
            generator.model = model;
        }
        if let Some(url) = var("DEEPSEEK_API_URL") {
            generator.api_url = url;
        }
        if let Some(language) = var("FABLE_STORY_LANGUAGE") {
            generator.language = language;
        }

        let secs = |key: &str, default: Duration| {
            var(key)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let daily_limit: u32 = var("FABLE_DAILY_LIMIT")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_DAILY_LIMIT);

        let history_keep: usize = var("FABLE_HISTORY_KEEP")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_KEEP);

        let stats_port = match var("FABLE_STATS_PORT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                key: "FABLE_STATS_PORT".into(),
                message: e.to_string(),
            })?),
            None => None,
        };

        let exclude_context_for = match lookup("FABLE_EXCLUDE_CONTEXT_FOR") {
            Some(raw) => parse_intent_list(&raw)?,
            None => vec![IntentKind::RandomMoral],
        };

        let moral_bounds = match var("FABLE_MORAL_BRACKETS") {
            Some(raw) => parse_bounds(&raw)?,
            None => DEFAULT_BOUNDS,
        };

        Ok(Self {
            telegram_token: var("TELEGRAM_BOT_TOKEN").map(SecretString::from),
            router,
            generator,
            db_path: var("FABLE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/fable-bot.db")),
            cooldown: secs("FABLE_COOLDOWN_SECS", DEFAULT_COOLDOWN),
            daily_limit,
            cache_ttl: secs("FABLE_CACHE_TTL_SECS", DEFAULT_TTL),
            history_keep,
            session_idle: secs("FABLE_SESSION_IDLE_SECS", Duration::from_secs(3600)),
            stats_port,
            log_dir: var("FABLE_LOG_DIR").map(PathBuf::from),
            exclude_context_for,
            moral_bounds,
        })
    }
}

/// Parse a comma list of intent names. An empty list excludes nothing.
pub fn parse_intent_list(raw: &str) -> Result<Vec<IntentKind>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IntentKind>().map_err(|message| ConfigError::InvalidValue {
                key: "FABLE_EXCLUDE_CONTEXT_FOR".into(),
                message,
            })
        })
        .collect()
}

/// Parse three strictly ascending bracket bounds, e.g. `5,8,12`.
pub fn parse_bounds(raw: &str) -> Result<[u32; 3], ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "FABLE_MORAL_BRACKETS".into(),
        message,
    };

    let values = raw
        .split(',')
        .map(|s| s.trim().parse::<u32>().map_err(|e| invalid(format!("{s:?}: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;

    let bounds: [u32; 3] = values
        .try_into()
        .map_err(|v: Vec<u32>| invalid(format!("expected 3 bounds, got {}", v.len())))?;

    if !(bounds[0] < bounds[1] && bounds[1] < bounds[2]) {
        return Err(invalid(format!("bounds must ascend: {bounds:?}")));
    }
    Ok(bounds)
}
