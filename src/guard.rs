//! Per-user generation gate: in-flight flag, cooldown, and rolling daily quota.
//!
//! The guard never fails. A user with no recorded state has never generated,
//! so every check passes for them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::profile::model::UserId;

/// Default pause between two generations for one user.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);

/// Default number of generations allowed per trailing 24 hours.
pub const DEFAULT_DAILY_LIMIT: u32 = 15;

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateReason {
    None,
    InFlight,
    Cooldown,
    DailyLimit { limit: u32 },
}

/// Outcome of [`RateGuard::can_proceed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateCheck {
    pub allowed: bool,
    pub reason: RateReason,
    /// How long until the denial lifts, when that is known.
    pub wait_hint: Option<Duration>,
}

impl RateCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: RateReason::None,
            wait_hint: None,
        }
    }

    fn deny(reason: RateReason, wait_hint: Option<Duration>) -> Self {
        Self {
            allowed: false,
            reason,
            wait_hint,
        }
    }

    /// User-facing text for a denial. Empty when allowed.
    pub fn message(&self) -> String {
        match self.reason {
            RateReason::None => String::new(),
            RateReason::InFlight => {
                "⏳ I'm already writing a fable for you, please wait a moment.".to_string()
            }
            RateReason::Cooldown => {
                let secs = self
                    .wait_hint
                    .map(|w| w.as_secs() + u64::from(w.subsec_nanos() > 0))
                    .unwrap_or(1)
                    .max(1);
                format!("⏳ Please wait {secs} s before asking for the next fable.")
            }
            RateReason::DailyLimit { limit } => {
                let wait = self
                    .wait_hint
                    .map(format_hours_minutes)
                    .unwrap_or_else(|| "a while".to_string());
                format!(
                    "🌙 You've reached today's limit of {limit} fables. Try again in {wait}."
                )
            }
        }
    }
}

/// Format a wait as "{h} h {m} min", rounding minutes up so a short wait
/// never renders as zero.
pub fn format_hours_minutes(wait: Duration) -> String {
    let total_minutes = wait.as_secs().div_ceil(60).max(1);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours == 0 {
        format!("{minutes} min")
    } else {
        format!("{hours} h {minutes} min")
    }
}

#[derive(Debug, Default)]
struct RateState {
    last_generation: Option<DateTime<Utc>>,
    in_flight: bool,
    window: VecDeque<DateTime<Utc>>,
}

impl RateState {
    fn prune(&mut self, now: DateTime<Utc>) {
        let day = chrono::Duration::hours(24);
        while let Some(oldest) = self.window.front() {
            if now - *oldest >= day {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-user cooldown, daily quota, and in-flight flag.
pub struct RateGuard {
    cooldown: chrono::Duration,
    daily_limit: u32,
    states: Mutex<HashMap<UserId, RateState>>,
}

impl RateGuard {
    pub fn new(cooldown: Duration, daily_limit: u32) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or(chrono::Duration::seconds(15)),
            daily_limit,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, RateState>> {
        // State is plain data; a panic elsewhere cannot leave it half-written.
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_proceed(&self, user: UserId) -> RateCheck {
        self.can_proceed_at(user, Utc::now())
    }

    pub fn can_proceed_at(&self, user: UserId, now: DateTime<Utc>) -> RateCheck {
        let mut states = self.lock();
        let mut fresh = RateState::default();
        let state = match states.get_mut(&user) {
            Some(state) => state,
            None => &mut fresh,
        };
        Self::check(state, now, self.cooldown, self.daily_limit)
    }

    fn check(
        state: &mut RateState,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
        daily_limit: u32,
    ) -> RateCheck {
        if state.in_flight {
            return RateCheck::deny(RateReason::InFlight, None);
        }

        state.prune(now);
        if state.window.len() >= daily_limit as usize {
            let wait = state
                .window
                .front()
                .map(|oldest| *oldest + chrono::Duration::hours(24) - now)
                .and_then(|d| d.to_std().ok());
            return RateCheck::deny(RateReason::DailyLimit { limit: daily_limit }, wait);
        }

        if let Some(last) = state.last_generation {
            let elapsed = now - last;
            if elapsed < cooldown {
                let wait = (cooldown - elapsed).to_std().ok();
                return RateCheck::deny(RateReason::Cooldown, wait);
            }
        }

        RateCheck::allow()
    }

    /// Mark a generation as started. Prefer [`RateGuard::try_acquire`], which
    /// pairs this with a guaranteed `end`.
    pub fn begin(&self, user: UserId) {
        self.lock().entry(user).or_default().in_flight = true;
    }

    pub fn end(&self, user: UserId) {
        self.end_at(user, Utc::now());
    }

    /// Clear the in-flight flag and record a generation at `now`.
    ///
    /// Every attempt counts, including failed ones.
    pub fn end_at(&self, user: UserId, now: DateTime<Utc>) {
        let mut states = self.lock();
        let state = states.entry(user).or_default();
        state.in_flight = false;
        state.last_generation = Some(now);
        state.window.push_back(now);
    }

    pub fn is_in_flight(&self, user: UserId) -> bool {
        self.lock().get(&user).is_some_and(|s| s.in_flight)
    }

    /// Check and begin atomically. The returned permit ends the generation
    /// when dropped, on every exit path.
    pub fn try_acquire(self: &Arc<Self>, user: UserId) -> Result<GenerationPermit, RateCheck> {
        self.try_acquire_at(user, Utc::now())
    }

    pub fn try_acquire_at(
        self: &Arc<Self>,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<GenerationPermit, RateCheck> {
        let mut states = self.lock();
        let state = states.entry(user).or_default();
        let check = Self::check(state, now, self.cooldown, self.daily_limit);
        if !check.allowed {
            debug!(user_id = user, reason = ?check.reason, "Generation denied");
            return Err(check);
        }
        state.in_flight = true;
        Ok(GenerationPermit {
            guard: Arc::clone(self),
            user,
        })
    }

    /// Drop state that no longer constrains anything: not in flight, cooldown
    /// elapsed, and no generations left in the 24h window.
    pub fn prune_idle_at(&self, now: DateTime<Utc>) -> usize {
        let mut states = self.lock();
        let before = states.len();
        let cooldown = self.cooldown;
        states.retain(|_, state| {
            state.prune(now);
            let cooling = state.last_generation.is_some_and(|l| now - l < cooldown);
            state.in_flight || cooling || !state.window.is_empty()
        });
        before - states.len()
    }
}

impl Default for RateGuard {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN, DEFAULT_DAILY_LIMIT)
    }
}

/// Scoped in-flight marker. Dropping it calls [`RateGuard::end`].
pub struct GenerationPermit {
    guard: Arc<RateGuard>,
    user: UserId,
}

impl GenerationPermit {
    pub fn user(&self) -> UserId {
        self.user
    }
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        self.guard.end(self.user);
    }
}

impl std::fmt::Debug for GenerationPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationPermit")
            .field("user", &self.user)
            .finish()
    }
}
