//! Daily aggregate counters.

use serde::Serialize;

/// Which daily counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatCounter {
    Stories,
    NewUsers,
    StartCommands,
    ProfilesCompleted,
}

impl StatCounter {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Stories => "stories_count",
            Self::NewUsers => "new_users_count",
            Self::StartCommands => "start_command_count",
            Self::ProfilesCompleted => "profile_completed_count",
        }
    }
}

/// One row of `daily_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    /// Calendar date, `YYYY-MM-DD` (UTC).
    pub date: String,
    pub stories_count: i64,
    pub new_users_count: i64,
    pub start_command_count: i64,
    pub profile_completed_count: i64,
}

/// Totals across all recorded days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub days: i64,
    pub stories: i64,
    pub new_users: i64,
    pub start_commands: i64,
    pub profiles_completed: i64,
}
