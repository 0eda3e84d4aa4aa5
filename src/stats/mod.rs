//! Daily usage counters and the read-only HTTP surface over them.

pub mod model;
pub mod routes;

pub use model::{DailyStats, StatCounter, StatsSummary};
pub use routes::{StatsRouteState, stats_routes};
