//! Persistence layer — libSQL-backed operational and dashboard stores.

pub mod dashboard;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use dashboard::LibSqlDashboard;
pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ApiCallCount, DailyCount, DashboardMessage, DashboardStore, OperationalStore, Totals,
};
