pub mod checks;
pub mod queries;
pub mod runner;

pub use checks::CheckError;
pub use queries::{GraphWorkload, Prepared, QueryError, QueryKind, Workload};
pub use runner::{QueryStats, QueryStatsSnapshot, RunnerConfig};
