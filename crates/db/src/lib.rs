pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::{
    InMemoryJobRepository, InMemoryQuotaLedger, InMemoryUsageRepository, JobInsert, JobRepository,
    LedgerError, QuotaLedger, RepositoryError, SqlJobRepository, SqlQuotaLedger,
    SqlUsageRepository, UsageRepository,
};
