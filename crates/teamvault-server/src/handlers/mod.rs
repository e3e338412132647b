pub mod audit;
pub mod auth;
pub mod leases;
pub mod replication;
pub mod secrets;
pub mod service_accounts;
pub mod webhooks;
