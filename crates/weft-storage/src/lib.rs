// Postgres storage layer with sqlx

pub mod models;
pub mod queue;
pub mod repositories;
pub mod vault;

pub use models::*;
pub use queue::Queue;
pub use repositories::Database;
pub use vault::VaultStore;
