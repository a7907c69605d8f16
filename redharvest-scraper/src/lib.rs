pub mod observability;
pub mod reddit;
pub mod retry;
pub mod shutdown;
pub mod usage;
pub mod workers;
