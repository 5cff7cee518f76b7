pub mod app_config;
pub mod observability;
pub mod retry;
pub mod store;
pub mod worker;

pub use app_config::*;
pub use observability::*;
pub use retry::*;
pub use store::*;
pub use worker::*;
