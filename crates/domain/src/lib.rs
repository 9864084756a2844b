pub mod entities;
pub mod providers;
pub mod repositories;
pub mod sqlx_impls;

pub use broker_core::{BrokerError, BrokerResult};
pub use entities::*;
pub use providers::*;
pub use repositories::*;
