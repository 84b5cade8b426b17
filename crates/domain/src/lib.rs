pub mod entities;
pub mod messaging;
pub mod repositories;
pub mod services;
pub mod value_objects;

pub use entities::*;
pub use history_errors::{ErrorClass, HistoryError, HistoryResult};
pub use messaging::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
