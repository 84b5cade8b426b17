pub mod app;
pub mod embedded;
pub mod shutdown;

pub use app::{Application, ClusterNode};
pub use shutdown::ShutdownManager;
