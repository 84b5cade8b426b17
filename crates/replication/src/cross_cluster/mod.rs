pub mod fetcher;
pub mod source;
mod target_task;

pub use fetcher::{CrossClusterFetcherResources, CrossClusterTaskFetcher, FetcherStats, OwnedShards};
pub use source::{CrossClusterOutbox, CrossClusterSourceExecutor};
