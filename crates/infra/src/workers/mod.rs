//! Background workers that consume the ledger event feed.

pub mod feed_worker;

pub use feed_worker::{FeedWorker, WorkerHandle};
