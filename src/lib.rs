// Public library interface for dirstat-rs
// The `dirstat` and `validate-scan` binaries are thin layers over these modules

pub mod cache;
pub mod config;
pub mod jobs;
pub mod report;
pub mod scanner;
pub mod tree;
pub mod worker;

pub use config::ReadConfig;
pub use tree::arena::{NodeId, ReadState, Totals};
pub use tree::events::TreeEvent;
pub use tree::DirTree;
pub use worker::ScanWorker;
