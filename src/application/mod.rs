// Application layer: ledger operations, the snapshot cache and its loader.

mod aggregation;
mod cache;
pub mod error;
mod service;

pub use aggregation::*;
pub use cache::*;
pub use error::*;
pub use service::*;
