//! Core abstractions shared by every layer of the indexer

pub mod asset;
pub mod error;
pub mod traits;
pub mod types;

pub use asset::{pool_of, AssetClass, AssetClassifier};
pub use error::*;
pub use traits::*;
pub use types::*;
