//! Block acquisition: Tendermint RPC, the local archive and the fetch loop

pub mod archive;
pub mod fetcher;
pub mod rpc;
pub mod source;

pub use archive::{ArchiveReader, ArchiveWriter, BlockArchive};
pub use fetcher::{Backoff, BlockFetcher};
pub use rpc::TendermintClient;
pub use source::{BlockIter, BlockSource, Origin};
