pub mod asset_writer;
pub mod fetch;
pub mod handlers;
pub mod normalizer;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod thumbnail;
