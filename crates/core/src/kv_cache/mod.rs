//! Cache-side collaborators of the attention backend.
//!
//! - `KvPool` / `TokenToKvPool`: per-layer key/value storage indexed by slot
//! - `ReqToTokenPool`: routing table from request pool index to slots

pub mod config;
mod error;
mod req_to_token;
mod token_pool;

pub use config::KvPoolConfig;
pub use error::CacheError;
pub use req_to_token::ReqToTokenPool;
pub use token_pool::{KvPool, TokenToKvPool};
