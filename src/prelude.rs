//! Convenience re-exports for command handlers.
//!
//! ```rust
//! use notion_cli_core::prelude::*;
//! ```

pub use crate::config::{CacheConfig, HttpConfig, RetryConfig};
pub use crate::error::{Error, TransportCode};
pub use crate::fetcher::{CoreConfig, CoreContext, FetchOptions, Invalidation};
pub use crate::key::{CacheKey, Namespace};
pub use crate::retry::RetryPolicy;
pub use crate::transport::Transport;
