#[macro_use]
extern crate tracing;

pub mod api;
pub mod chain;
pub mod collection;
pub mod config;
pub mod error;
mod link;
pub mod proxy;
pub mod stream;
pub mod task;
pub mod toxic;

pub use collection::ProxyCollection;
pub use error::{Error, ErrorKind};
pub use proxy::{Proxy, ProxyConfig};
pub use toxic::{StreamDirection, Toxic, ToxicKind};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
