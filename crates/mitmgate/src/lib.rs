//! An explicit forward proxy that terminates HTTP and HTTPS, impersonates
//! origin servers with certificates minted on the fly from a locally-trusted
//! root, and hands every intercepted request/response pair to an ordered
//! chain of [`addon::Addon`]s that may observe, mutate, short-circuit, or
//! stream-transform the traffic.
//!
//! The listener is started with [`Proxy::start`]; everything else hangs off
//! [`Options`].

pub mod addon;
pub mod cert;
pub mod client;
mod connection;
pub mod flow;
pub mod http;
pub mod proxy;
pub mod tls;
pub mod upstream;

pub use addon::Addon;
pub use connection::{ClientConn, ConnContext, ServerConn};
pub use flow::Flow;
pub use proxy::{Options, Proxy, ProxyError};
