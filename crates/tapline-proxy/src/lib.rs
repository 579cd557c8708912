//! Tapline Proxy - transaction-tracking forward proxy core.
//!
//! This crate holds the domain logic of Tapline, independent of the HTTP
//! server that exposes it:
//!
//! - [`transaction`]: in-flight transaction store, finalized exactly once
//! - [`forward`]: upstream target resolution and request relaying
//! - [`tunnel`]: raw CONNECT tunnels
//! - [`system_proxy`]: backup, enable, disable and restore of the host's
//!   system proxy settings
//!
//! ## Architecture
//!
//! ```text
//! Client ─┬─ CONNECT host:port ──► TunnelHandler ──► raw TCP relay
//!         │
//!         └─ HTTP request ──► /proxy/*         ──► control API
//!                             /proxy/forward/* ──► Forwarder (explicit)
//!                             anything else    ──► Forwarder (catch-all)
//!
//! every exchange ──► TransactionStore ──► "HTTP Transaction" log event
//! ```

mod error;
pub mod forward;
pub mod system_proxy;
pub mod transaction;
pub mod tunnel;

pub use error::{CommandError, ProxyError, Result};
pub use forward::{Forwarder, ForwardMode, UpstreamResponse};
pub use system_proxy::{
    CommandRunner, NetworkService, NetworkSetup, ProxyKind, ProxySettings, SystemProxyManager,
};
pub use transaction::{
    RequestRecord, ResponseRecord, Transaction, TransactionId, TransactionSink, TransactionStore,
};
pub use tunnel::{ConnectRequest, OpenTunnel, TunnelHandler, TunnelState};

/// Default listening port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Default port reserved for HTTPS interception.
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
