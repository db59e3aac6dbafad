//! Transport stages and protocol selection
//!
//! Connections flow head-to-tail through a chain of byte-transforming
//! stages: raw socket, optional TLS framing, then the exchange stage
//! installed by protocol selection.

mod duplex;
mod select;
pub mod tls;

pub use duplex::Duplex;
pub use select::{select_protocol, SelectedProtocol};
pub use tls::{accept_with_deadline, build_acceptor, ALPN_H2, ALPN_HTTP1};
