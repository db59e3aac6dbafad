//! Hearth - Connection-oriented HTTP/1.1 server engine
//!
//! Terminates TCP (optionally TLS), selects the wire protocol, and drives
//! each connection's request/response lifecycle with timer-wheel deadlines
//! and a hard connection cap.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod handler;
pub mod http1;
pub mod server;
pub mod stage;
pub mod timer;

pub use config::{ServerOptions, TlsOptions};
pub use error::{BoxError, EngineError, Result};
pub use handler::{ConnectionContext, Handler, MuxFactory, ServiceErrorHandler};
pub use http1::{ExchangeState, RequestBody, ResponseBody};
pub use server::{Server, ServerEngine};
