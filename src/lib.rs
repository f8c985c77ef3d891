//! A byte-level HTTP/1.1 server core.
//!
//! The crate couples an incremental byte parser to an application handler
//! through an asynchronous connection state machine, with admission limits,
//! write flow control, and cancellation propagation on aborted bodies.

// ----------

use std::{future::Future, pin::Pin};

// ----------

pub use std::error::Error as StdError;

pub(crate) use thiserror::Error as ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub mod application;
pub mod connection;
pub mod content;
pub mod cookies;
pub mod errors;
pub mod gateway;
pub mod headers;
pub mod messages;
pub mod multipart;
pub mod parser;
pub mod scribe;
pub mod url;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub type BoxedError = Box<dyn StdError + Send + Sync>;
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// --------------------------------------------------------------------------------
