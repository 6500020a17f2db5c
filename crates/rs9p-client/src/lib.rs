#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client library for Rust.
//!
//! This crate provides a tokio-based client for the 9P2000 protocol. Many
//! requests share one connection at once; each is matched to its reply by
//! tag, and fid numbers are recycled only after the server has acknowledged
//! their clunk.
//!
//! # Getting Started
//!
//! 1. Obtain a stream to the server, either with [`dial`] or any
//!    `AsyncRead`/`AsyncWrite` pair handed to [`Conn::new`]
//! 2. [`Conn::attach`] to a file tree to get an [`Fsys`]
//! 3. Walk, open, read and write through [`Fid`] handles, and close them
//!
//! # Example
//!
//! ```no_run
//! use rs9p_client::{Config, Result, dial, om};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = dial("unix!/tmp/ns.glenda/acme!0", Config::default()).await?;
//!     let fsys = conn.attach("glenda", "").await?;
//!
//!     let index = fsys.open("index", om::READ).await?;
//!     let text = index.read_to_end().await?;
//!     index.close().await?;
//!
//!     println!("{}", String::from_utf8_lossy(&text));
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Tags
//!
//! Every request carries a 16-bit tag that is unique among the requests still
//! waiting on that connection. Replies may arrive in any order. A reply whose
//! tag matches nothing, or whose type does not answer the request, is a
//! protocol violation and closes the connection.
//!
//! ## Fid Management
//!
//! A fid is a 32-bit handle the client picks for a file on the server.
//!
//! **Important invariants:**
//! - A fid number is allocated, then active once attach/walk succeeds
//! - `Fid::close` marks it retiring and sends `Tclunk`
//! - The number is reused only after the server's reply to that `Tclunk`,
//!   never merely after it was sent: proxies such as 9pserve keep the fid in
//!   their tables until the back end answers
//!
//! # Error Handling
//!
//! Operations return [`Error`]. `RError` replies surface as
//! [`Error::ServerRejected`] with the server's text and affect only that call.
//! Malformed frames, protocol violations and I/O failures close the
//! connection: every waiting and later call gets [`Error::ConnectionClosed`].
//! There is no reconnect; dial again for a fresh connection.
//!
//! # Transport
//!
//! [`dial`] supports:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!127.0.0.1!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
pub mod conn;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod fsys;
pub mod serialize;
#[macro_use]
pub mod utils;

pub use crate::conn::{Config, Conn, DEFAULT_MSIZE, dial};
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fsys::{Fid, Fsys};
pub use crate::utils::Result;
