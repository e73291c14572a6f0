#![forbid(unsafe_code)]
//! Asynchronous 9P2000 protocol library for Rust.
//!
//! This crate implements the classic 9P2000 protocol from Plan 9: a
//! bit-exact wire codec for the T-/R-message family, a client session
//! engine, and the dispatch machinery a multi-client file server needs,
//! all running on a tokio reactor.
//!
//! # Overview
//!
//! The protocol is a request/response exchange over a stream transport.
//! Every message is framed as `size[4] type[1] tag[2] body...` with
//! little-endian integers, where `size` covers itself. A session starts
//! with a `TVersion` handshake that negotiates the maximum message size
//! (msize), attaches a fid to the server's root directory and then walks,
//! opens, reads, writes and clunks fids until the connection closes.
//!
//! # Client
//!
//! ```no_run
//! use ninep::{client::Session, transport};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> ninep::Result<()> {
//!     let stream = transport::connect("tcp!127.0.0.1!564").await?;
//!     let mut session = Session::attach(stream, "glenda", "").await?;
//!     let bytes = session.read_file("/doc/plan").await?;
//!     println!("{}", String::from_utf8_lossy(&bytes));
//!     session.detach().await
//! }
//! ```
//!
//! # Server
//!
//! Implement [`srv::Filesystem`] for your file tree and hand it to
//! [`srv::srv`]:
//!
//! ```no_run
//! use ninep::{srv::{FId, Filesystem, srv}, FCall, QId, QIdType, Result};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct HelloFs;
//!
//! #[async_trait]
//! impl Filesystem for HelloFs {
//!     type FId = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: QId {
//!                 typ: QIdType::DIR,
//!                 version: 0,
//!                 path: 1,
//!             },
//!         })
//!     }
//!
//!     // Implement the operations the filesystem supports...
//! }
//!
//! #[tokio::main]
//! async fn main() -> ninep::Result<()> {
//!     srv(HelloFs, "tcp!0.0.0.0!564").await
//! }
//! ```
//!
//! # Errors
//!
//! 9P2000 reports errors as strings carried by `RError`. Handlers return
//! [`error::Error`]; errno-style values are rendered with the classic
//! Plan 9 phrasing ("file not found", "fid unknown or out of range") at
//! the protocol boundary, and an `RError` received by the client surfaces
//! as [`error::Error::Remote`].
//!
//! # Concurrency
//!
//! The server serves each connection on its own task and each request on
//! a fresh task, so arbitrary client tags are honoured. The client is
//! strictly call/response and is intended to run on the single-threaded
//! cooperative runtime in [`sched`].
pub mod client;
pub mod error;
pub mod fcall;
pub mod sched;
pub mod serialize;
pub mod srv;
pub mod transport;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
