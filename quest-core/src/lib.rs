#![warn(missing_docs)]
//! Backend-agnostic building blocks of the QueST skill-token policy.
//!
//! This crate has no dependency on a tensor library. It provides
//!
//! * [`record`]: [`Record`](record::Record), a key-value container used for the
//!   information returned by loss computations and optimization steps,
//! * [`error`]: [`QuestError`](error::QuestError), the error taxonomy shared by the
//!   backend crates,
//! * the traits [`Configurable`], [`ChunkPolicy`] and [`Agent`], which describe how a
//!   policy is built, queried for action chunks and trained.
//!
//! The neural networks themselves live in backend crates such as `quest-candle-agent`.
pub mod error;
pub mod record;

mod base;
pub use base::{Agent, ChunkPolicy, Configurable};
