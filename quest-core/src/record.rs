//! Key-value records of training and evaluation metrics.
//!
//! Loss computations of a policy return a [`Record`] next to the loss tensor.
//! All values are plain numbers or strings, so a training driver can forward them
//! to any logging backend without touching the tensor library.
//!
//! ```rust
//! use quest_core::record::{Record, RecordValue};
//!
//! let mut record = Record::from_scalar("loss", 0.5);
//! record.insert("nll_loss", RecordValue::Scalar(0.5));
//! record.insert("aux_loss_groups", RecordValue::Array1(vec![0.1, 0.2]));
//!
//! assert_eq!(record.get_scalar("loss").unwrap(), 0.5);
//! ```
mod base;

pub use base::{Record, RecordValue};
