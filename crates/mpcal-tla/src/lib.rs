//! # mpcal-tla
//!
//! The TLA+ value algebra consumed and produced by compiled MPCal
//! archetypes. This crate is purely functional: it knows nothing about
//! resources, critical sections, or the network.
//!
//! - [`Value`] is an immutable, hashable, totally ordered TLA+ value.
//! - Operators are checked methods returning [`TypeError`] on misuse;
//!   overflow and division by zero fail rather than wrap.
//! - [`Value::to_bytes`]/[`Value::from_bytes`] implement the canonical
//!   binary encoding used as the wire payload format, with the guarantee
//!   that a round-trip yields a structurally equal value.
//!
//! ## Example
//!
//! ```rust
//! use mpcal_tla::Value;
//!
//! let request = Value::record([
//!     ("from", Value::number(3)),
//!     ("body", Value::string("put")),
//! ]);
//! assert_eq!(request.dot("from").unwrap(), Value::number(3));
//!
//! let bytes = request.to_bytes().unwrap();
//! assert_eq!(Value::from_bytes(&bytes).unwrap(), request);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod codec;
pub mod error;
pub mod value;

pub use codec::CodecError;
pub use error::TypeError;
pub use value::Value;
