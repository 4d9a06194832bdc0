//! # themis-core
//!
//! Shared foundation for the Themis database core: the error model, the
//! tagged value tree, primary keys, order-preserving key encodings,
//! cursor tokens, and deadlines.
//!
//! Every other crate in the workspace depends on this one and nothing
//! here depends on the storage engine, so the types in this crate are
//! safe to use at any layer.

pub mod cursor;
pub mod deadline;
pub mod encoding;
pub mod error;
pub mod key;
pub mod limits;
pub mod types;
pub mod value;

pub use cursor::CursorToken;
pub use deadline::Deadline;
pub use error::{Result, ThemisError};
pub use key::Pk;
pub use types::Direction;
pub use value::Value;
