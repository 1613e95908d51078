//! Stable file handles for NFS-style export.
//!
//! A handle is 3, 5 or 6 words:
//!
//! ```text
//! word  0          1          2            3          4          5
//!       formal hi  formal lo  generation | parent hi  parent lo | parent gen
//!       \______ Minimal _____/            \_ WithParent _______/ \ WithParentGen
//! ```
//!
//! [`filehandle`] is the pure codec. [`resolver`] turns a decoded cookie back
//! into a live object, rejecting handles whose block was freed or reused.

pub mod filehandle;
pub mod resolver;

pub use filehandle::{decode_fh, encode_fh, DecodedHandle, ExportCookie, FileHandle, TokenShape, FH_TYPE_TOO_SMALL};
