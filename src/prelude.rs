//! Common imports pulled into every module, the way the teacher crate's
//! `prelude` re-exports `Error`, `Errno`, `Result`, `Vec`, `Arc`, ... so
//! individual modules don't each restate them.

pub use crate::error::{Errno::*, Error, Result};
pub use std::sync::Arc;
pub use std::vec::Vec;

pub(crate) use log::{debug, error, info, trace, warn};
