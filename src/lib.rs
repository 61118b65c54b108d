#![doc = include_str!("../README.md")]
/*! */
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]
#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

#[cfg(feature = "std")]
#[macro_use]
extern crate std;
#[cfg(feature = "alloc")]
#[macro_use]
extern crate alloc;

/// We need some sort of "[`String`]" for errors in `no_alloc`.
/// We can only support `'static` without an allocator, so let's do that.
#[cfg(not(feature = "alloc"))]
type String = &'static str;

pub mod insn;
pub mod map;
pub mod plan;
pub mod resolve;
pub mod runtime;

pub use insn::*;
pub use map::*;
pub use plan::*;
pub use resolve::*;
pub use runtime::*;

#[cfg(feature = "alloc")]
use alloc::string::String;
use core::fmt::{self, Display};

/// Main error enum of `cmptrace`.
///
/// Only harness-facing setup and extraction APIs are fallible. Contract
/// violations between the decoder and the planner are panics instead:
/// they can never be safely ignored.
#[derive(Debug)]
pub enum Error {
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// You're holding it wrong
    IllegalState(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }

    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }

    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {s}"),
            Self::IllegalState(s) => write!(f, "Illegal state: {s}"),
            Self::Unknown(s) => write!(f, "Unknown error: {s}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
