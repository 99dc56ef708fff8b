//! Error handling foundation.
//!
//! Each crate defines its own domain error enums next to the code that
//! produces them. Boundaries that cross layers (configuration loading,
//! process startup) carry those errors inside a rootcause [`Report`].

use rootcause::Report;

/// A Result alias whose error is a rootcause report.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
