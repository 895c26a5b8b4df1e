//! Grammar-driven random query fuzzer for PostgreSQL.
//!
//! `grackle` introspects a live database's catalogs, generates type-correct
//! SQL statements by random production, submits them to the database under
//! test, and feeds every outcome back into a per-production accounting
//! store - the *impedance* between what the grammar can say and what the
//! server accepts. Productions that fail overwhelmingly get blacklisted;
//! everything else keeps getting tried.
//!
//! The pieces, in data-flow order:
//!
//! - [`schema`] / `introspect` - the relational model and the catalog
//!   loader that fills it.
//! - [`grammar`] - random production of typed statement trees ([`prod`]).
//! - [`dut`] - the session that submits statements and classifies what
//!   comes back.
//! - [`log`] - the logger chain fanning out query lifecycle events.
//! - [`impedance`] - the per-production counters, blacklist predicate and
//!   reports.
//! - [`known`] - the set of pre-registered error prefixes that are never
//!   held against a production.

pub mod dut;
mod error;
pub mod grammar;
pub mod impedance;
mod introspect;
pub mod known;
pub mod log;
pub mod prod;
pub mod schema;

pub use dut::{Dut, Failure, FailureKind};
pub use error::Error;
pub use impedance::{Counters, Impedance, ImpedanceHandle};
pub use known::KnownErrors;
pub use log::{ImpedanceFeedback, Logger, PgLogger, ProgressLogger, QueryDumper, QueryStats};
pub use prod::{Prod, ProdKind, ProdVisitor, Tag};
pub use schema::{Column, Operator, PgType, Routine, Schema, Table, TypeIdx, random_pick};

/// Result type for grackle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Quote a PostgreSQL identifier.
///
/// Always quotes to avoid issues with reserved keywords like `user`,
/// `order`, `table`, `group`, etc. Doubles any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
