//! Impedance accounting.
//!
//! The running record of how well each grammar production matches what the
//! database accepts. Counters are per query, not per node: a production
//! occurring five times in one failed query is charged once.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexSet;
use serde::Serialize;

use crate::prod::{Prod, ProdVisitor, Tag};

/// A production is blacklisted once it has failed this many times...
const BLACKLIST_THRESHOLD: u64 = 100;
/// ...and its failure ratio exceeds this.
const BLACKLIST_ERROR_RATE: f64 = 0.99;

/// Per-production counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub ok: u64,
    pub bad: u64,
    pub known: u64,
    pub retries: u64,
    pub limited: u64,
    pub failed: u64,
}

/// The process-wide accounting store.
#[derive(Debug, Default)]
pub struct Impedance {
    counters: BTreeMap<Tag, Counters>,
    syntax_errors: IndexSet<String>,
}

impl Impedance {
    /// Charge every production variant occurring in a successful query.
    pub fn record_ok(&mut self, query: &Prod) {
        for tag in distinct_tags(query) {
            self.counters.entry(tag).or_default().ok += 1;
        }
    }

    /// Charge every production variant occurring in a failed query.
    pub fn record_bad(&mut self, query: &Prod) {
        for tag in distinct_tags(query) {
            self.counters.entry(tag).or_default().bad += 1;
        }
    }

    /// Charge every production variant occurring in a query whose failure
    /// is in the known-error set.
    pub fn record_known(&mut self, query: &Prod) {
        for tag in distinct_tags(query) {
            self.counters.entry(tag).or_default().known += 1;
        }
    }

    /// Remember the text of a query the server rejected as unparseable.
    pub fn record_syntax_error(&mut self, text: String) {
        self.syntax_errors.insert(text);
    }

    pub fn retry(&mut self, tag: Tag) {
        self.counters.entry(tag).or_default().retries += 1;
    }

    pub fn limit(&mut self, tag: Tag) {
        self.counters.entry(tag).or_default().limited += 1;
    }

    pub fn fail(&mut self, tag: Tag) {
        self.counters.entry(tag).or_default().failed += 1;
    }

    /// The blacklist predicate: may this production still be produced?
    ///
    /// Stays true until the variant has both enough failures to judge and
    /// an overwhelming failure ratio. Reads never create entries.
    pub fn matched(&self, tag: Tag) -> bool {
        let Some(c) = self.counters.get(tag) else {
            return true;
        };
        if c.bad < BLACKLIST_THRESHOLD {
            return true;
        }
        let error_rate = c.bad as f64 / (c.bad + c.ok) as f64;
        error_rate <= BLACKLIST_ERROR_RATE
    }

    /// A copy of the counters for one variant (zeroes when unseen).
    pub fn counters(&self, tag: Tag) -> Counters {
        self.counters.get(tag).copied().unwrap_or_default()
    }

    pub fn syntax_error_count(&self) -> usize {
        self.syntax_errors.len()
    }

    /// The human-readable report: one line per variant that has failed,
    /// then the syntax-error corpus.
    pub fn report(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "impedance report:")?;
        for (tag, c) in self.counters.iter().filter(|(_, c)| c.bad > 0) {
            write!(out, "  {}: {}/{}/{} (bad/known/ok)", tag, c.bad, c.known, c.ok)?;
            if !self.matched(tag) {
                write!(out, " -> BLACKLISTED")?;
            }
            writeln!(out)?;
        }
        writeln!(
            out,
            "query with bad syntax: count={}",
            self.syntax_errors.len()
        )?;
        for (index, query) in self.syntax_errors.iter().enumerate() {
            writeln!(out, "QUERY [{}]: {}", index, query)?;
        }
        Ok(())
    }

    /// The structured snapshot as a JSON string: one element per variant
    /// that has failed, in tag order.
    pub fn report_json_string(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// The structured snapshot as a JSON value.
    pub fn report_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }

    fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            impedance: self
                .counters
                .iter()
                .filter(|(_, c)| c.bad > 0)
                .map(|(tag, c)| Entry {
                    prod: tag,
                    bad: c.bad,
                    ok: c.ok,
                    limited: c.limited,
                    failed: c.failed,
                    retries: c.retries,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct Snapshot<'a> {
    impedance: Vec<Entry<'a>>,
}

#[derive(Serialize)]
struct Entry<'a> {
    prod: &'a str,
    bad: u64,
    ok: u64,
    limited: u64,
    failed: u64,
    retries: u64,
}

/// The distinct set of variant tags in a tree.
fn distinct_tags(query: &Prod) -> BTreeSet<Tag> {
    struct Collect(BTreeSet<Tag>);
    impl ProdVisitor for Collect {
        fn visit(&mut self, prod: &Prod) {
            self.0.insert(prod.tag());
        }
    }

    let mut collect = Collect(BTreeSet::new());
    query.accept(&mut collect);
    collect.0
}

/// Shared handle to the store, passed through the logger chain and into the
/// generator. The process is single-threaded; the mutex only disciplines
/// the one-writer-per-hook rule.
#[derive(Debug, Default, Clone)]
pub struct ImpedanceHandle {
    inner: Arc<Mutex<Impedance>>,
}

impl ImpedanceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Impedance) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn record_ok(&self, query: &Prod) {
        self.with(|imp| imp.record_ok(query));
    }

    pub fn record_bad(&self, query: &Prod) {
        self.with(|imp| imp.record_bad(query));
    }

    pub fn record_known(&self, query: &Prod) {
        self.with(|imp| imp.record_known(query));
    }

    pub fn record_syntax_error(&self, text: String) {
        self.with(|imp| imp.record_syntax_error(text));
    }

    pub fn retry(&self, tag: Tag) {
        self.with(|imp| imp.retry(tag));
    }

    pub fn limit(&self, tag: Tag) {
        self.with(|imp| imp.limit(tag));
    }

    pub fn fail(&self, tag: Tag) {
        self.with(|imp| imp.fail(tag));
    }

    pub fn matched(&self, tag: Tag) -> bool {
        self.with(|imp| imp.matched(tag))
    }

    pub fn counters(&self, tag: Tag) -> Counters {
        self.with(|imp| imp.counters(tag))
    }

    /// Render the human-readable report to a string.
    pub fn report_string(&self) -> String {
        self.with(|imp| {
            let mut buf = Vec::new();
            // writing to a Vec cannot fail
            let _ = imp.report(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    }

    pub fn report_json(&self) -> serde_json::Value {
        self.with(|imp| imp.report_json())
    }

    pub fn report_json_string(&self) -> String {
        self.with(|imp| imp.report_json_string())
    }
}
