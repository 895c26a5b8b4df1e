//! Outcome loggers.
//!
//! Every query flows through a chain of loggers: `generated` fires once the
//! tree is complete, then exactly one of `executed`, `error` or
//! `known_error` fires for its outcome. Loggers accumulate; they never
//! decide. Sinks swallow their own I/O failures with a warning so a dying
//! sink cannot stop the generator.

use std::collections::BTreeMap;
use std::io::{self, Write};

use tokio_postgres::{Client, NoTls};

use crate::dut::{Failure, FailureKind};
use crate::impedance::ImpedanceHandle;
use crate::known::{KnownErrors, error_prefix};
use crate::prod::{Prod, ProdVisitor};
use crate::Result;

/// Hooks for query lifecycle events.
pub trait Logger {
    fn generated(&mut self, query: &Prod) {
        let _ = query;
    }

    fn executed(&mut self, query: &Prod) {
        let _ = query;
    }

    fn error(&mut self, query: &Prod, e: &Failure) {
        let _ = (query, e);
    }

    fn known_error(&mut self, query: &Prod, e: &Failure) {
        let _ = (query, e);
    }

    /// Route a failure to [`Logger::known_error`] or [`Logger::error`] by
    /// its 80-character first-line prefix. Returns true when the error was
    /// unknown.
    fn dispatch_error(&mut self, query: &Prod, e: &Failure, known: &KnownErrors) -> bool {
        let is_known = known.contains(error_prefix(&e.message));
        if is_known {
            self.known_error(query, e);
        } else {
            self.error(query, e);
        }
        !is_known
    }
}

/// Running totals over every generated query.
#[derive(Debug, Default, Clone)]
pub struct QueryStats {
    pub queries: u64,
    pub sum_nodes: f64,
    pub sum_height: f64,
    pub sum_retries: f64,
}

impl QueryStats {
    pub fn record(&mut self, query: &Prod) {
        #[derive(Default)]
        struct Walk {
            nodes: u64,
            max_level: u32,
            retries: u64,
        }
        impl ProdVisitor for Walk {
            fn visit(&mut self, prod: &Prod) {
                self.nodes += 1;
                self.max_level = self.max_level.max(prod.level);
                self.retries += prod.retries;
            }
        }

        let mut walk = Walk::default();
        query.accept(&mut walk);

        self.queries += 1;
        self.sum_nodes += walk.nodes as f64;
        self.sum_height += walk.max_level as f64;
        self.sum_retries += walk.retries as f64;
    }

    pub fn avg_nodes(&self) -> f64 {
        self.avg(self.sum_nodes)
    }

    pub fn avg_height(&self) -> f64 {
        self.avg(self.sum_height)
    }

    pub fn avg_retries(&self) -> f64 {
        self.avg(self.sum_retries)
    }

    fn avg(&self, sum: f64) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            sum / self.queries as f64
        }
    }
}

/// The logger that feeds outcomes back into the impedance store.
pub struct ImpedanceFeedback {
    imp: ImpedanceHandle,
}

impl ImpedanceFeedback {
    pub fn new(imp: ImpedanceHandle) -> Self {
        Self { imp }
    }
}

impl Logger for ImpedanceFeedback {
    fn executed(&mut self, query: &Prod) {
        self.imp.record_ok(query);
    }

    fn error(&mut self, query: &Prod, e: &Failure) {
        self.imp.record_bad(query);
        if e.kind == FailureKind::Syntax {
            self.imp.record_syntax_error(query.to_string());
        }
    }

    fn known_error(&mut self, query: &Prod, _e: &Failure) {
        self.imp.record_known(query);
    }
}

/// Column width of the progress protocol.
const PROGRESS_COLUMNS: u64 = 80;
/// A full report is emitted every this many queries.
const REPORT_EVERY: u64 = 10 * PROGRESS_COLUMNS;

/// The stderr progress sink: one character per executed query.
///
/// `.` ok, `t` timeout, `S` syntax error, `C` broken connection, `e` other
/// failure, `K` known error; lines wrap at 80 columns and a full report is
/// emitted every 800 queries.
pub struct ProgressLogger<W: Write> {
    out: W,
    stats: QueryStats,
    errors: BTreeMap<String, u64>,
    imp: ImpedanceHandle,
}

impl ProgressLogger<io::Stderr> {
    pub fn stderr(imp: ImpedanceHandle) -> Self {
        Self::new(io::stderr(), imp)
    }
}

impl<W: Write> ProgressLogger<W> {
    pub fn new(out: W, imp: ImpedanceHandle) -> Self {
        Self {
            out,
            stats: QueryStats::default(),
            errors: BTreeMap::new(),
            imp,
        }
    }

    fn put(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()) {
            tracing::warn!(error = %e, "progress sink write failed");
        }
    }

    fn wrap(&mut self) {
        if self.stats.queries % PROGRESS_COLUMNS == PROGRESS_COLUMNS - 1 {
            self.put("\n");
        }
    }

    /// Emit the full report: query totals, the most frequent error lines,
    /// and the impedance report.
    pub fn report(&mut self) {
        let mut text = format!(
            "\nqueries: {}\nAST stats (avg): height = {} nodes = {}\n",
            self.stats.queries,
            self.stats.avg_height(),
            self.stats.avg_nodes()
        );

        let mut by_count: Vec<(&String, &u64)> = self.errors.iter().collect();
        by_count.sort_by(|a, b| b.1.cmp(a.1));
        let mut err_count = 0;
        for (line, count) in by_count {
            err_count += count;
            let prefix = error_prefix(line);
            text.push_str(&format!("{}\t'{}'\n", count, prefix));
        }
        text.push_str(&format!(
            "error rate: {}\n",
            err_count as f64 / self.stats.queries.max(1) as f64
        ));
        text.push_str(&self.imp.report_string());

        self.put(&text);
    }
}

impl<W: Write> Logger for ProgressLogger<W> {
    fn generated(&mut self, query: &Prod) {
        self.stats.record(query);
        if self.stats.queries % REPORT_EVERY == REPORT_EVERY - 1 {
            self.report();
        }
    }

    fn executed(&mut self, _query: &Prod) {
        self.wrap();
        self.put(".");
    }

    fn error(&mut self, _query: &Prod, e: &Failure) {
        self.wrap();
        let line = e.message.split('\n').next().unwrap_or("").to_string();
        *self.errors.entry(line).or_default() += 1;
        let c = match e.kind {
            FailureKind::Timeout => "t",
            FailureKind::Syntax => "S",
            FailureKind::Broken => "C",
            FailureKind::Generic => "e",
        };
        self.put(c);
    }

    fn known_error(&mut self, _query: &Prod, _e: &Failure) {
        self.wrap();
        self.put("K");
    }
}

/// Logger that dumps every generated query to stdout.
#[derive(Debug, Default)]
pub struct QueryDumper;

impl Logger for QueryDumper {
    fn generated(&mut self, query: &Prod) {
        if let Err(e) = writeln!(io::stdout(), "{};", query) {
            tracing::warn!(error = %e, "query dump failed");
        }
    }
}

/// How often the persistent sink flushes.
const FLUSH_EVERY: u64 = 1000;

/// The persistent sink: one `instance` row per process, one `error` row per
/// unknown failure, and a `stat` row updated every thousand queries with
/// running averages plus the JSON impedance snapshot.
///
/// Events are buffered between flushes; the flush runs in one transaction
/// and is driven by the loop between queries, never from inside a hook.
pub struct PgLogger {
    client: Client,
    id: i64,
    stats: QueryStats,
    pending: Vec<PendingError>,
    imp: ImpedanceHandle,
    flush_due: bool,
}

struct PendingError {
    message: String,
    query: String,
    sqlstate: Option<String>,
}

impl PgLogger {
    /// Connect and register this process in the `instance` table.
    pub async fn connect(
        conninfo: &str,
        target: &str,
        schema_version: &str,
        seed: u64,
        imp: ImpedanceHandle,
    ) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "log connection closed");
            }
        });
        client
            .batch_execute("SET application_name = 'grackle::log'")
            .await?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let row = client
            .query_one(
                "INSERT INTO instance (rev, target, hostname, version, seed) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[
                    &env!("CARGO_PKG_VERSION"),
                    &target,
                    &host,
                    &schema_version,
                    &seed.to_string(),
                ],
            )
            .await?;
        let id: i64 = row.get(0);
        client
            .execute("INSERT INTO stat (id) VALUES ($1)", &[&id])
            .await?;

        Ok(Self {
            client,
            id,
            stats: QueryStats::default(),
            pending: Vec::new(),
            imp,
            flush_due: false,
        })
    }

    /// Flush buffered rows if a flush came due, swallowing sink failures.
    pub async fn flush_if_due(&mut self) {
        if !self.flush_due {
            return;
        }
        self.flush_due = false;
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "statistics flush failed");
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let impedance = self.imp.report_json_string();

        let tx = self.client.transaction().await?;
        for e in &pending {
            tx.execute(
                "INSERT INTO error (id, msg, query, sqlstate) VALUES ($1, $2, $3, $4)",
                &[&self.id, &e.message, &e.query, &e.sqlstate],
            )
            .await?;
        }
        tx.execute(
            "UPDATE stat SET generated = $1, level = $2, nodes = $3, \
             retries = $4, impedance = $5, updated = now() WHERE id = $6",
            &[
                &(self.stats.queries as i64),
                &self.stats.avg_height(),
                &self.stats.avg_nodes(),
                &self.stats.avg_retries(),
                &impedance,
                &self.id,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

impl Logger for PgLogger {
    fn generated(&mut self, query: &Prod) {
        self.stats.record(query);
        if self.stats.queries % FLUSH_EVERY == FLUSH_EVERY - 1 {
            self.flush_due = true;
        }
    }

    fn error(&mut self, query: &Prod, e: &Failure) {
        self.pending.push(PendingError {
            message: e.message.clone(),
            query: query.to_string(),
            sqlstate: e.sqlstate.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prod::{ProdKind, tags};
    use crate::schema::TypeIdx;

    fn query() -> Prod {
        let list = Prod::with_children(
            ProdKind::SelectList,
            1,
            vec![Prod::new(
                ProdKind::ColumnRef {
                    column: "a".to_string(),
                    ty: TypeIdx(0),
                },
                2,
            )],
        );
        let from = Prod::new(
            ProdKind::TableRef {
                ident: "\"t\"".to_string(),
            },
            1,
        );
        let mut cmp = Prod::with_children(
            ProdKind::ComparisonOp {
                oper: "=".to_string(),
            },
            1,
            vec![
                Prod::new(
                    ProdKind::ColumnRef {
                        column: "a".to_string(),
                        ty: TypeIdx(0),
                    },
                    2,
                ),
                Prod::new(
                    ProdKind::ConstExpr {
                        text: "1".to_string(),
                        ty: TypeIdx(0),
                    },
                    2,
                ),
            ],
        );
        cmp.retries = 3;
        Prod::with_children(ProdKind::SelectStmt, 0, vec![list, from, cmp])
    }

    fn failure(kind: FailureKind, message: &str) -> Failure {
        Failure {
            kind,
            message: message.to_string(),
            sqlstate: None,
        }
    }

    #[test]
    fn stats_sum_nodes_height_and_retries() {
        let mut stats = QueryStats::default();
        stats.record(&query());
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.sum_nodes, 7.0);
        assert_eq!(stats.sum_height, 2.0);
        assert_eq!(stats.sum_retries, 3.0);

        stats.record(&Prod::new(ProdKind::SelectStmt, 0));
        assert_eq!(stats.avg_nodes(), 4.0);
        assert_eq!(stats.avg_height(), 1.0);
        assert_eq!(stats.avg_retries(), 1.5);
    }

    #[test]
    fn dispatch_routes_known_errors_aside() {
        let imp = ImpedanceHandle::new();
        let mut feedback = ImpedanceFeedback::new(imp.clone());
        let known = KnownErrors::from_lines(["ERROR:  division by zero"]);
        let q = query();

        let unknown = feedback.dispatch_error(
            &q,
            &failure(
                FailureKind::Generic,
                "ERROR:  division by zero\nCONTEXT: SQL statement",
            ),
            &known,
        );
        assert!(!unknown);
        assert_eq!(imp.counters(tags::COMPARISON_OP).known, 1);
        assert_eq!(imp.counters(tags::COMPARISON_OP).bad, 0);

        let unknown = feedback.dispatch_error(
            &q,
            &failure(FailureKind::Generic, "ERROR:  numeric field overflow"),
            &known,
        );
        assert!(unknown);
        assert_eq!(imp.counters(tags::COMPARISON_OP).known, 1);
        assert_eq!(imp.counters(tags::COMPARISON_OP).bad, 1);
    }

    #[test]
    fn syntax_failures_feed_the_corpus_once() {
        let imp = ImpedanceHandle::new();
        let mut feedback = ImpedanceFeedback::new(imp.clone());
        let q = query();

        let e = failure(FailureKind::Syntax, "ERROR:  syntax error at or near \"=\"");
        feedback.error(&q, &e);
        feedback.error(&q, &e);

        assert_eq!(imp.counters(tags::SELECT_STMT).bad, 2);
        let json = imp.report_json();
        assert_eq!(json["impedance"].as_array().unwrap().len(), 6);
        assert_eq!(
            imp.report_string().lines().last().unwrap(),
            format!("QUERY [0]: {}", q)
        );
    }

    #[test]
    fn progress_chars_follow_the_outcome() {
        let imp = ImpedanceHandle::new();
        let mut progress = ProgressLogger::new(Vec::new(), imp);
        let q = query();

        progress.generated(&q);
        progress.executed(&q);
        progress.error(&q, &failure(FailureKind::Timeout, "ERROR:  canceling"));
        progress.error(&q, &failure(FailureKind::Syntax, "ERROR:  syntax"));
        progress.error(&q, &failure(FailureKind::Broken, "server closed"));
        progress.error(&q, &failure(FailureKind::Generic, "ERROR:  other"));
        progress.known_error(&q, &failure(FailureKind::Generic, "ERROR:  known"));

        assert_eq!(String::from_utf8(progress.out).unwrap(), ".tSCeK");
    }

    #[test]
    fn progress_wraps_at_eighty_columns() {
        let imp = ImpedanceHandle::new();
        let mut progress = ProgressLogger::new(Vec::new(), imp);
        let q = query();

        for _ in 0..80 {
            progress.generated(&q);
            progress.executed(&q);
        }

        let text = String::from_utf8(progress.out).unwrap();
        assert_eq!(text.matches('.').count(), 80);
        assert_eq!(text, format!("{}\n{}", ".".repeat(78), ".."));
    }

    #[test]
    fn progress_report_counts_error_lines() {
        let imp = ImpedanceHandle::new();
        let mut progress = ProgressLogger::new(Vec::new(), imp);
        let q = query();

        progress.generated(&q);
        progress.error(&q, &failure(FailureKind::Generic, "ERROR:  a\ndetail"));
        progress.error(&q, &failure(FailureKind::Generic, "ERROR:  a"));
        progress.error(&q, &failure(FailureKind::Generic, "ERROR:  b"));
        progress.report();

        let text = String::from_utf8(progress.out).unwrap();
        assert!(text.contains("queries: 1"));
        assert!(text.contains("2\t'ERROR:  a'"));
        assert!(text.contains("1\t'ERROR:  b'"));
        assert!(text.contains("error rate: 3"));
        assert!(text.contains("impedance report:"));
    }
}
