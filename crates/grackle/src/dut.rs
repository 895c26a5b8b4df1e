//! The device under test.
//!
//! Owns one Postgres session, submits each generated statement inside a
//! transaction that is always rolled back, and classifies whatever comes
//! back. A [`FailureKind::Broken`] outcome tears the session down; the next
//! submission reconnects.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tokio_postgres::{Client, NoTls};

use crate::Result;

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^ERROR:  canceling statement due to statement timeout").expect("timeout regex")
});
static SYNTAX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^ERROR:  syntax error at or near").expect("syntax regex"));

const SQLSTATE_QUERY_CANCELED: &str = "57014";
const SQLSTATE_SYNTAX_ERROR: &str = "42601";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Any server-reported failure without a more specific bucket.
    Generic,
    /// The statement exceeded `statement_timeout`.
    Timeout,
    /// The statement was syntactically rejected.
    Syntax,
    /// The session is unusable and must be re-established.
    Broken,
}

/// What the database said when a statement failed.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub sqlstate: Option<String>,
}

impl Failure {
    pub fn broken(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Broken,
            message: message.into(),
            sqlstate: None,
        }
    }

    /// Classify a driver error into a [`Failure`].
    ///
    /// `tokio_postgres` strips the `SEVERITY:  ` prefix that server logs
    /// carry, so the wire format is reconstructed here; the classifier
    /// regexes and known-error files both assume it.
    pub fn from_pg(e: &tokio_postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            let message = format!("{}:  {}", db.severity(), db.message());
            let sqlstate = db.code().code().to_string();
            let kind = if e.is_closed() {
                FailureKind::Broken
            } else {
                classify(&message, Some(&sqlstate))
            };
            Self {
                kind,
                message,
                sqlstate: Some(sqlstate),
            }
        } else {
            // Not a server-reported error: the session is gone.
            Self::broken(e.to_string())
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Route a failure message (and SQLSTATE, when present) to its kind.
pub fn classify(message: &str, sqlstate: Option<&str>) -> FailureKind {
    if TIMEOUT_RE.is_match(message) || sqlstate == Some(SQLSTATE_QUERY_CANCELED) {
        FailureKind::Timeout
    } else if SYNTAX_RE.is_match(message) || sqlstate == Some(SQLSTATE_SYNTAX_ERROR) {
        FailureKind::Syntax
    } else {
        FailureKind::Generic
    }
}

/// A live session with the database under test.
pub struct Dut {
    conninfo: String,
    client: Option<Client>,
}

impl Dut {
    pub async fn connect(conninfo: &str) -> Result<Self> {
        let mut dut = Self {
            conninfo: conninfo.to_string(),
            client: None,
        };
        dut.reconnect().await?;
        Ok(dut)
    }

    /// Re-establish the session and its variables.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.client = None;
        let (client, connection) = tokio_postgres::connect(&self.conninfo, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "dut connection closed");
            }
        });
        client
            .batch_execute(
                "SET statement_timeout = '1s'; \
                 SET client_min_messages = 'ERROR'; \
                 SET application_name = 'grackle::dut'",
            )
            .await?;
        self.client = Some(client);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> std::result::Result<&Client, Failure> {
        if self.client.is_none() {
            self.reconnect()
                .await
                .map_err(|e| Failure::broken(e.to_string()))?;
        }
        match self.client.as_ref() {
            Some(client) => Ok(client),
            None => Err(Failure::broken("not connected")),
        }
    }

    /// Submit one statement. Nothing ever commits: the statement runs
    /// between `BEGIN` and `ROLLBACK`.
    pub async fn test(&mut self, stmt: &str) -> std::result::Result<(), Failure> {
        let client = self.ensure_connected().await?;
        let outcome = async {
            client.batch_execute("BEGIN").await?;
            let run = client.batch_execute(stmt).await;
            // roll back whether the statement succeeded or aborted
            let _ = client.batch_execute("ROLLBACK").await;
            run
        }
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                let failure = Failure::from_pg(&e);
                if failure.kind == FailureKind::Broken {
                    self.client = None;
                }
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_classified_by_message_or_sqlstate() {
        assert_eq!(
            classify(
                "ERROR:  canceling statement due to statement timeout",
                None
            ),
            FailureKind::Timeout
        );
        assert_eq!(
            classify("ERROR:  whatever", Some("57014")),
            FailureKind::Timeout
        );
    }

    #[test]
    fn syntax_is_classified_by_message_or_sqlstate() {
        assert_eq!(
            classify("ERROR:  syntax error at or near \"from\"\nLINE 1: ...", None),
            FailureKind::Syntax
        );
        assert_eq!(
            classify("ERROR:  whatever", Some("42601")),
            FailureKind::Syntax
        );
    }

    #[test]
    fn anything_else_is_generic() {
        assert_eq!(
            classify("ERROR:  division by zero", Some("22012")),
            FailureKind::Generic
        );
        // the regexes are anchored to the start of the message
        assert_eq!(
            classify("NOTE: ERROR:  syntax error at or near", None),
            FailureKind::Generic
        );
    }

    #[test]
    fn broken_failures_carry_no_sqlstate() {
        let failure = Failure::broken("connection reset");
        assert_eq!(failure.kind, FailureKind::Broken);
        assert_eq!(failure.sqlstate, None);
        assert_eq!(failure.to_string(), "connection reset");
    }
}
