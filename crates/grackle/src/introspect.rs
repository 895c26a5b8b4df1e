//! Catalog introspection - read the schema from a live Postgres database.
//!
//! This queries `pg_catalog` (and `information_schema` for relations) to
//! build a [`Schema`] from the current state of a database. The schema is
//! loaded once at startup and immutable afterwards.

use tokio_postgres::{Client, NoTls};

use crate::schema::{Column, Operator, PgType, Routine, Schema, Table, TypeIdx};
use crate::Result;

impl Schema {
    /// Connect with its own session and introspect in one call.
    pub async fn load(conninfo: &str, no_catalog: bool) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "schema connection closed");
            }
        });
        client
            .batch_execute("SET application_name = 'grackle::schema'")
            .await?;
        Self::from_database(&client, no_catalog).await
    }

    /// Introspect a live database and build a [`Schema`] from it.
    ///
    /// With `no_catalog`, relations in schemas starting with `pg_catalog`
    /// or `information_schema` are left out; the type, operator and
    /// routine catalogs are always loaded in full.
    pub async fn from_database(client: &Client, no_catalog: bool) -> Result<Self> {
        let mut schema = Schema::new();

        let row = client.query_one("SELECT version()", &[]).await?;
        schema.version = row.get(0);
        let row = client
            .query_one("SELECT current_setting('server_version_num')::bigint", &[])
            .await?;
        schema.version_num = row.get(0);

        schema.set_feature("tablesample", schema.version_num >= 90500);
        schema.set_feature("merge_into", false);

        // postgresql 11 replaced proisagg/proiswindow with prokind
        let (is_aggregate, is_window) = if schema.version_num < 110_000 {
            ("proisagg", "proiswindow")
        } else {
            ("prokind = 'a'", "prokind = 'w'")
        };

        load_namespaces(client, &mut schema).await?;
        load_types(client, &mut schema).await?;
        load_range_subtypes(client, &mut schema).await?;
        load_tables(client, &mut schema, no_catalog).await?;
        load_columns_and_constraints(client, &mut schema).await?;
        load_operators(client, &mut schema).await?;
        load_routines(client, &mut schema, is_aggregate, is_window).await?;
        load_aggregates(client, &mut schema, is_aggregate, is_window).await?;

        schema.resolve_well_known()?;
        tracing::info!(
            types = schema.types.len(),
            tables = schema.tables.len(),
            operators = schema.operators.len(),
            routines = schema.routines.len(),
            aggregates = schema.aggregates.len(),
            "schema loaded"
        );
        Ok(schema)
    }
}

async fn load_namespaces(client: &Client, schema: &mut Schema) -> Result<()> {
    tracing::info!("loading namespaces");
    let rows = client
        .query("SELECT oid::bigint, nspname::text FROM pg_namespace", &[])
        .await?;
    for row in rows {
        let oid: i64 = row.get(0);
        let name: String = row.get(1);
        schema.add_namespace(oid, &name);
    }
    Ok(())
}

async fn load_types(client: &Client, schema: &mut Schema) -> Result<()> {
    tracing::info!("loading types");
    let rows = client
        .query(
            "SELECT quote_ident(typname)::text, oid::bigint, typdelim::text, \
             typrelid::bigint, typelem::bigint, typarray::bigint, typtype::text, \
             typcategory::text, typnamespace::bigint \
             FROM pg_type",
            &[],
        )
        .await?;
    for row in rows {
        let name: String = row.get(0);
        if name == "unknown" {
            continue;
        }
        let typdelim: String = row.get(2);
        let typtype: String = row.get(6);
        let typcategory: String = row.get(7);
        schema.add_type(PgType {
            name,
            oid: row.get(1),
            typnamespace: row.get(8),
            typdelim: first_char(&typdelim),
            typrelid: row.get(3),
            typelem: row.get(4),
            typarray: row.get(5),
            typtype: first_char(&typtype),
            typcategory: first_char(&typcategory),
        });
    }
    Ok(())
}

async fn load_range_subtypes(client: &Client, schema: &mut Schema) -> Result<()> {
    tracing::info!("loading range types");
    let rows = client
        .query(
            "SELECT tp.oid::bigint, r.rngsubtype::bigint \
             FROM pg_type AS tp LEFT JOIN pg_range AS r ON tp.oid = r.rngtypid \
             WHERE tp.typtype = 'r'",
            &[],
        )
        .await?;
    for row in rows {
        let range_oid: i64 = row.get(0);
        let subtype: Option<i64> = row.get(1);
        if let Some(subtype) = subtype {
            schema.set_range_subtype(range_oid, subtype);
        }
    }
    Ok(())
}

async fn load_tables(client: &Client, schema: &mut Schema, no_catalog: bool) -> Result<()> {
    tracing::info!("loading tables");
    let rows = client
        .query(
            "SELECT table_name::text, table_schema::text, is_insertable_into::text, \
             table_type::text \
             FROM information_schema.tables",
            &[],
        )
        .await?;
    for row in rows {
        let name: String = row.get(0);
        let table_schema: String = row.get(1);
        let insertable: String = row.get(2);
        let table_type: String = row.get(3);

        if no_catalog
            && (table_schema.starts_with("pg_catalog")
                || table_schema.starts_with("information_schema"))
        {
            continue;
        }

        schema.add_table(Table {
            name,
            schema: table_schema,
            insertable: insertable == "YES",
            base_table: table_type == "BASE TABLE",
            columns: Vec::new(),
            constraints: Vec::new(),
        });
    }
    Ok(())
}

async fn load_columns_and_constraints(client: &Client, schema: &mut Schema) -> Result<()> {
    tracing::info!("loading columns and constraints");
    for i in 0..schema.tables.len() {
        let (table_name, table_schema) = {
            let t = &schema.tables[i];
            (t.name.clone(), t.schema.clone())
        };

        let rows = client
            .query(
                "SELECT attname::text, atttypid::bigint \
                 FROM pg_attribute \
                 JOIN pg_class c ON (c.oid = attrelid) \
                 JOIN pg_namespace n ON (n.oid = relnamespace) \
                 WHERE NOT attisdropped AND attnum > 0 \
                 AND relname = $1 AND nspname = $2",
                &[&table_name, &table_schema],
            )
            .await?;
        for row in rows {
            let name: String = row.get(0);
            let type_oid: i64 = row.get(1);
            match schema.type_by_oid(type_oid) {
                Some(ty) => schema.tables[i].columns.push(Column { name, ty }),
                None => tracing::warn!(
                    table = %table_name,
                    column = %name,
                    type_oid,
                    "column type not loaded, skipping column"
                ),
            }
        }

        let rows = client
            .query(
                "SELECT conname::text FROM pg_class t \
                 JOIN pg_constraint c ON (t.oid = c.conrelid) \
                 WHERE contype IN ('f', 'u', 'p') \
                 AND relnamespace = (SELECT oid FROM pg_namespace WHERE nspname = $2) \
                 AND relname = $1",
                &[&table_name, &table_schema],
            )
            .await?;
        for row in rows {
            schema.tables[i].constraints.push(row.get(0));
        }
    }
    Ok(())
}

async fn load_operators(client: &Client, schema: &mut Schema) -> Result<()> {
    tracing::info!("loading operators");
    let rows = client
        .query(
            "SELECT oprname::text, oprleft::bigint, oprright::bigint, oprresult::bigint \
             FROM pg_catalog.pg_operator \
             WHERE 0 NOT IN (oprresult, oprright, oprleft)",
            &[],
        )
        .await?;
    for row in rows {
        let name: String = row.get(0);
        let left = schema.type_by_oid(row.get(1));
        let right = schema.type_by_oid(row.get(2));
        let result = schema.type_by_oid(row.get(3));
        match (left, right, result) {
            (Some(left), Some(right), Some(result)) => schema.add_operator(Operator {
                name,
                left,
                right,
                result,
            }),
            _ => tracing::warn!(operator = %name, "operand type not loaded, skipping operator"),
        }
    }
    Ok(())
}

async fn load_routines(
    client: &Client,
    schema: &mut Schema,
    is_aggregate: &str,
    is_window: &str,
) -> Result<()> {
    tracing::info!("loading routines");
    let query = format!(
        "SELECT (SELECT nspname FROM pg_namespace WHERE oid = pronamespace)::text, \
         oid::text, prorettype::bigint, proname::text \
         FROM pg_proc \
         WHERE prorettype::regtype::text NOT IN \
         ('event_trigger', 'trigger', 'opaque', 'internal') \
         AND proname <> 'pg_event_trigger_table_rewrite_reason' \
         AND proname <> 'pg_event_trigger_table_rewrite_oid' \
         AND proname !~ '^ri_fkey_' \
         AND proname !~ '^unknown' \
         AND NOT (proretset OR {is_aggregate} OR {is_window})"
    );
    let rows = client.query(&query, &[]).await?;
    for row in rows {
        let name: String = row.get(3);
        let Some(ret) = schema.type_by_oid(row.get(2)) else {
            tracing::warn!(routine = %name, "return type not loaded, skipping routine");
            continue;
        };
        schema.add_routine(Routine {
            namespace: row.get(0),
            specific_name: row.get(1),
            ret,
            name,
            argtypes: Vec::new(),
        });
    }

    tracing::info!("loading routine parameters");
    for i in 0..schema.routines.len() {
        let specific_name = schema.routines[i].specific_name.clone();
        let argtypes = load_argtypes(client, schema, &specific_name).await?;
        schema.routines[i].argtypes = argtypes;
    }
    Ok(())
}

async fn load_aggregates(
    client: &Client,
    schema: &mut Schema,
    is_aggregate: &str,
    is_window: &str,
) -> Result<()> {
    tracing::info!("loading aggregates");
    let query = format!(
        "SELECT (SELECT nspname FROM pg_namespace WHERE oid = pronamespace)::text, \
         oid::text, prorettype::bigint, proname::text \
         FROM pg_proc \
         WHERE prorettype::regtype::text NOT IN \
         ('event_trigger', 'trigger', 'opaque', 'internal') \
         AND proname NOT IN ('pg_event_trigger_table_rewrite_reason') \
         AND proname NOT IN ('percentile_cont', 'dense_rank', 'cume_dist', \
         'rank', 'test_rank', 'percent_rank', 'percentile_disc', 'mode', \
         'test_percentile_disc') \
         AND proname !~ '^ri_fkey_' \
         AND NOT (proretset OR {is_window}) \
         AND {is_aggregate}"
    );
    let rows = client.query(&query, &[]).await?;
    for row in rows {
        let name: String = row.get(3);
        let Some(ret) = schema.type_by_oid(row.get(2)) else {
            tracing::warn!(aggregate = %name, "return type not loaded, skipping aggregate");
            continue;
        };
        schema.add_aggregate(Routine {
            namespace: row.get(0),
            specific_name: row.get(1),
            ret,
            name,
            argtypes: Vec::new(),
        });
    }

    tracing::info!("loading aggregate parameters");
    for i in 0..schema.aggregates.len() {
        let specific_name = schema.aggregates[i].specific_name.clone();
        let argtypes = load_argtypes(client, schema, &specific_name).await?;
        schema.aggregates[i].argtypes = argtypes;
    }
    Ok(())
}

/// Argument types of one `pg_proc` row, identified by its oid rendered as
/// text.
async fn load_argtypes(
    client: &Client,
    schema: &Schema,
    specific_name: &str,
) -> Result<Vec<TypeIdx>> {
    let rows = client
        .query(
            "SELECT unnest(proargtypes)::bigint FROM pg_proc WHERE oid::text = $1",
            &[&specific_name],
        )
        .await?;
    let mut argtypes = Vec::with_capacity(rows.len());
    for row in rows {
        let oid: i64 = row.get(0);
        match schema.type_by_oid(oid) {
            Some(ty) => argtypes.push(ty),
            None => tracing::warn!(specific_name, oid, "argument type not loaded"),
        }
    }
    Ok(argtypes)
}

fn first_char(s: &str) -> char {
    s.chars().next().unwrap_or('\0')
}
