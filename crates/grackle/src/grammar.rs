//! Random production of typed statement trees.
//!
//! The grammar is deliberately small: a `SELECT` over one relation with a
//! comparison predicate. What matters is that every expression is built
//! *type-directed* - operands are generated for the operator's declared
//! types and unified through the compatibility oracle - and that every
//! construction outcome feeds the impedance store.

use rand::Rng;

use crate::impedance::ImpedanceHandle;
use crate::prod::{Prod, ProdKind, tags};
use crate::schema::{Column, Schema, Table, TypeIdx, random_pick};
use crate::{Error, Result};

/// Attempt budget of the comparison builder.
const MAX_COMPARISON_ATTEMPTS: u32 = 20;

/// What a value expression may refer to.
pub struct Scope<'a> {
    pub schema: &'a Schema,
    pub table: &'a Table,
}

/// Build a full `SELECT` statement over a random relation.
///
/// The predicate is skipped while the comparison production is
/// blacklisted; a statement whose predicate cannot be built at all is a
/// failed production.
pub fn select_stmt<R: Rng + ?Sized>(
    rng: &mut R,
    schema: &Schema,
    imp: &ImpedanceHandle,
) -> Result<Prod> {
    let tables: Vec<&Table> = schema
        .tables
        .iter()
        .filter(|t| !t.columns.is_empty())
        .collect();
    let Some(&table) = random_pick(rng, &tables) else {
        return Err(Error::EmptySchema);
    };
    let scope = Scope { schema, table };

    let mut list = Prod::new(ProdKind::SelectList, 1);
    for _ in 0..rng.random_range(1..=3) {
        let Some(col) = random_pick(rng, &table.columns) else {
            return Err(Error::EmptySchema);
        };
        list.children.push(value_expr(rng, &scope, 2, col.ty)?);
    }

    let from = Prod::new(
        ProdKind::TableRef {
            ident: table.ident(),
        },
        1,
    );

    let mut children = vec![list, from];
    if imp.matched(tags::COMPARISON_OP) {
        match comparison_op(rng, &scope, 1, imp) {
            Ok(cmp) => children.push(cmp),
            Err(e) => {
                imp.fail(tags::SELECT_STMT);
                return Err(e);
            }
        }
    }

    Ok(Prod::with_children(ProdKind::SelectStmt, 0, children))
}

/// Build a boolean comparison `lhs OP rhs` whose operands have mutually
/// consistent types, within the attempt budget.
///
/// Every failed attempt charges a retry against this production; running
/// out of attempts charges `limited` and surfaces a construction failure
/// to the producer.
pub fn comparison_op<R: Rng + ?Sized>(
    rng: &mut R,
    scope: &Scope<'_>,
    level: u32,
    imp: &ImpedanceHandle,
) -> Result<Prod> {
    if scope
        .schema
        .operators_returning(scope.schema.booltype)
        .is_empty()
    {
        return Err(Error::EmptySchema);
    }

    let mut retries = 0;
    for _ in 0..MAX_COMPARISON_ATTEMPTS {
        match comparison_attempt(rng, scope, level) {
            Ok(mut node) => {
                node.retries = retries;
                return Ok(node);
            }
            Err(e @ Error::UnknownTyptype { .. }) => return Err(e),
            Err(_) => {
                retries += 1;
                imp.retry(tags::COMPARISON_OP);
            }
        }
    }

    imp.limit(tags::COMPARISON_OP);
    Err(Error::GenerationLimit(MAX_COMPARISON_ATTEMPTS))
}

fn comparison_attempt<R: Rng + ?Sized>(
    rng: &mut R,
    scope: &Scope<'_>,
    level: u32,
) -> Result<Prod> {
    let schema = scope.schema;
    let ops = schema.operators_returning(schema.booltype);
    let Some(&op_idx) = random_pick(rng, ops) else {
        return Err(Error::EmptySchema);
    };
    let op = schema.operator(op_idx);

    let lhs = value_expr(rng, scope, level + 1, op.left)?;
    let rhs = value_expr(rng, scope, level + 1, op.right)?;

    // Operands of a polymorphic operator (distinct declared types) are
    // accepted as produced; equal declared types must unify.
    let (lhs, rhs) = if op.left == op.right {
        unify(rng, scope, level, lhs, rhs)?
    } else {
        (lhs, rhs)
    };

    Ok(Prod::with_children(
        ProdKind::ComparisonOp {
            oper: op.name.clone(),
        },
        level,
        vec![lhs, rhs],
    ))
}

/// Make both operands the same concrete type, regenerating the side the
/// oracle says can absorb the other.
fn unify<R: Rng + ?Sized>(
    rng: &mut R,
    scope: &Scope<'_>,
    level: u32,
    lhs: Prod,
    rhs: Prod,
) -> Result<(Prod, Prod)> {
    let Some(lt) = lhs.expr_type() else {
        return Err(Error::OperandMismatch);
    };
    let Some(rt) = rhs.expr_type() else {
        return Err(Error::OperandMismatch);
    };
    if lt == rt {
        return Ok((lhs, rhs));
    }

    let (lhs, rhs) = if scope.schema.consistent(lt, rt)? {
        (value_expr(rng, scope, level + 1, rt)?, rhs)
    } else {
        let regenerated = value_expr(rng, scope, level + 1, lt)?;
        (lhs, regenerated)
    };

    if lhs.expr_type() != rhs.expr_type() {
        return Err(Error::OperandMismatch);
    }
    Ok((lhs, rhs))
}

/// Produce a value expression for a target type: usually an in-scope
/// column the oracle accepts, otherwise a literal of the target type.
fn value_expr<R: Rng + ?Sized>(
    rng: &mut R,
    scope: &Scope<'_>,
    level: u32,
    target: TypeIdx,
) -> Result<Prod> {
    let mut candidates: Vec<&Column> = Vec::new();
    for col in &scope.table.columns {
        if scope.schema.consistent(target, col.ty)? {
            candidates.push(col);
        }
    }

    if !candidates.is_empty() && rng.random_range(0..5) > 0 {
        if let Some(col) = random_pick(rng, &candidates) {
            return Ok(column_ref(col, level));
        }
    }
    if let Some(text) = const_text(rng, scope.schema, target) {
        return Ok(Prod::new(ProdKind::ConstExpr { text, ty: target }, level));
    }
    if let Some(col) = random_pick(rng, &candidates) {
        return Ok(column_ref(col, level));
    }
    Err(Error::NoValueExpr(scope.schema.full_name(target)))
}

fn column_ref(col: &Column, level: u32) -> Prod {
    Prod::new(
        ProdKind::ColumnRef {
            column: col.name.clone(),
            ty: col.ty,
        },
        level,
    )
}

/// A literal of the target type, when one can be written down. Pseudo
/// types have no literals; unhandled base types fall back to a typed NULL.
fn const_text<R: Rng + ?Sized>(rng: &mut R, schema: &Schema, target: TypeIdx) -> Option<String> {
    const WORDS: [&str; 4] = ["fuzz", "quux", "pelican", ""];

    let ty = schema.ty(target);
    match ty.name.as_str() {
        "int2" | "int4" | "int8" => Some(rng.random_range(-100i64..=100).to_string()),
        "float4" | "float8" | "numeric" => Some(format!(
            "{}.{}",
            rng.random_range(0..100),
            rng.random_range(0..100)
        )),
        "bool" => Some(if rng.random_bool(0.5) { "true" } else { "false" }.to_string()),
        "text" | "varchar" | "bpchar" | "name" => {
            random_pick(rng, &WORDS).map(|w| format!("'{}'", w))
        }
        _ if ty.typtype == 'b' => Some(format!("CAST(NULL AS {})", schema.full_name(target))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;
    use crate::schema::testutil::{bare_schema, base, pseudo};
    use crate::schema::Operator;

    fn table(columns: Vec<(&str, TypeIdx)>) -> Table {
        Table {
            name: "t".to_string(),
            schema: "public".to_string(),
            insertable: true,
            base_table: true,
            columns: columns
                .into_iter()
                .map(|(name, ty)| Column {
                    name: name.to_string(),
                    ty,
                })
                .collect(),
            constraints: vec![],
        }
    }

    /// bool + int4 + a plain equality operator.
    fn int_schema() -> Schema {
        let mut schema = bare_schema();
        let bool_t = schema.add_type(base("bool", 16, 'B'));
        let int_t = schema.add_type(base("int4", 23, 'N'));
        schema.booltype = bool_t;
        schema.add_operator(Operator {
            name: "=".to_string(),
            left: int_t,
            right: int_t,
            result: bool_t,
        });
        schema.add_table(table(vec![("a", int_t), ("b", int_t)]));
        schema
    }

    #[test]
    fn builds_a_typed_comparison() {
        let schema = int_schema();
        let scope = Scope {
            schema: &schema,
            table: &schema.tables[0],
        };
        let imp = ImpedanceHandle::new();
        let mut rng = SmallRng::seed_from_u64(7);

        let cmp = comparison_op(&mut rng, &scope, 1, &imp).unwrap();
        assert_eq!(cmp.tag(), tags::COMPARISON_OP);
        assert_eq!(cmp.retries, 0);
        assert_eq!(cmp.children.len(), 2);
        assert_eq!(cmp.children[0].expr_type(), cmp.children[1].expr_type());
        assert_eq!(imp.counters(tags::COMPARISON_OP).retries, 0);
    }

    #[test]
    fn exhausts_the_attempt_budget_on_unsatisfiable_operands() {
        let mut schema = bare_schema();
        let bool_t = schema.add_type(base("bool", 16, 'B'));
        let int_t = schema.add_type(base("int4", 23, 'N'));
        let text_t = schema.add_type(base("text", 25, 'S'));
        let anyarray = schema.add_type(pseudo("anyarray", 2277));
        schema.booltype = bool_t;
        // the only bool-returning operator wants arrays, and no array can
        // be produced from this scope
        schema.add_operator(Operator {
            name: "&&".to_string(),
            left: anyarray,
            right: anyarray,
            result: bool_t,
        });
        schema.add_table(table(vec![("a", int_t), ("b", text_t)]));

        let scope = Scope {
            schema: &schema,
            table: &schema.tables[0],
        };
        let imp = ImpedanceHandle::new();
        let mut rng = SmallRng::seed_from_u64(7);

        let err = comparison_op(&mut rng, &scope, 1, &imp).unwrap_err();
        assert!(matches!(err, Error::GenerationLimit(20)));
        assert_eq!(imp.counters(tags::COMPARISON_OP).retries, 20);
        assert_eq!(imp.counters(tags::COMPARISON_OP).limited, 1);
    }

    #[test]
    fn unifies_operands_of_a_pseudo_typed_operator() {
        let mut schema = bare_schema();
        let bool_t = schema.add_type(base("bool", 16, 'B'));
        let int_array = schema.add_type(base("_int4", 1007, 'A'));
        let text_array = schema.add_type(base("_text", 1009, 'A'));
        let anyarray = schema.add_type(pseudo("anyarray", 2277));
        schema.booltype = bool_t;
        schema.add_operator(Operator {
            name: "&&".to_string(),
            left: anyarray,
            right: anyarray,
            result: bool_t,
        });
        schema.add_table(table(vec![("xs", int_array), ("ys", text_array)]));

        let scope = Scope {
            schema: &schema,
            table: &schema.tables[0],
        };
        let imp = ImpedanceHandle::new();
        let mut rng = SmallRng::seed_from_u64(42);

        for _ in 0..32 {
            let cmp = comparison_op(&mut rng, &scope, 1, &imp).unwrap();
            assert_eq!(cmp.children[0].expr_type(), cmp.children[1].expr_type());
        }
    }

    #[test]
    fn select_statement_has_list_from_and_predicate() {
        let schema = int_schema();
        let imp = ImpedanceHandle::new();
        let mut rng = SmallRng::seed_from_u64(99);

        let stmt = select_stmt(&mut rng, &schema, &imp).unwrap();
        assert_eq!(stmt.tag(), tags::SELECT_STMT);
        let text = stmt.to_string();
        assert!(text.starts_with("SELECT "), "{text}");
        assert!(text.contains(" FROM \"t\""), "{text}");
        assert!(text.contains(" WHERE ("), "{text}");
    }

    #[test]
    fn blacklisted_comparison_drops_the_predicate() {
        let schema = int_schema();
        let imp = ImpedanceHandle::new();
        let bare_cmp = Prod::new(
            ProdKind::ComparisonOp {
                oper: "=".to_string(),
            },
            0,
        );
        for _ in 0..100 {
            imp.record_bad(&bare_cmp);
        }
        assert!(!imp.matched(tags::COMPARISON_OP));

        let mut rng = SmallRng::seed_from_u64(99);
        let stmt = select_stmt(&mut rng, &schema, &imp).unwrap();
        assert_eq!(stmt.children.len(), 2);
        assert!(!stmt.to_string().contains("WHERE"));
    }

    #[test]
    fn empty_schema_is_a_hard_error() {
        let schema = bare_schema();
        let imp = ImpedanceHandle::new();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(matches!(
            select_stmt(&mut rng, &schema, &imp),
            Err(Error::EmptySchema)
        ));
    }
}
