//! Production trees.
//!
//! A [`Prod`] is one node of a generated SQL statement. Every node carries
//! its depth, the number of attempts it took to build, and an ordered list
//! of child productions. Rendering a tree with [`std::fmt::Display`] yields
//! the statement text submitted to the database.

use std::fmt;

use crate::quote_ident;
use crate::schema::TypeIdx;

/// Stable identifier for a production variant.
///
/// Tags key every impedance counter, so they must be unique per variant and
/// stable for the life of the process. They are also the names shown in
/// reports.
pub type Tag = &'static str;

/// Tag constants, one per [`ProdKind`] variant.
pub mod tags {
    use super::Tag;

    pub const SELECT_STMT: Tag = "select_stmt";
    pub const SELECT_LIST: Tag = "select_list";
    pub const TABLE_REF: Tag = "table_ref";
    pub const COMPARISON_OP: Tag = "comparison_op";
    pub const COLUMN_REF: Tag = "column_ref";
    pub const CONST_EXPR: Tag = "const_expr";
}

/// The variant of a production node, with its per-variant payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ProdKind {
    /// A full `SELECT` statement. Children: select list, table reference,
    /// and optionally a `WHERE` predicate.
    SelectStmt,
    /// The projected expressions of a `SELECT`.
    SelectList,
    /// A `FROM` item. The identifier is already schema-qualified and quoted.
    TableRef { ident: String },
    /// A binary comparison `lhs OP rhs`. Children: the two operands.
    ComparisonOp { oper: String },
    /// A reference to an in-scope column.
    ColumnRef { column: String, ty: TypeIdx },
    /// A literal (or typed `NULL` cast), rendered verbatim.
    ConstExpr { text: String, ty: TypeIdx },
}

impl ProdKind {
    /// The statistics key for this variant.
    pub fn tag(&self) -> Tag {
        match self {
            ProdKind::SelectStmt => tags::SELECT_STMT,
            ProdKind::SelectList => tags::SELECT_LIST,
            ProdKind::TableRef { .. } => tags::TABLE_REF,
            ProdKind::ComparisonOp { .. } => tags::COMPARISON_OP,
            ProdKind::ColumnRef { .. } => tags::COLUMN_REF,
            ProdKind::ConstExpr { .. } => tags::CONST_EXPR,
        }
    }
}

/// A node in a generated statement tree.
///
/// Trees are exclusively owned by their producer; visitors only borrow.
#[derive(Debug, Clone, PartialEq)]
pub struct Prod {
    pub kind: ProdKind,
    /// Depth from the statement root (the root is level 0).
    pub level: u32,
    /// How many attempts it took to build this node.
    pub retries: u64,
    pub children: Vec<Prod>,
}

impl Prod {
    pub fn new(kind: ProdKind, level: u32) -> Self {
        Self {
            kind,
            level,
            retries: 0,
            children: Vec::new(),
        }
    }

    pub fn with_children(kind: ProdKind, level: u32, children: Vec<Prod>) -> Self {
        Self {
            kind,
            level,
            retries: 0,
            children,
        }
    }

    /// The statistics key for this node's variant.
    pub fn tag(&self) -> Tag {
        self.kind.tag()
    }

    /// The type a value expression produces, if this node is one.
    pub fn expr_type(&self) -> Option<TypeIdx> {
        match self.kind {
            ProdKind::ColumnRef { ty, .. } | ProdKind::ConstExpr { ty, .. } => Some(ty),
            _ => None,
        }
    }

    /// Walk the tree in pre-order, visiting each node before its children.
    pub fn accept(&self, visitor: &mut dyn ProdVisitor) {
        visitor.visit(self);
        for child in &self.children {
            child.accept(visitor);
        }
    }
}

/// Borrowing visitor over a production tree.
pub trait ProdVisitor {
    fn visit(&mut self, prod: &Prod);
}

impl fmt::Display for Prod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProdKind::SelectStmt => {
                let mut children = self.children.iter();
                let list = children.next();
                let from = children.next();
                let predicate = children.next();
                match (list, from) {
                    (Some(list), Some(from)) => {
                        write!(f, "SELECT {} FROM {}", list, from)?;
                        if let Some(predicate) = predicate {
                            write!(f, " WHERE {}", predicate)?;
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            ProdKind::SelectList => {
                for (i, child) in self.children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child)?;
                }
                Ok(())
            }
            ProdKind::TableRef { ident } => write!(f, "{}", ident),
            ProdKind::ComparisonOp { oper } => {
                let mut children = self.children.iter();
                match (children.next(), children.next()) {
                    (Some(lhs), Some(rhs)) => write!(f, "({} {} {})", lhs, oper, rhs),
                    _ => Ok(()),
                }
            }
            ProdKind::ColumnRef { column, .. } => write!(f, "{}", quote_ident(column)),
            ProdKind::ConstExpr { text, .. } => write!(f, "{}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, level: u32) -> Prod {
        Prod::new(
            ProdKind::ColumnRef {
                column: name.to_string(),
                ty: TypeIdx(0),
            },
            level,
        )
    }

    fn sample_select() -> Prod {
        let list = Prod::with_children(ProdKind::SelectList, 1, vec![column("a", 2)]);
        let from = Prod::new(
            ProdKind::TableRef {
                ident: "\"t\"".to_string(),
            },
            1,
        );
        let cmp = Prod::with_children(
            ProdKind::ComparisonOp {
                oper: "=".to_string(),
            },
            1,
            vec![
                column("a", 2),
                Prod::new(
                    ProdKind::ConstExpr {
                        text: "42".to_string(),
                        ty: TypeIdx(0),
                    },
                    2,
                ),
            ],
        );
        Prod::with_children(ProdKind::SelectStmt, 0, vec![list, from, cmp])
    }

    #[test]
    fn renders_select_statement() {
        assert_eq!(
            sample_select().to_string(),
            r#"SELECT "a" FROM "t" WHERE ("a" = 42)"#
        );
    }

    #[test]
    fn renders_without_predicate() {
        let mut stmt = sample_select();
        stmt.children.truncate(2);
        assert_eq!(stmt.to_string(), r#"SELECT "a" FROM "t""#);
    }

    #[test]
    fn accept_visits_nodes_before_children() {
        struct Collect(Vec<Tag>);
        impl ProdVisitor for Collect {
            fn visit(&mut self, prod: &Prod) {
                self.0.push(prod.tag());
            }
        }

        let mut v = Collect(Vec::new());
        sample_select().accept(&mut v);
        assert_eq!(
            v.0,
            vec![
                tags::SELECT_STMT,
                tags::SELECT_LIST,
                tags::COLUMN_REF,
                tags::TABLE_REF,
                tags::COMPARISON_OP,
                tags::COLUMN_REF,
                tags::CONST_EXPR,
            ]
        );
    }

    #[test]
    fn tags_are_unique_per_variant() {
        let kinds = [
            ProdKind::SelectStmt,
            ProdKind::SelectList,
            ProdKind::TableRef {
                ident: String::new(),
            },
            ProdKind::ComparisonOp {
                oper: String::new(),
            },
            ProdKind::ColumnRef {
                column: String::new(),
                ty: TypeIdx(0),
            },
            ProdKind::ConstExpr {
                text: String::new(),
                ty: TypeIdx(0),
            },
        ];
        let tags: std::collections::BTreeSet<Tag> = kinds.iter().map(|k| k.tag()).collect();
        assert_eq!(tags.len(), kinds.len());
    }
}
