//! The relational model loaded from the database catalog.
//!
//! All types live in a flat arena owned by [`Schema`]; tables, operators and
//! routines refer to them through [`TypeIdx`]. Comparing two `TypeIdx`
//! values for equality is the identity comparison the compatibility oracle
//! is built on.

use std::collections::HashMap;

use rand::Rng;

use crate::{Error, Result, quote_ident};

/// Index of a type in [`Schema::types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIdx(pub(crate) usize);

/// One row of `pg_type`, as the generator sees it.
///
/// `name` is stored pre-quoted (`quote_ident`), matching how it is emitted
/// into statements.
#[derive(Debug, Clone)]
pub struct PgType {
    pub name: String,
    pub oid: i64,
    pub typnamespace: i64,
    pub typdelim: char,
    pub typrelid: i64,
    pub typelem: i64,
    pub typarray: i64,
    /// `b`ase, `c`omposite, `d`omain, `r`ange, `e`num or `p`seudo.
    pub typtype: char,
    /// Postgres type category; `A` marks arrays.
    pub typcategory: char,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: TypeIdx,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub schema: String,
    pub insertable: bool,
    pub base_table: bool,
    pub columns: Vec<Column>,
    pub constraints: Vec<String>,
}

impl Table {
    /// The identifier to emit in `FROM` clauses, schema-qualified unless the
    /// table lives in `public`.
    pub fn ident(&self) -> String {
        if self.schema == "public" {
            quote_ident(&self.name)
        } else {
            format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
        }
    }
}

/// A binary operator from `pg_operator`.
#[derive(Debug, Clone)]
pub struct Operator {
    pub name: String,
    pub left: TypeIdx,
    pub right: TypeIdx,
    pub result: TypeIdx,
}

/// A function or aggregate from `pg_proc`.
#[derive(Debug, Clone)]
pub struct Routine {
    pub namespace: String,
    /// The `pg_proc` oid, as text; used to fetch argument types.
    pub specific_name: String,
    pub ret: TypeIdx,
    pub name: String,
    pub argtypes: Vec<TypeIdx>,
}

/// The full schema of the database under test.
#[derive(Debug, Default)]
pub struct Schema {
    pub version: String,
    pub version_num: i64,
    pub types: Vec<PgType>,
    pub tables: Vec<Table>,
    pub operators: Vec<Operator>,
    pub routines: Vec<Routine>,
    pub aggregates: Vec<Routine>,

    /// Well-known types, resolved once after loading.
    pub booltype: TypeIdx,
    pub inttype: TypeIdx,
    pub internaltype: TypeIdx,
    pub arraytype: TypeIdx,

    oid2type: HashMap<i64, TypeIdx>,
    name2type: HashMap<String, TypeIdx>,
    oid2namespace: HashMap<i64, String>,
    public_namespace: i64,
    pg_catalog_namespace: i64,
    ops_by_result: HashMap<TypeIdx, Vec<usize>>,
    supported_features: HashMap<String, bool>,
}

impl Default for TypeIdx {
    fn default() -> Self {
        TypeIdx(0)
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type in the arena, indexing it by oid and name.
    pub fn add_type(&mut self, ty: PgType) -> TypeIdx {
        let idx = TypeIdx(self.types.len());
        self.oid2type.insert(ty.oid, idx);
        self.name2type.insert(ty.name.clone(), idx);
        self.types.push(ty);
        idx
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.push(table);
    }

    /// Register an operator, keeping the by-result index in step.
    pub fn add_operator(&mut self, op: Operator) {
        self.ops_by_result
            .entry(op.result)
            .or_default()
            .push(self.operators.len());
        self.operators.push(op);
    }

    pub fn add_routine(&mut self, routine: Routine) {
        self.routines.push(routine);
    }

    pub fn add_aggregate(&mut self, routine: Routine) {
        self.aggregates.push(routine);
    }

    /// Register a namespace oid, tracking the two distinguished ones.
    pub fn add_namespace(&mut self, oid: i64, name: &str) {
        if name == "public" {
            self.public_namespace = oid;
        } else if name == "pg_catalog" {
            self.pg_catalog_namespace = oid;
        }
        self.oid2namespace.insert(oid, name.to_string());
    }

    pub fn set_feature(&mut self, name: &str, supported: bool) {
        self.supported_features.insert(name.to_string(), supported);
    }

    pub fn support_feature(&self, name: &str) -> bool {
        self.supported_features.get(name).copied().unwrap_or(false)
    }

    pub fn ty(&self, idx: TypeIdx) -> &PgType {
        &self.types[idx.0]
    }

    pub fn type_by_oid(&self, oid: i64) -> Option<TypeIdx> {
        self.oid2type.get(&oid).copied()
    }

    pub fn type_named(&self, name: &str) -> Option<TypeIdx> {
        self.name2type.get(name).copied()
    }

    /// Point a range type at its subtype (loaded separately from
    /// `pg_range`).
    pub fn set_range_subtype(&mut self, range_oid: i64, subtype_oid: i64) {
        if let Some(idx) = self.type_by_oid(range_oid) {
            self.types[idx.0].typelem = subtype_oid;
        }
    }

    /// Resolve the well-known types every generator needs.
    pub fn resolve_well_known(&mut self) -> Result<()> {
        self.booltype = self.require_type("bool")?;
        self.inttype = self.require_type("int4")?;
        self.internaltype = self.require_type("internal")?;
        self.arraytype = self.require_type("anyarray")?;
        Ok(())
    }

    fn require_type(&self, name: &str) -> Result<TypeIdx> {
        self.type_named(name)
            .ok_or_else(|| Error::MissingType(name.to_string()))
    }

    /// Indices into [`Schema::operators`] of every operator returning
    /// `result`.
    pub fn operators_returning(&self, result: TypeIdx) -> &[usize] {
        self.ops_by_result
            .get(&result)
            .map_or(&[], Vec::as_slice)
    }

    pub fn operator(&self, idx: usize) -> &Operator {
        &self.operators[idx]
    }

    /// Can a value of `rhs` stand where `lhs` is declared?
    ///
    /// Concrete types are only consistent with themselves; pseudo types
    /// match by shape. `anyelement` is deliberately never satisfied: the
    /// element/container pairing it implies needs context a single-type
    /// check does not have.
    pub fn consistent(&self, lhs: TypeIdx, rhs: TypeIdx) -> Result<bool> {
        let l = self.ty(lhs);
        let r = self.ty(rhs);
        match l.typtype {
            'b' | 'c' | 'd' | 'r' | 'e' => Ok(lhs == rhs),
            'p' => Ok(match l.name.as_str() {
                "any" => true,
                "anyarray" => r.typcategory == 'A',
                "anynonarray" => r.typcategory != 'A',
                "anyenum" => r.typtype == 'e',
                "anyrange" => r.typtype == 'r',
                "record" => r.typtype == 'c',
                "cstring" => lhs == rhs,
                "anyelement" => false,
                _ => false,
            }),
            other => Err(Error::UnknownTyptype {
                name: l.name.clone(),
                typtype: other,
            }),
        }
    }

    /// The name to emit for a type: bare when it lives in `public` or
    /// `pg_catalog`, schema-qualified otherwise.
    pub fn full_name(&self, idx: TypeIdx) -> String {
        let ty = self.ty(idx);
        if ty.typnamespace == self.public_namespace
            || ty.typnamespace == self.pg_catalog_namespace
        {
            return ty.name.clone();
        }
        let ns = self
            .oid2namespace
            .get(&ty.typnamespace)
            .map(String::as_str)
            .unwrap_or("");
        format!("{}.{}", ns, ty.name)
    }
}

/// Choose uniformly from a slice, `None` when it is empty.
pub fn random_pick<'a, T, R: Rng + ?Sized>(rng: &mut R, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        None
    } else {
        items.get(rng.random_range(0..items.len()))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub const NS_PUBLIC: i64 = 2200;
    pub const NS_CATALOG: i64 = 11;
    pub const NS_OTHER: i64 = 99999;

    /// A schema with namespaces registered and nothing else.
    pub fn bare_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_namespace(NS_PUBLIC, "public");
        schema.add_namespace(NS_CATALOG, "pg_catalog");
        schema.add_namespace(NS_OTHER, "warehouse");
        schema
    }

    pub fn ty(name: &str, oid: i64, typtype: char, typcategory: char) -> PgType {
        PgType {
            name: name.to_string(),
            oid,
            typnamespace: NS_CATALOG,
            typdelim: ',',
            typrelid: 0,
            typelem: 0,
            typarray: 0,
            typtype,
            typcategory,
        }
    }

    pub fn base(name: &str, oid: i64, typcategory: char) -> PgType {
        ty(name, oid, 'b', typcategory)
    }

    pub fn pseudo(name: &str, oid: i64) -> PgType {
        ty(name, oid, 'p', 'P')
    }
}
