#![allow(dead_code)]

use quern::schema::{SrcItem, TableSchema};

/// `t(x INTEGER, y TEXT)` — the workhorse table of the resolver tests.
pub fn table_t() -> TableSchema {
    TableSchema::parse("CREATE TABLE t (x INTEGER, y TEXT)").expect("parse table t")
}

pub fn src_one(schema: TableSchema, cursor: i32) -> Vec<SrcItem> {
    vec![SrcItem::new(schema, cursor)]
}

/// The `x` ambiguity fixture: `t1(x)` and `t2(x)`.
pub fn src_ambiguous() -> Vec<SrcItem> {
    let t1 = TableSchema::parse("CREATE TABLE t1 (x INTEGER)").expect("parse t1");
    let t2 = TableSchema::parse("CREATE TABLE t2 (x INTEGER)").expect("parse t2");
    vec![SrcItem::new(t1, 0), SrcItem::new(t2, 1)]
}
