mod util;

use quern::expr::{BinOp, ExprKind, InSet};
use quern::func::FuncRegistry;
use quern::parse::{ParseCtx, SubqueryDest};
use quern::resolve::expr_affinity;
use quern::schema::{Affinity, SrcItem, TableSchema};
use quern::sql::parse_expr_text;
use util::{src_ambiguous, src_one, table_t};

#[test]
fn column_resolution_binds_cursor_column_and_affinity() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = vec![SrcItem::new(table_t(), 0).with_alias("A")];
    let expr = parse_expr_text(&mut ctx, "x + 1").expect("parse");

    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);

    let x = ctx.pool.node(expr).left.expect("lhs");
    match &ctx.pool.node(x).kind {
        ExprKind::Column(col) => {
            assert_eq!(col.cursor, 0);
            assert_eq!(col.column, 0);
            assert_eq!(col.affinity, Affinity::Numeric);
        }
        other => panic!("x resolved to {other:?}"),
    }
    assert_eq!(expr_affinity(&ctx.pool, expr), Affinity::Numeric);
}

#[test]
fn alias_resolves_table_name_and_shadows_schema_name() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = vec![SrcItem::new(table_t(), 3).with_alias("A")];

    let via_alias = parse_expr_text(&mut ctx, "A.y").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, via_alias), 0);
    match &ctx.pool.node(via_alias).kind {
        ExprKind::Column(col) => {
            assert_eq!(col.cursor, 3);
            assert_eq!(col.column, 1);
            assert_eq!(col.affinity, Affinity::Text);
        }
        other => panic!("A.y resolved to {other:?}"),
    }

    // The schema name is hidden by the alias.
    let via_schema = parse_expr_text(&mut ctx, "t.y").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, via_schema), 1);
    assert_eq!(ctx.error_message(), Some("no such column: t.y"));
}

#[test]
fn where_clause_alias_rewrites_to_a_copy() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);

    // Result list: x + 1 AS k.
    let aliased = parse_expr_text(&mut ctx, "x + 1").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, aliased), 0);
    let mut result = quern::ExprList::new();
    ctx.pool.list_append(&mut result, aliased, Some("k"));

    // WHERE position: k < 10.
    let where_expr = parse_expr_text(&mut ctx, "k < 10").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, Some(&result), where_expr), 0);

    let k = ctx.pool.node(where_expr).left.expect("lhs");
    match ctx.pool.node(k).kind {
        ExprKind::Alias { column } => assert_eq!(column, 0),
        ref other => panic!("k resolved to {other:?}"),
    }
    let copy = ctx.pool.node(k).left.expect("alias copy");
    assert!(ctx.pool.exprs_equal(copy, aliased));
    assert!(matches!(ctx.pool.node(copy).kind, ExprKind::Binary(BinOp::Add)));
}

#[test]
fn ambiguous_name_reports_and_leaves_node_unchanged() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let expr = parse_expr_text(&mut ctx, "x").expect("parse");

    assert_eq!(ctx.resolve_ids(&src_ambiguous(), None, expr), 1);
    assert_eq!(ctx.error_message(), Some("ambiguous column name: x"));
    assert!(matches!(ctx.pool.node(expr).kind, ExprKind::Id));
}

#[test]
fn unknown_name_reports_with_qualified_text() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "t.nope").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 1);
    assert_eq!(ctx.error_message(), Some("no such column: t.nope"));
}

#[test]
fn rowid_binds_to_column_minus_one() {
    let registry = FuncRegistry::with_builtins();
    for name in ["rowid", "_ROWID_", "oid"] {
        let mut ctx = ParseCtx::new("", &registry);
        let src = src_one(table_t(), 2);
        let expr = parse_expr_text(&mut ctx, name).expect("parse");
        assert_eq!(ctx.resolve_ids(&src, None, expr), 0, "resolving {name}");
        match &ctx.pool.node(expr).kind {
            ExprKind::Column(col) => {
                assert_eq!(col.cursor, 2);
                assert_eq!(col.column, -1);
                assert_eq!(col.affinity, Affinity::Numeric);
            }
            other => panic!("{name} resolved to {other:?}"),
        }
    }
}

#[test]
fn trigger_new_and_old_pseudo_tables_resolve() {
    use quern::parse::TriggerScope;

    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let ignore = ctx.program.make_label();
    ctx.enter_trigger(TriggerScope {
        new_cursor: Some(7),
        old_cursor: None,
        table: table_t(),
        ignore_label: ignore,
    });

    let src: Vec<SrcItem> = Vec::new();
    let expr = parse_expr_text(&mut ctx, "new.x + 1").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    let x = ctx.pool.node(expr).left.expect("lhs");
    match &ctx.pool.node(x).kind {
        ExprKind::Column(col) => {
            assert_eq!(col.cursor, 7);
            assert_eq!(col.column, 0);
            assert_eq!(col.affinity, Affinity::Numeric);
        }
        other => panic!("new.x resolved to {other:?}"),
    }

    // No OLD row is pinned in this scope.
    let miss = parse_expr_text(&mut ctx, "old.x").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, miss), 1);
    assert_eq!(ctx.error_message(), Some("no such column: old.x"));
}

#[test]
fn integer_primary_key_aliases_the_rowid() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let schema = TableSchema::parse("CREATE TABLE n (id INTEGER PRIMARY KEY, v TEXT)")
        .expect("parse schema");
    let src = src_one(schema, 0);
    let expr = parse_expr_text(&mut ctx, "id").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    match &ctx.pool.node(expr).kind {
        ExprKind::Column(col) => assert_eq!(col.column, -1),
        other => panic!("id resolved to {other:?}"),
    }
}

#[test]
fn unmatched_double_quoted_name_stays_a_literal() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "\"no such thing\"").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    assert!(matches!(ctx.pool.node(expr).kind, ExprKind::Str));

    // A double-quoted name that does match becomes a column reference.
    let matched = parse_expr_text(&mut ctx, "\"y\"").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, matched), 0);
    assert!(matches!(ctx.pool.node(matched).kind, ExprKind::Column(_)));
}

#[test]
fn resolver_is_idempotent() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "x + y").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    let first = format!("{:?}", ctx.pool.node(expr));
    let nodes_after_first = ctx.pool.len();

    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    assert_eq!(format!("{:?}", ctx.pool.node(expr)), first);
    assert_eq!(ctx.pool.len(), nodes_after_first);
}

#[test]
fn in_list_requires_constants() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "x IN (1, y, 3)").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 1);
    assert_eq!(
        ctx.error_message(),
        Some("right-hand side of IN operator must be constant")
    );
}

#[test]
fn in_list_gets_a_set_identifier_and_loads_it() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "x IN (1, 2, 'three')").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);

    match ctx.pool.node(expr).kind {
        ExprKind::In { set: Some(InSet::Values(set)) } => assert_eq!(set, 0),
        ref other => panic!("IN resolved to {other:?}"),
    }
    assert_eq!(ctx.n_set, 1);
    // Three SetInsert instructions with dequoted literals.
    let inserts: Vec<_> = ctx
        .program
        .insns()
        .iter()
        .filter(|insn| insn.op == quern::Opcode::SetInsert)
        .collect();
    assert_eq!(inserts.len(), 3);
    assert_eq!(inserts[2].p3, Some(quern::P3::text("three")));
}

#[test]
fn in_subquery_allocates_a_cursor_and_a_job() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "x IN (SELECT v FROM other)").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);

    match ctx.pool.node(expr).kind {
        ExprKind::In { set: Some(InSet::Select(cursor)) } => assert_eq!(cursor, 0),
        ref other => panic!("IN resolved to {other:?}"),
    }
    assert_eq!(ctx.n_tab, 1);
    assert_eq!(ctx.subqueries.len(), 1);
    assert_eq!(ctx.subqueries[0].dest, SubqueryDest::Set { cursor: 0 });
    assert!(ctx.program.insns().iter().any(|i| i.op == quern::Opcode::OpenTemp));
}

#[test]
fn scalar_subquery_gets_a_memory_cell() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "x + (SELECT max(v) FROM other)").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    let sub = ctx.pool.node(expr).right.expect("rhs");
    match ctx.pool.node(sub).kind {
        ExprKind::ScalarSelect { cell: Some(cell) } => assert_eq!(cell, 0),
        ref other => panic!("subquery resolved to {other:?}"),
    }
    assert_eq!(ctx.n_mem, 1);
    assert_eq!(ctx.subqueries.len(), 1);
    assert_eq!(ctx.subqueries[0].dest, SubqueryDest::Cell { cell: 0 });
}

#[test]
fn aggregate_detection_rewrites_and_fills_the_table() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "count(*) + 1").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);

    let mut has_agg = false;
    assert_eq!(ctx.check(expr, true, Some(&mut has_agg)), 0);
    assert!(has_agg);
    let count = ctx.pool.node(expr).left.expect("lhs");
    assert!(matches!(ctx.pool.node(count).kind, ExprKind::AggFunction { .. }));

    assert_eq!(ctx.analyze_aggregates(expr), 0);
    assert_eq!(ctx.agg.len(), 1);
    assert!(ctx.agg[0].is_agg);
    assert!(ctx.agg[0].func.is_some());
    match ctx.pool.node(count).kind {
        ExprKind::AggFunction { agg_slot: Some(slot), .. } => assert_eq!(slot, 0),
        ref other => panic!("count(*) is {other:?}"),
    }
}

#[test]
fn aggregate_arguments_and_duplicates_share_slots() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "sum(x) + sum(x) + x").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    assert_eq!(ctx.check(expr, true, None), 0);
    assert_eq!(ctx.analyze_aggregates(expr), 0);

    // One aggregate slot for the duplicated sum(x), one value slot for the
    // two column references of x.
    let agg_slots = ctx.agg.iter().filter(|e| e.is_agg).count();
    let value_slots = ctx.agg.iter().filter(|e| !e.is_agg).count();
    assert_eq!(agg_slots, 1);
    assert_eq!(value_slots, 1);
}

#[test]
fn nested_aggregates_are_rejected() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "sum(count(x))").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    assert_eq!(ctx.check(expr, true, None), 1);
    assert_eq!(ctx.error_message(), Some("misuse of aggregate function count()"));
}

#[test]
fn aggregate_outside_aggregate_context_is_misuse() {
    let registry = FuncRegistry::with_builtins();
    let mut ctx = ParseCtx::new("", &registry);
    let src = src_one(table_t(), 0);
    let expr = parse_expr_text(&mut ctx, "sum(x)").expect("parse");
    assert_eq!(ctx.resolve_ids(&src, None, expr), 0);
    assert_eq!(ctx.check(expr, false, None), 1);
    assert_eq!(ctx.error_message(), Some("misuse of aggregate function sum()"));
}

#[test]
fn function_arity_and_existence_errors() {
    let registry = FuncRegistry::with_builtins();

    let mut ctx = ParseCtx::new("", &registry);
    let expr = parse_expr_text(&mut ctx, "nosuch(1)").expect("parse");
    assert_eq!(ctx.check(expr, false, None), 1);
    assert_eq!(ctx.error_message(), Some("no such function: nosuch"));

    let mut ctx = ParseCtx::new("", &registry);
    let expr = parse_expr_text(&mut ctx, "length(1, 2)").expect("parse");
    assert_eq!(ctx.check(expr, false, None), 1);
    assert_eq!(
        ctx.error_message(),
        Some("wrong number of arguments to function length()")
    );

    // Variadic fallback: coalesce accepts any arity.
    let mut ctx = ParseCtx::new("", &registry);
    let expr = parse_expr_text(&mut ctx, "coalesce(1, 2, 3, 4)").expect("parse");
    assert_eq!(ctx.check(expr, false, None), 0);
}

#[test]
fn affinity_rule_table() {
    let registry = FuncRegistry::with_builtins();
    let src = src_one(table_t(), 0);
    // (expression, expected affinity); x is numeric, y is text.
    let cases = [
        ("x + y", Affinity::Numeric),
        ("x | 1", Affinity::Numeric),
        ("-y", Affinity::Numeric),
        ("NOT y", Affinity::Numeric),
        ("x IS NULL", Affinity::Numeric),
        ("y BETWEEN 'a' AND 'b'", Affinity::Numeric),
        ("y LIKE 'a%'", Affinity::Numeric),
        ("x IN (1, 2)", Affinity::Numeric),
        ("'lit'", Affinity::Text),
        ("NULL", Affinity::Text),
        ("y || y", Affinity::Text),
        ("?", Affinity::Text),
        ("x", Affinity::Numeric),
        ("y", Affinity::Text),
        // Comparisons: numeric when the left side is numeric, else they
        // follow the right side.
        ("x = y", Affinity::Numeric),
        ("y = x", Affinity::Numeric),
        ("y = 'a'", Affinity::Text),
        ("upper(y)", Affinity::Text),
        ("length(y)", Affinity::Numeric),
        // CASE: numeric if the ELSE or any THEN is numeric.
        ("CASE WHEN 1 THEN 'a' ELSE x END", Affinity::Numeric),
        ("CASE WHEN 1 THEN x ELSE 'a' END", Affinity::Numeric),
        ("CASE WHEN 1 THEN 'a' ELSE y END", Affinity::Text),
        ("CASE WHEN 1 THEN 'a' END", Affinity::Text),
    ];
    for (sql, expect) in cases {
        let mut ctx = ParseCtx::new("", &registry);
        let expr = parse_expr_text(&mut ctx, sql).expect("parse");
        assert_eq!(ctx.resolve_ids(&src, None, expr), 0, "resolving {sql}");
        assert_eq!(ctx.check(expr, true, None), 0, "checking {sql}");
        assert_eq!(expr_affinity(&ctx.pool, expr), expect, "affinity of {sql}");
        // The pass is idempotent.
        assert_eq!(expr_affinity(&ctx.pool, expr), expect);
    }
}
