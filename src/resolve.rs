use smallvec::SmallVec;

use crate::emit::{Opcode, P3};
use crate::expr::{BinOp, ColumnRef, ExprId, ExprKind, ExprList, ExprPool, InSet};
use crate::parse::{AggEntry, ParseCtx, SubqueryDest, SubqueryJob};
use crate::schema::{Affinity, SrcItem};
use crate::token::{dequote, is_row_id_name, name_eq};

/// Sort affinity of an expression, from the fixed rule table.
///
/// Requires identifier resolution and function checking to have run, so
/// column and function nodes carry their stored affinity. Idempotent.
pub fn expr_affinity(pool: &ExprPool, mut id: ExprId) -> Affinity {
    loop {
        let node = pool.node(id);
        match &node.kind {
            ExprKind::Binary(BinOp::Concat) => return Affinity::Text,
            ExprKind::Binary(op) if op.is_comparison() => {
                // Numeric if the left operand is numeric, else follow the
                // right operand.
                if let Some(left) = node.left
                    && expr_affinity(pool, left) == Affinity::Numeric
                {
                    return Affinity::Numeric;
                }
                match node.right {
                    Some(right) => id = right,
                    None => return Affinity::Numeric,
                }
            }
            ExprKind::Binary(_)
            | ExprKind::Unary(_)
            | ExprKind::IsNull
            | ExprKind::NotNull
            | ExprKind::Integer
            | ExprKind::Float
            | ExprKind::In { .. }
            | ExprKind::Between => return Affinity::Numeric,
            ExprKind::Str | ExprKind::Null | ExprKind::Variable { .. } => return Affinity::Text,
            ExprKind::Column(col) => return col.affinity,
            ExprKind::Function { affinity, .. } | ExprKind::AggFunction { affinity, .. } => {
                return *affinity;
            }
            ExprKind::Alias { .. } => match node.left {
                Some(left) => id = left,
                None => return Affinity::Numeric,
            },
            ExprKind::ScalarSelect { .. } => {
                // Affinity of the first result-set column.
                match node.subselect.as_ref().and_then(|s| s.result.items.first()) {
                    Some(item) => id = item.expr,
                    None => return Affinity::Numeric,
                }
            }
            ExprKind::Case => {
                if let Some(els) = node.right
                    && expr_affinity(pool, els) == Affinity::Numeric
                {
                    return Affinity::Numeric;
                }
                if let Some(args) = &node.args {
                    // Odd list positions are the THEN branches.
                    for item in args.items.iter().skip(1).step_by(2) {
                        if expr_affinity(pool, item.expr) == Affinity::Numeric {
                            return Affinity::Numeric;
                        }
                    }
                }
                return Affinity::Text;
            }
            ExprKind::Id | ExprKind::Dot | ExprKind::Raise(_) => return Affinity::Numeric,
        }
    }
}

impl ParseCtx<'_> {
    /// Resolve identifiers in the tree against a source-table list and an
    /// optional result-alias list. Identifier nodes are rewritten in place
    /// to column references (or alias copies); IN operators and scalar
    /// subqueries get their runtime resources allocated here.
    ///
    /// Returns the number of errors raised; messages stay on the context.
    pub fn resolve_ids(
        &mut self,
        src: &[SrcItem],
        aliases: Option<&ExprList>,
        id: ExprId,
    ) -> usize {
        let before = self.error_count();
        self.resolve_expr(src, aliases, id);
        self.error_count() - before
    }

    fn resolve_expr(&mut self, src: &[SrcItem], aliases: Option<&ExprList>, id: ExprId) -> bool {
        let node = self.pool.node(id);
        let kind = node.kind.clone();
        match kind {
            // Double-quoted strings are used as identifiers when possible;
            // single-quoted strings are always literals.
            ExprKind::Str => {
                let token = self.pool.node_token_text(id).to_owned();
                if token.starts_with('\'') {
                    return false;
                }
                self.lookup_name(None, None, token, src, aliases, id)
            }
            ExprKind::Id => {
                let token = self.pool.node_token_text(id).to_owned();
                self.lookup_name(None, None, token, src, aliases, id)
            }
            ExprKind::Dot => {
                let Some((db, table, column)) = self.dotted_parts(id) else {
                    self.error("misshapen dotted name".to_owned());
                    return true;
                };
                self.lookup_name(db, Some(table), column, src, None, id)
            }
            ExprKind::In { .. } => {
                let left = self.pool.node(id).left.expect("IN lhs");
                if self.resolve_expr(src, aliases, left) {
                    return true;
                }
                if self.pool.node(id).subselect.is_some() {
                    // IN (SELECT ...): evaluate the subquery into a
                    // temporary table before the main loop runs.
                    let cursor = self.n_tab;
                    self.n_tab += 1;
                    self.pool.node_mut(id).kind = ExprKind::In { set: Some(InSet::Select(cursor)) };
                    self.program.add(Opcode::OpenTemp, cursor, 1);
                    self.subqueries.push(SubqueryJob { expr: id, dest: SubqueryDest::Set { cursor } });
                    return false;
                }
                let elems: SmallVec<[ExprId; 8]> = self
                    .pool
                    .node(id)
                    .args
                    .as_ref()
                    .map(|args| args.items.iter().map(|item| item.expr).collect())
                    .unwrap_or_default();
                for &elem in &elems {
                    if !self.pool.is_constant(elem) {
                        self.error("right-hand side of IN operator must be constant".to_owned());
                        return true;
                    }
                    if self.check(elem, false, None) > 0 {
                        return true;
                    }
                }
                let set = self.n_set;
                self.n_set += 1;
                self.pool.node_mut(id).kind = ExprKind::In { set: Some(InSet::Values(set)) };
                for &elem in &elems {
                    let elem_kind = self.pool.node(elem).kind.clone();
                    match elem_kind {
                        ExprKind::Float | ExprKind::Integer | ExprKind::Str => {
                            let text = dequote(self.pool.node_token_text(elem)).into_owned();
                            self.program.add_p3(Opcode::SetInsert, set, 0, P3::text(text));
                        }
                        _ => {
                            self.emit_value(elem);
                            self.program.add(Opcode::SetInsert, set, 0);
                        }
                    }
                }
                false
            }
            ExprKind::ScalarSelect { .. } => {
                // Arrange for the single-row, single-column result to land
                // in a memory cell.
                let cell = self.n_mem;
                self.n_mem += 1;
                self.pool.node_mut(id).kind = ExprKind::ScalarSelect { cell: Some(cell) };
                self.subqueries.push(SubqueryJob { expr: id, dest: SubqueryDest::Cell { cell } });
                false
            }
            _ => {
                let node = self.pool.node(id);
                let left = node.left;
                let right = node.right;
                let args: SmallVec<[ExprId; 8]> = node
                    .args
                    .as_ref()
                    .map(|args| args.items.iter().map(|item| item.expr).collect())
                    .unwrap_or_default();
                if let Some(left) = left
                    && self.resolve_expr(src, aliases, left)
                {
                    return true;
                }
                if let Some(right) = right
                    && self.resolve_expr(src, aliases, right)
                {
                    return true;
                }
                for arg in args {
                    if self.resolve_expr(src, aliases, arg) {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Token texts of a dotted name: `(database?, table, column)`.
    fn dotted_parts(&self, id: ExprId) -> Option<(Option<String>, String, String)> {
        let node = self.pool.node(id);
        let left = node.left?;
        let right = node.right?;
        let right_node = self.pool.node(right);
        if matches!(right_node.kind, ExprKind::Dot) {
            let table = right_node.left?;
            let column = right_node.right?;
            Some((
                Some(self.pool.node_token_text(left).to_owned()),
                self.pool.node_token_text(table).to_owned(),
                self.pool.node_token_text(column).to_owned(),
            ))
        } else {
            Some((
                None,
                self.pool.node_token_text(left).to_owned(),
                self.pool.node_token_text(right).to_owned(),
            ))
        }
    }

    /// Bind one `X.Y.Z` / `Y.Z` / `Z` name against the source list,
    /// rewriting the node on success. Returns true when an error was
    /// raised.
    fn lookup_name(
        &mut self,
        db_tok: Option<String>,
        tab_tok: Option<String>,
        col_tok: String,
        src: &[SrcItem],
        aliases: Option<&ExprList>,
        id: ExprId,
    ) -> bool {
        let z_db = db_tok.as_deref().map(|t| dequote(t).into_owned());
        let z_tab = tab_tok.as_deref().map(|t| dequote(t).into_owned());
        let z_col = dequote(&col_tok).into_owned();

        let mut cnt = 0usize;
        let mut cnt_tab = 0usize;
        let mut cursor = -1i32;
        let mut db_index = -1i32;
        let mut column = -1i32;
        let mut affinity = Affinity::Numeric;
        let mut hook_names: Option<(String, String)> = None;

        for item in src {
            if let Some(z_tab) = &z_tab {
                if let Some(alias) = &item.alias {
                    // Alias names override schema names.
                    if !name_eq(alias, z_tab) {
                        continue;
                    }
                } else {
                    if !name_eq(&item.schema.name, z_tab) {
                        continue;
                    }
                    if let Some(z_db) = &z_db
                        && !item.database.as_deref().is_some_and(|d| name_eq(d, z_db))
                    {
                        continue;
                    }
                }
            }
            cnt_tab += 1;
            if cnt_tab == 1 {
                cursor = item.cursor;
                db_index = item.db_index;
            }
            if let Some(j) = item.schema.column_index(&z_col) {
                cnt += 1;
                cursor = item.cursor;
                db_index = item.db_index;
                column = if item.schema.ipk == Some(j) { -1 } else { j as i32 };
                affinity = item.schema.columns[j].affinity;
                hook_names =
                    Some((item.schema.name.clone(), item.schema.columns[j].name.clone()));
            }
        }

        // Maybe a new.* / old.* reference inside a trigger body.
        if z_db.is_none()
            && cnt == 0
            && let Some(z_tab) = &z_tab
            && let Some(trigger) = &self.trigger
        {
            let pseudo = if trigger.new_cursor.is_some() && name_eq("new", z_tab) {
                trigger.new_cursor
            } else if trigger.old_cursor.is_some() && name_eq("old", z_tab) {
                trigger.old_cursor
            } else {
                None
            };
            if let Some(pseudo_cursor) = pseudo {
                cursor = pseudo_cursor;
                cnt_tab += 1;
                if let Some(j) = trigger.table.column_index(&z_col) {
                    cnt += 1;
                    column = if trigger.table.ipk == Some(j) { -1 } else { j as i32 };
                    affinity = trigger.table.columns[j].affinity;
                    hook_names = Some((
                        trigger.table.name.clone(),
                        trigger.table.columns[j].name.clone(),
                    ));
                }
            }
        }

        // Perhaps the name refers to the ROWID.
        if cnt == 0 && cnt_tab == 1 && is_row_id_name(&z_col) {
            cnt = 1;
            column = -1;
            affinity = Affinity::Numeric;
        }

        // A lone Z might be a result-set alias, as in
        // SELECT a+b AS x FROM t WHERE x < 10. Replace the node with a copy
        // of the aliased expression.
        if cnt == 0
            && let Some(aliases) = aliases
        {
            for (j, item) in aliases.items.iter().enumerate() {
                if item.name.as_deref().is_some_and(|name| name_eq(name, &z_col)) {
                    let copy = self.pool.deep_copy(item.expr);
                    let node = self.pool.node_mut(id);
                    node.kind = ExprKind::Alias { column: j };
                    node.left = Some(copy);
                    node.right = None;
                    return false;
                }
            }
        }

        // An unmatched double-quoted lone name stays a string literal.
        if cnt == 0 && z_tab.is_none() && col_tok.starts_with('"') {
            return false;
        }

        if cnt != 1 {
            let qualified = match (&z_db, &z_tab) {
                (Some(db), Some(tab)) => format!("{db}.{tab}.{z_col}"),
                (None, Some(tab)) => format!("{tab}.{z_col}"),
                _ => z_col.clone(),
            };
            let msg = if cnt == 0 {
                format!("no such column: {qualified}")
            } else {
                format!("ambiguous column name: {qualified}")
            };
            self.error(msg);
            return true;
        }

        let node = self.pool.node_mut(id);
        node.left = None;
        node.right = None;
        node.kind = ExprKind::Column(ColumnRef {
            cursor,
            column,
            db: db_index,
            affinity,
            agg_slot: None,
        });
        if let Some(hook) = self.access_hook.as_mut() {
            let (table, column_name) = hook_names.unwrap_or_else(|| {
                let table = src
                    .iter()
                    .find(|item| item.cursor == cursor)
                    .map(|item| item.schema.name.clone())
                    .unwrap_or_default();
                (table, "ROWID".to_owned())
            });
            hook(&table, &column_name);
        }
        false
    }

    /// Check function names, arities and aggregate use throughout the tree.
    /// Aggregate calls are rewritten to aggregate-function nodes and their
    /// result affinity is stored. Returns the number of errors raised.
    ///
    /// `has_agg`, when provided, is set if any aggregate call is seen.
    pub fn check(&mut self, id: ExprId, allow_agg: bool, has_agg: Option<&mut bool>) -> usize {
        let before = self.error_count();
        self.check_expr(id, allow_agg, has_agg);
        self.error_count() - before
    }

    fn check_expr(&mut self, id: ExprId, allow_agg: bool, mut has_agg: Option<&mut bool>) {
        let node = self.pool.node(id);
        let kind = node.kind.clone();
        match kind {
            ExprKind::Function { .. } => {
                let name = self.pool.node_token_text(id).to_owned();
                let args: SmallVec<[ExprId; 8]> = self
                    .pool
                    .node(id)
                    .args
                    .as_ref()
                    .map(|args| args.items.iter().map(|item| item.expr).collect())
                    .unwrap_or_default();
                let n = args.len();

                let func = self.registry().find(&name, n as i32);
                let mut is_agg = func.is_some_and(|f| self.registry().def(f).is_aggregate());
                if is_agg && !allow_agg {
                    self.error(format!("misuse of aggregate function {name}()"));
                    is_agg = false;
                } else if func.is_none() {
                    if self.registry().find_any(&name).is_some() {
                        self.error(format!("wrong number of arguments to function {name}()"));
                    } else {
                        self.error(format!("no such function: {name}"));
                    }
                }
                if is_agg {
                    self.pool.node_mut(id).kind = ExprKind::AggFunction {
                        func,
                        affinity: Affinity::Numeric,
                        agg_slot: None,
                    };
                    if let Some(flag) = has_agg.as_deref_mut() {
                        *flag = true;
                    }
                }
                // Arguments of an aggregate may not themselves aggregate.
                let inner_allow = allow_agg && !is_agg;
                let checkpoint = self.error_count();
                for &arg in &args {
                    if self.error_count() != checkpoint {
                        break;
                    }
                    self.check_expr(arg, inner_allow, has_agg.as_deref_mut());
                }
                if let Some(func) = func {
                    let affinity = match self.registry().def(func).result {
                        crate::func::ResultAffinity::Fixed(affinity) => affinity,
                        crate::func::ResultAffinity::FromArgs => {
                            if args.iter().any(|&a| {
                                expr_affinity(&self.pool, a) == Affinity::Numeric
                            }) {
                                Affinity::Numeric
                            } else {
                                Affinity::Text
                            }
                        }
                        crate::func::ResultAffinity::Arg(i) => {
                            if i < n {
                                expr_affinity(&self.pool, args[i])
                            } else {
                                Affinity::Numeric
                            }
                        }
                    };
                    match &mut self.pool.node_mut(id).kind {
                        ExprKind::Function { affinity: slot, .. }
                        | ExprKind::AggFunction { affinity: slot, .. } => *slot = affinity,
                        _ => {}
                    }
                }
            }
            _ => {
                let node = self.pool.node(id);
                let left = node.left;
                let right = node.right;
                let args: SmallVec<[ExprId; 8]> = node
                    .args
                    .as_ref()
                    .map(|args| args.items.iter().map(|item| item.expr).collect())
                    .unwrap_or_default();
                let checkpoint = self.error_count();
                if let Some(left) = left {
                    self.check_expr(left, allow_agg, has_agg.as_deref_mut());
                }
                if self.error_count() == checkpoint
                    && let Some(right) = right
                {
                    self.check_expr(right, allow_agg, has_agg.as_deref_mut());
                }
                for arg in args {
                    if self.error_count() != checkpoint {
                        break;
                    }
                    self.check_expr(arg, allow_agg, has_agg.as_deref_mut());
                }
            }
        }
    }

    /// Populate the aggregate table from a resolved, checked tree: column
    /// references become value slots, aggregate calls become aggregate
    /// slots with their function binding resolved once. Slot indices are
    /// written back onto the nodes. Returns the number of errors raised.
    pub fn analyze_aggregates(&mut self, id: ExprId) -> usize {
        let before = self.error_count();
        self.analyze_agg_expr(id);
        self.error_count() - before
    }

    fn analyze_agg_expr(&mut self, id: ExprId) {
        let node = self.pool.node(id);
        let kind = node.kind.clone();
        match kind {
            ExprKind::Column(col) => {
                let found = self.agg.iter().position(|entry| {
                    if entry.is_agg {
                        return false;
                    }
                    matches!(
                        &self.pool.node(entry.expr).kind,
                        ExprKind::Column(c) if c.cursor == col.cursor && c.column == col.column
                    )
                });
                let slot = found.unwrap_or_else(|| {
                    self.agg.push(AggEntry { expr: id, is_agg: false, func: None });
                    self.agg.len() - 1
                });
                if let ExprKind::Column(col) = &mut self.pool.node_mut(id).kind {
                    col.agg_slot = Some(slot);
                }
            }
            ExprKind::AggFunction { .. } => {
                let pool = &self.pool;
                let found = self
                    .agg
                    .iter()
                    .position(|entry| entry.is_agg && pool.exprs_equal(entry.expr, id));
                let slot = match found {
                    Some(slot) => slot,
                    None => {
                        let name = self.pool.node_token_text(id).to_owned();
                        let n = self.pool.node(id).args.as_ref().map_or(0, ExprList::len);
                        let func = self.registry().find(&name, n as i32);
                        self.agg.push(AggEntry { expr: id, is_agg: true, func });
                        self.agg.len() - 1
                    }
                };
                if let ExprKind::AggFunction { agg_slot, .. } = &mut self.pool.node_mut(id).kind {
                    *agg_slot = Some(slot);
                }
            }
            _ => {
                let node = self.pool.node(id);
                let left = node.left;
                let right = node.right;
                let args: SmallVec<[ExprId; 8]> = node
                    .args
                    .as_ref()
                    .map(|args| args.items.iter().map(|item| item.expr).collect())
                    .unwrap_or_default();
                let checkpoint = self.error_count();
                if let Some(left) = left {
                    self.analyze_agg_expr(left);
                }
                if self.error_count() == checkpoint
                    && let Some(right) = right
                {
                    self.analyze_agg_expr(right);
                }
                for arg in args {
                    if self.error_count() != checkpoint {
                        break;
                    }
                    self.analyze_agg_expr(arg);
                }
            }
        }
    }
}
