//! SQL front-end: drives the expression-tree factory from SQL text.
//!
//! The parser proper is `sqlparser`; this module only lowers its AST into
//! the engine's own tree model, keeping the original lexemes as tokens so
//! the resolver and emitter see the same byte-level view a hand-built tree
//! would give them.

use std::fmt;

use sqlparser::ast::{
    BinaryOperator, CaseWhen, Distinct, Expr as SqlExpr, Function, FunctionArg, FunctionArgExpr,
    FunctionArguments, Ident, ObjectName, ObjectNamePart, Query, Select as SqlSelect, SelectItem,
    SetExpr, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::{Parser, ParserError};

use crate::expr::{BinOp, ExprId, ExprKind, ExprList, ExprNode, Select, UnOp};
use crate::parse::ParseCtx;
use crate::token::Token;

#[derive(Debug)]
pub enum SqlError {
    Parse(ParserError),
    Unsupported(&'static str),
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "{err}"),
            Self::Unsupported(what) => write!(f, "Unsupported SQL: {what}"),
        }
    }
}

impl std::error::Error for SqlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Unsupported(_) => None,
        }
    }
}

impl From<ParserError> for SqlError {
    fn from(err: ParserError) -> Self {
        Self::Parse(err)
    }
}

pub type Result<T> = std::result::Result<T, SqlError>;

/// Parse the context's source text as a single SQL expression and lower it
/// into the context's pool, returning the root node.
pub fn parse_expr(ctx: &mut ParseCtx<'_>) -> Result<ExprId> {
    let sql = ctx.pool.source().to_owned();
    parse_expr_text(ctx, &sql)
}

/// Parse `sql` as a single SQL expression and lower it into the context's
/// pool. The lowered nodes carry owned copies of their lexemes, so `sql`
/// need not outlive the call.
pub fn parse_expr_text(ctx: &mut ParseCtx<'_>, sql: &str) -> Result<ExprId> {
    let dialect = SQLiteDialect {};
    let ast = Parser::new(&dialect).try_with_sql(sql)?.parse_expr()?;
    lower(ctx, &ast)
}

fn lower(ctx: &mut ParseCtx<'_>, expr: &SqlExpr) -> Result<ExprId> {
    match expr {
        SqlExpr::Identifier(ident) => {
            // Double-quoted names start life as string tokens; the resolver
            // decides whether they bind to a column or stay literals.
            let kind = if ident.quote_style == Some('"') { ExprKind::Str } else { ExprKind::Id };
            Ok(ctx.pool.leaf(kind, ident_token(ident)))
        }
        SqlExpr::CompoundIdentifier(parts) => lower_compound(ctx, parts),
        SqlExpr::Value(value) => lower_value(ctx, &value.value),
        SqlExpr::Nested(inner) => lower(ctx, inner),
        SqlExpr::BinaryOp { left, op, right } => {
            let op = binary_op(op)?;
            let left = lower(ctx, left)?;
            let right = lower(ctx, right)?;
            Ok(ctx.pool.binary(op, left, right))
        }
        SqlExpr::UnaryOp { op, expr } => {
            let op = match op {
                UnaryOperator::Minus => UnOp::Neg,
                UnaryOperator::Plus => UnOp::Plus,
                UnaryOperator::Not | UnaryOperator::BangNot => UnOp::Not,
                UnaryOperator::PGBitwiseNot => UnOp::BitNot,
                _ => return Err(SqlError::Unsupported("unary operator")),
            };
            let operand = lower(ctx, expr)?;
            Ok(ctx.pool.unary(op, operand, Token::None))
        }
        SqlExpr::IsNull(inner) => {
            let operand = lower(ctx, inner)?;
            let mut node = ExprNode::new(ExprKind::IsNull);
            node.left = Some(operand);
            Ok(ctx.pool.add(node))
        }
        SqlExpr::IsNotNull(inner) => {
            let operand = lower(ctx, inner)?;
            let mut node = ExprNode::new(ExprKind::NotNull);
            node.left = Some(operand);
            Ok(ctx.pool.add(node))
        }
        SqlExpr::Between { expr, negated, low, high } => {
            let operand = lower(ctx, expr)?;
            let low = lower(ctx, low)?;
            let high = lower(ctx, high)?;
            let mut bounds = ExprList::new();
            ctx.pool.list_append(&mut bounds, low, None);
            ctx.pool.list_append(&mut bounds, high, None);
            let mut node = ExprNode::new(ExprKind::Between);
            node.left = Some(operand);
            node.args = Some(bounds);
            let id = ctx.pool.add(node);
            Ok(negate_if(ctx, id, *negated))
        }
        SqlExpr::InList { expr, list, negated } => {
            let operand = lower(ctx, expr)?;
            let mut elems = ExprList::new();
            for elem in list {
                let elem = lower(ctx, elem)?;
                ctx.pool.list_append(&mut elems, elem, None);
            }
            let mut node = ExprNode::new(ExprKind::In { set: None });
            node.left = Some(operand);
            node.args = Some(elems);
            let id = ctx.pool.add(node);
            Ok(negate_if(ctx, id, *negated))
        }
        SqlExpr::InSubquery { expr, subquery, negated } => {
            let operand = lower(ctx, expr)?;
            let select = lower_set_expr(ctx, subquery)?;
            let mut node = ExprNode::new(ExprKind::In { set: None });
            node.left = Some(operand);
            node.subselect = Some(Box::new(select));
            let id = ctx.pool.add(node);
            Ok(negate_if(ctx, id, *negated))
        }
        SqlExpr::Subquery(query) => {
            let select = lower_query(ctx, query)?;
            let mut node = ExprNode::new(ExprKind::ScalarSelect { cell: None });
            node.subselect = Some(Box::new(select));
            Ok(ctx.pool.add(node))
        }
        SqlExpr::Case { operand, conditions, else_result, .. } => {
            lower_case(ctx, operand.as_deref(), conditions, else_result.as_deref())
        }
        SqlExpr::Function(fun) => lower_function(ctx, fun),
        SqlExpr::Like { negated, expr, pattern, escape_char, .. } => {
            if escape_char.is_some() {
                return Err(SqlError::Unsupported("LIKE ... ESCAPE"));
            }
            // X LIKE Y is the function call like(Y, X): pattern first.
            let operand = lower(ctx, expr)?;
            let pattern = lower(ctx, pattern)?;
            let mut args = ExprList::new();
            ctx.pool.list_append(&mut args, pattern, None);
            ctx.pool.list_append(&mut args, operand, None);
            let id = ctx.pool.function(args, Token::owned("like"));
            Ok(negate_if(ctx, id, *negated))
        }
        _ => Err(SqlError::Unsupported("expression form")),
    }
}

fn negate_if(ctx: &mut ParseCtx<'_>, id: ExprId, negated: bool) -> ExprId {
    if negated { ctx.pool.unary(UnOp::Not, id, Token::None) } else { id }
}

fn lower_value(ctx: &mut ParseCtx<'_>, value: &SqlValue) -> Result<ExprId> {
    match value {
        SqlValue::Number(raw, _) => {
            let kind = if raw.contains('.') || raw.contains('e') || raw.contains('E') {
                ExprKind::Float
            } else {
                ExprKind::Integer
            };
            Ok(ctx.pool.leaf(kind, Token::owned(raw.as_str())))
        }
        SqlValue::SingleQuotedString(text) => {
            let lexeme = format!("'{}'", text.replace('\'', "''"));
            Ok(ctx.pool.leaf(ExprKind::Str, Token::owned(lexeme)))
        }
        SqlValue::DoubleQuotedString(text) => {
            // Kept as a double-quoted string token; the resolver decides
            // whether it is an identifier or a literal.
            let lexeme = format!("\"{}\"", text.replace('"', "\"\""));
            Ok(ctx.pool.leaf(ExprKind::Str, Token::owned(lexeme)))
        }
        SqlValue::Null => Ok(ctx.pool.leaf(ExprKind::Null, Token::owned("NULL"))),
        SqlValue::Boolean(value) => {
            let lexeme = if *value { "1" } else { "0" };
            Ok(ctx.pool.leaf(ExprKind::Integer, Token::owned(lexeme)))
        }
        SqlValue::Placeholder(text) => {
            let index = ctx.n_var;
            ctx.n_var += 1;
            Ok(ctx.pool.leaf(ExprKind::Variable { index }, Token::owned(text.as_str())))
        }
        _ => Err(SqlError::Unsupported("literal form")),
    }
}

fn ident_token(ident: &Ident) -> Token {
    match ident.quote_style {
        Some('"') => Token::owned(format!("\"{}\"", ident.value.replace('"', "\"\""))),
        Some('`') => Token::owned(format!("`{}`", ident.value)),
        Some('[') => Token::owned(format!("[{}]", ident.value)),
        _ => Token::owned(ident.value.as_str()),
    }
}

fn lower_compound(ctx: &mut ParseCtx<'_>, parts: &[Ident]) -> Result<ExprId> {
    match parts {
        [table, column] => {
            let table = ctx.pool.leaf(ExprKind::Id, ident_token(table));
            let column = ctx.pool.leaf(ExprKind::Id, ident_token(column));
            let mut node = ExprNode::new(ExprKind::Dot);
            node.left = Some(table);
            node.right = Some(column);
            Ok(ctx.pool.add(node))
        }
        [db, table, column] => {
            let db = ctx.pool.leaf(ExprKind::Id, ident_token(db));
            let table = ctx.pool.leaf(ExprKind::Id, ident_token(table));
            let column = ctx.pool.leaf(ExprKind::Id, ident_token(column));
            let mut inner = ExprNode::new(ExprKind::Dot);
            inner.left = Some(table);
            inner.right = Some(column);
            let inner = ctx.pool.add(inner);
            let mut outer = ExprNode::new(ExprKind::Dot);
            outer.left = Some(db);
            outer.right = Some(inner);
            Ok(ctx.pool.add(outer))
        }
        _ => Err(SqlError::Unsupported("compound identifier depth")),
    }
}

fn lower_case(
    ctx: &mut ParseCtx<'_>,
    operand: Option<&SqlExpr>,
    conditions: &[CaseWhen],
    else_result: Option<&SqlExpr>,
) -> Result<ExprId> {
    if conditions.is_empty() {
        return Err(SqlError::Unsupported("CASE without WHEN arms"));
    }
    let base = operand.map(|e| lower(ctx, e)).transpose()?;
    let mut pairs = ExprList::new();
    for arm in conditions {
        let when = lower(ctx, &arm.condition)?;
        let then = lower(ctx, &arm.result)?;
        ctx.pool.list_append(&mut pairs, when, None);
        ctx.pool.list_append(&mut pairs, then, None);
    }
    let els = else_result.map(|e| lower(ctx, e)).transpose()?;
    let mut node = ExprNode::new(ExprKind::Case);
    node.left = base;
    node.right = els;
    node.args = Some(pairs);
    Ok(ctx.pool.add(node))
}

fn lower_function(ctx: &mut ParseCtx<'_>, fun: &Function) -> Result<ExprId> {
    if !matches!(fun.parameters, FunctionArguments::None)
        || fun.filter.is_some()
        || fun.null_treatment.is_some()
        || fun.over.is_some()
        || !fun.within_group.is_empty()
    {
        return Err(SqlError::Unsupported("function clause"));
    }
    let name = object_name_last_ident(&fun.name)?;
    let mut args = ExprList::new();
    match &fun.args {
        FunctionArguments::None => {}
        FunctionArguments::Subquery(_) => {
            return Err(SqlError::Unsupported("subquery function argument"));
        }
        FunctionArguments::List(list) => {
            if list.duplicate_treatment.is_some() || !list.clauses.is_empty() {
                return Err(SqlError::Unsupported("function argument clause"));
            }
            match list.args.as_slice() {
                // count(*) carries no argument list at all.
                [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => {}
                rest => {
                    for arg in rest {
                        let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg else {
                            return Err(SqlError::Unsupported("function argument form"));
                        };
                        let lowered = lower(ctx, expr)?;
                        ctx.pool.list_append(&mut args, lowered, None);
                    }
                }
            }
        }
    }
    Ok(ctx.pool.function(args, Token::owned(name)))
}

fn object_name_last_ident(name: &ObjectName) -> Result<String> {
    match name.0.last() {
        Some(ObjectNamePart::Identifier(ident)) => Ok(ident.value.clone()),
        _ => Err(SqlError::Unsupported("object name form")),
    }
}

/// Convert a subquery AST into the minimal owned [`Select`] tree: result
/// list, source-table names and WHERE expression.
fn lower_query(ctx: &mut ParseCtx<'_>, query: &Query) -> Result<Select> {
    lower_set_expr(ctx, query.body.as_ref())
}

fn lower_set_expr(ctx: &mut ParseCtx<'_>, body: &SetExpr) -> Result<Select> {
    let SetExpr::Select(select) = body else {
        return Err(SqlError::Unsupported("compound subquery"));
    };
    lower_select(ctx, select)
}

fn lower_select(ctx: &mut ParseCtx<'_>, select: &SqlSelect) -> Result<Select> {
    let distinct = match &select.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(Distinct::On(_)) => return Err(SqlError::Unsupported("DISTINCT ON")),
    };
    let mut from = Vec::new();
    for table in &select.from {
        if !table.joins.is_empty() {
            return Err(SqlError::Unsupported("joined subquery"));
        }
        let TableFactor::Table { name, .. } = &table.relation else {
            return Err(SqlError::Unsupported("subquery source form"));
        };
        from.push(object_name_last_ident(name)?);
    }
    let mut result = ExprList::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                let lowered = lower(ctx, expr)?;
                ctx.pool.list_append(&mut result, lowered, None);
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                let lowered = lower(ctx, expr)?;
                ctx.pool.list_append(&mut result, lowered, Some(alias.value.as_str()));
            }
            _ => return Err(SqlError::Unsupported("subquery projection form")),
        }
    }
    let where_expr = select.selection.as_ref().map(|e| lower(ctx, e)).transpose()?;
    Ok(Select { result, from, where_expr, distinct })
}

fn binary_op(op: &BinaryOperator) -> Result<BinOp> {
    Ok(match op {
        BinaryOperator::Plus => BinOp::Add,
        BinaryOperator::Minus => BinOp::Sub,
        BinaryOperator::Multiply => BinOp::Mul,
        BinaryOperator::Divide => BinOp::Div,
        BinaryOperator::Modulo => BinOp::Rem,
        BinaryOperator::StringConcat => BinOp::Concat,
        BinaryOperator::Gt => BinOp::Gt,
        BinaryOperator::Lt => BinOp::Lt,
        BinaryOperator::GtEq => BinOp::Ge,
        BinaryOperator::LtEq => BinOp::Le,
        BinaryOperator::Eq => BinOp::Eq,
        BinaryOperator::NotEq => BinOp::Ne,
        BinaryOperator::And => BinOp::And,
        BinaryOperator::Or => BinOp::Or,
        BinaryOperator::BitwiseAnd => BinOp::BitAnd,
        BinaryOperator::BitwiseOr => BinOp::BitOr,
        BinaryOperator::PGBitwiseShiftLeft => BinOp::ShiftLeft,
        BinaryOperator::PGBitwiseShiftRight => BinOp::ShiftRight,
        _ => return Err(SqlError::Unsupported("binary operator")),
    })
}
