use std::fmt;

use crate::token::name_eq;

/// Coarse type an expression or column is treated as for comparison.
///
/// Declared column types collapse to one of these two at schema time; the
/// emitter picks numeric or text comparison opcodes based on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    Numeric,
    Text,
}

impl Affinity {
    /// Affinity of a declared column type, or of a column with no type.
    ///
    /// A type name mentioning character, text, clob or blob storage sorts as
    /// text; everything else (including untyped columns) sorts numerically.
    pub fn from_decl_type(decl: Option<&str>) -> Affinity {
        let Some(decl) = decl else {
            return Affinity::Numeric;
        };
        let lower = decl.to_ascii_lowercase();
        for marker in ["char", "clob", "text", "blob", "str"] {
            if lower.contains(marker) {
                return Affinity::Text;
            }
        }
        Affinity::Numeric
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub name: String,
    pub affinity: Affinity,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, affinity: Affinity) -> Self {
        Self { name: name.into(), affinity }
    }
}

/// Column layout of one source table.
#[derive(Clone, Debug)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Column declared INTEGER PRIMARY KEY, if any; it aliases the row id.
    pub ipk: Option<usize>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self { name: name.into(), columns, ipk: None }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| name_eq(&c.name, name))
    }

    /// Extract the column list of a `CREATE TABLE` statement.
    ///
    /// Only the pieces the resolver needs are pulled out: column names,
    /// declared-type affinity and the INTEGER PRIMARY KEY column. Table-level
    /// constraints are skipped.
    pub fn parse(sql: &str) -> Result<TableSchema, SchemaError> {
        let name = table_name(sql).ok_or(SchemaError::NotCreateTable)?;
        let inner = parenthesized(sql).ok_or(SchemaError::MissingColumnList)?;
        let mut columns = Vec::new();
        let mut ipk = None;
        for part in split_top_level(inner) {
            if is_table_constraint(part) {
                continue;
            }
            let Some((col_name, end)) = identifier(part) else {
                return Err(SchemaError::BadColumnDef);
            };
            let rest = part[end..].trim_start();
            let decl = leading_type_name(rest);
            let affinity = Affinity::from_decl_type(decl.as_deref());
            if decl.as_deref().is_some_and(|t| name_eq(t, "INTEGER"))
                && contains_token_pair(rest, "PRIMARY", "KEY")
            {
                ipk = Some(columns.len());
            }
            columns.push(ColumnDef::new(col_name, affinity));
        }
        if columns.is_empty() {
            return Err(SchemaError::MissingColumnList);
        }
        Ok(TableSchema { name, columns, ipk })
    }
}

/// One entry of the source-table list the resolver binds names against.
#[derive(Clone, Debug)]
pub struct SrcItem {
    pub database: Option<String>,
    pub alias: Option<String>,
    /// Cursor number the bound column reference will read through.
    pub cursor: i32,
    pub db_index: i32,
    pub schema: TableSchema,
}

impl SrcItem {
    pub fn new(schema: TableSchema, cursor: i32) -> Self {
        Self { database: None, alias: None, cursor, db_index: 0, schema }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>, db_index: i32) -> Self {
        self.database = Some(database.into());
        self.db_index = db_index;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SchemaError {
    NotCreateTable,
    MissingColumnList,
    BadColumnDef,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCreateTable => f.write_str("Statement is not CREATE TABLE"),
            Self::MissingColumnList => f.write_str("CREATE TABLE has no column list"),
            Self::BadColumnDef => f.write_str("Malformed column definition"),
        }
    }
}

impl std::error::Error for SchemaError {}

fn table_name(sql: &str) -> Option<String> {
    let mut rest = sql.trim_start();
    for keyword in ["CREATE", "TABLE"] {
        let (word, end) = identifier(rest)?;
        if !name_eq(&word, keyword) {
            return None;
        }
        rest = rest[end..].trim_start();
    }
    let (name, _) = identifier(rest)?;
    Some(name)
}

fn parenthesized(sql: &str) -> Option<&str> {
    let start = sql.find('(')?;
    let end = sql.rfind(')')?;
    (end > start).then(|| &sql[start + 1..end])
}

/// Split on commas that are not nested inside parentheses or quotes.
fn split_top_level(inner: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let bytes = inner.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'[' => quote = Some(b']'),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => {
                    parts.push(inner[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    let tail = inner[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts.into_iter()
}

fn is_table_constraint(part: &str) -> bool {
    // A quoted leading name is always a column, whatever it spells.
    if part.trim_start().starts_with(['"', '`', '[']) {
        return false;
    }
    let Some((word, _)) = identifier(part) else {
        return true;
    };
    ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"]
        .iter()
        .any(|kw| name_eq(&word, kw))
}

/// First identifier of `part`, with its end offset within `part`. Quoted
/// names are dequoted; `None` if `part` does not begin with a name.
fn identifier(part: &str) -> Option<(String, usize)> {
    let trimmed = part.trim_start();
    let lead = part.len() - trimmed.len();
    let first = trimmed.chars().next()?;
    if matches!(first, '"' | '`' | '[') {
        let close = if first == '[' { ']' } else { first };
        let mut out = String::new();
        let mut chars = trimmed.char_indices().skip(1).peekable();
        while let Some((i, c)) = chars.next() {
            if c == close {
                if close != ']' && chars.peek().is_some_and(|&(_, n)| n == close) {
                    chars.next();
                    out.push(close);
                    continue;
                }
                return Some((out, lead + i + close.len_utf8()));
            }
            out.push(c);
        }
        return None;
    }
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let bytes = trimmed.as_bytes();
    let end = bytes
        .iter()
        .position(|&b| !(b.is_ascii_alphanumeric() || b == b'_'))
        .unwrap_or(bytes.len());
    Some((trimmed[..end].to_owned(), lead + end))
}

/// Declared type name at the head of a column-definition tail, stopping at
/// the first constraint keyword. Multi-word types like `DOUBLE PRECISION`
/// report their full spelling; a parenthesized width ends the type.
fn leading_type_name(rest: &str) -> Option<String> {
    let mut names = Vec::new();
    let mut cursor = rest;
    loop {
        let Some((word, end)) = identifier(cursor) else {
            break;
        };
        if is_constraint_keyword(&word) {
            break;
        }
        names.push(word);
        cursor = cursor[end..].trim_start();
        if cursor.starts_with('(') {
            break;
        }
    }
    if names.is_empty() { None } else { Some(names.join(" ")) }
}

fn is_constraint_keyword(word: &str) -> bool {
    [
        "CONSTRAINT",
        "PRIMARY",
        "UNIQUE",
        "NOT",
        "NULL",
        "CHECK",
        "DEFAULT",
        "COLLATE",
        "REFERENCES",
        "GENERATED",
        "AS",
        "ON",
        "AUTOINCREMENT",
    ]
    .iter()
    .any(|kw| name_eq(word, kw))
}

fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = text;
    while !cursor.is_empty() {
        match identifier(cursor) {
            Some((word, end)) => {
                out.push(word);
                cursor = &cursor[end..];
            }
            None => {
                let mut chars = cursor.chars();
                chars.next();
                cursor = chars.as_str();
            }
        }
    }
    out
}

fn contains_token_pair(text: &str, first: &str, second: &str) -> bool {
    words(text)
        .windows(2)
        .any(|pair| name_eq(&pair[0], first) && name_eq(&pair[1], second))
}
