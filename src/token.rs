use std::borrow::Cow;

/// Byte range of a lexeme within the compile context's source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub len: u32,
}

impl Span {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start: start as u32, len: len as u32 }
    }

    /// The smallest span covering both `self` and `other`.
    pub fn cover(self, other: Span) -> Span {
        let start = self.start.min(other.start);
        let end = (self.start + self.len).max(other.start + other.len);
        Span { start, len: end - start }
    }

    pub fn text(self, src: &str) -> &str {
        let start = self.start as usize;
        let end = start + self.len as usize;
        src.get(start..end).unwrap_or("")
    }
}

/// A lexeme attached to an expression node.
///
/// While the tree borrows from the parse context's source text the token is a
/// `Span`; a deep copy upgrades it to an owned string so the copy's lifetime
/// is disjoint from the source.
#[derive(Clone, Debug, Default)]
pub enum Token {
    #[default]
    None,
    Span(Span),
    Owned(Box<str>),
}

impl Token {
    pub fn owned(text: impl Into<Box<str>>) -> Self {
        Token::Owned(text.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Token::None)
    }

    pub fn text<'a>(&'a self, src: &'a str) -> &'a str {
        match self {
            Token::None => "",
            Token::Span(span) => span.text(src),
            Token::Owned(text) => text,
        }
    }

    /// Materialize the token as an owned copy of its text.
    pub fn to_owned_text(&self, src: &str) -> Token {
        match self {
            Token::None => Token::None,
            _ => Token::Owned(self.text(src).into()),
        }
    }
}

/// Strip one level of SQL quoting, collapsing doubled quote characters.
///
/// Handles `'...'`, `"..."`, backticks and `[...]`; anything else is returned
/// unchanged.
pub fn dequote(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let Some(&quote) = bytes.first() else {
        return Cow::Borrowed(text);
    };
    let close = match quote {
        b'\'' | b'"' | b'`' => quote,
        b'[' => b']',
        _ => return Cow::Borrowed(text),
    };
    if bytes.len() < 2 || bytes[bytes.len() - 1] != close {
        return Cow::Borrowed(text);
    }
    let inner = &text[1..text.len() - 1];
    let close = close as char;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == close && chars.peek() == Some(&close) {
            chars.next();
        }
        out.push(c);
    }
    Cow::Owned(out)
}

pub fn name_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// True for the spellings of the implicit row-identifier column.
pub fn is_row_id_name(name: &str) -> bool {
    name_eq(name, "_ROWID_") || name_eq(name, "ROWID") || name_eq(name, "OID")
}

/// Parse a decimal literal if its value fits in a signed 32-bit integer.
pub fn as_i32(text: &str) -> Option<i32> {
    let rest = text.strip_prefix('-').or_else(|| text.strip_prefix('+')).unwrap_or(text);
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<i64>().ok().and_then(|v| i32::try_from(v).ok())
}
