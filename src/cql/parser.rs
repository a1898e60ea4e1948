//! Hand-rolled CQL tokenizer and shallow statement parser.
//!
//! Understands just enough syntax to classify statements and locate
//! assignment values: quoted identifiers, single-quoted strings with `''`
//! escapes, `--`, `//` and `/* */` comments, bind markers (`?` and
//! `:name`), and balanced bracket nesting. Anything else is carried along
//! as opaque tokens. Parsing never fails; unrecognised structure degrades
//! to a `QueryInfo` without assignments.

use super::{
    Assignment, AssignmentKind, AssignmentsGroup, QueryInfo, StatementType, TableRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    /// Identifier or keyword; `quoted` when written as `"..."`.
    Word { quoted: bool },
    /// Single-quoted string literal, quotes included in the span.
    StringLit,
    Number,
    /// `?` or `:name` bind marker.
    Marker,
    Symbol(char),
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    start: usize,
    end: usize,
}

impl<'a> Token<'a> {
    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.kind, TokenKind::Word { quoted: false }) && self.text.eq_ignore_ascii_case(kw)
    }

    /// Identifier value with CQL normalisation: unquoted identifiers are
    /// lower-cased, quoted ones keep their inner text with `""` unescaped.
    fn identifier_value(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word { quoted: false } => Some(self.text.to_ascii_lowercase()),
            TokenKind::Word { quoted: true } => {
                let inner = &self.text[1..self.text.len() - 1];
                Some(inner.replace("\"\"", "\""))
            }
            _ => None,
        }
    }
}

fn tokenize(src: &str) -> Vec<Token<'_>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'\'' => {
                let end = scan_quoted(bytes, i, b'\'');
                tokens.push(Token {
                    kind: TokenKind::StringLit,
                    text: &src[i..end],
                    start: i,
                    end,
                });
                i = end;
            }
            b'"' => {
                let end = scan_quoted(bytes, i, b'"');
                tokens.push(Token {
                    kind: TokenKind::Word { quoted: true },
                    text: &src[i..end],
                    start: i,
                    end,
                });
                i = end;
            }
            b'?' => {
                tokens.push(Token {
                    kind: TokenKind::Marker,
                    text: &src[i..i + 1],
                    start: i,
                    end: i + 1,
                });
                i += 1;
            }
            b':' if bytes
                .get(i + 1)
                .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_') =>
            {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Marker,
                    text: &src[i..end],
                    start: i,
                    end,
                });
                i = end;
            }
            b'0'..=b'9' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'.')
                {
                    end += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Number,
                    text: &src[i..end],
                    start: i,
                    end,
                });
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric()
                        || bytes[end] == b'_'
                        || bytes[end] >= 0x80)
                {
                    end += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Word { quoted: false },
                    text: &src[i..end],
                    start: i,
                    end,
                });
                i = end;
            }
            _ => {
                tokens.push(Token {
                    kind: TokenKind::Symbol(c as char),
                    text: &src[i..i + 1],
                    start: i,
                    end: i + 1,
                });
                i += 1;
            }
        }
    }

    tokens
}

fn skip_line_comment(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Scan a quoted region starting at `start`; the quote character escapes
/// itself by doubling. An unterminated quote swallows the rest of the text.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    /// `marker_ordinal[i]` = number of bind markers strictly before token i.
    marker_ordinal: Vec<usize>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token<'a>>) -> Parser<'a> {
        let mut marker_ordinal = Vec::with_capacity(tokens.len());
        let mut seen = 0usize;
        for tok in &tokens {
            marker_ordinal.push(seen);
            if tok.kind == TokenKind::Marker {
                seen += 1;
            }
        }
        Parser {
            tokens,
            marker_ordinal,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token<'a>> {
        let tok = self.tokens.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, sym: char) -> bool {
        if self.peek().is_some_and(|t| t.kind == TokenKind::Symbol(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// `ident` or `ident . ident`, with quoting support.
    fn parse_qualified_name(&mut self) -> Option<TableRef> {
        let first = self.peek().copied()?.identifier_value()?;
        self.pos += 1;
        if self.eat_symbol('.') {
            let second = self.peek().copied()?.identifier_value()?;
            self.pos += 1;
            Some(TableRef {
                keyspace: Some(first),
                table: second,
            })
        } else {
            Some(TableRef {
                keyspace: None,
                table: first,
            })
        }
    }

    /// Advance until an unquoted keyword at bracket depth zero; returns
    /// false if the statement ends first. The keyword is not consumed.
    fn skip_until_keyword(&mut self, keywords: &[&str]) -> bool {
        let mut depth = 0i32;
        while let Some(tok) = self.peek() {
            match tok.kind {
                TokenKind::Symbol('(') | TokenKind::Symbol('[') | TokenKind::Symbol('{') => {
                    depth += 1
                }
                TokenKind::Symbol(')') | TokenKind::Symbol(']') | TokenKind::Symbol('}') => {
                    depth -= 1
                }
                _ => {
                    if depth == 0 && keywords.iter().any(|kw| tok.is_keyword(kw)) {
                        return true;
                    }
                }
            }
            self.pos += 1;
        }
        false
    }

    /// Scan one value expression, stopping (without consuming) at a
    /// depth-zero `,`, a closing bracket, or one of `stop_keywords`.
    fn scan_value(&mut self, stop_keywords: &[&str]) -> Option<(AssignmentKind, std::ops::Range<usize>)> {
        let first = self.pos;
        let mut depth = 0i32;

        while let Some(tok) = self.peek() {
            match tok.kind {
                TokenKind::Symbol(',') if depth == 0 => break,
                TokenKind::Symbol(')') | TokenKind::Symbol(']') | TokenKind::Symbol('}')
                    if depth == 0 =>
                {
                    break
                }
                TokenKind::Symbol('(') | TokenKind::Symbol('[') | TokenKind::Symbol('{') => {
                    depth += 1;
                    self.pos += 1;
                }
                TokenKind::Symbol(')') | TokenKind::Symbol(']') | TokenKind::Symbol('}') => {
                    depth -= 1;
                    self.pos += 1;
                }
                _ => {
                    if depth == 0 && stop_keywords.iter().any(|kw| tok.is_keyword(kw)) {
                        break;
                    }
                    self.pos += 1;
                }
            }
        }

        if self.pos == first {
            return None;
        }

        let toks = &self.tokens[first..self.pos];
        let span = toks[0].start..toks[toks.len() - 1].end;

        let kind = if toks.len() == 1 && toks[0].kind == TokenKind::Marker {
            AssignmentKind::BindMarker {
                index: self.marker_ordinal[first],
            }
        } else if toks.len() >= 3
            && matches!(toks[0].kind, TokenKind::Word { quoted: false })
            && toks[1].kind == TokenKind::Symbol('(')
            && toks[toks.len() - 1].kind == TokenKind::Symbol(')')
            && call_is_whole_expression(toks)
        {
            AssignmentKind::FunctionCall {
                name: toks[0].text.to_ascii_lowercase(),
            }
        } else {
            AssignmentKind::Literal
        };

        Some((kind, span))
    }

    fn bind_marker_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Marker)
            .count()
    }
}

/// True when the `(` at index 1 closes exactly at the final token, i.e. the
/// expression is a single call like `now()` rather than `f(x) + 1`.
fn call_is_whole_expression(toks: &[Token<'_>]) -> bool {
    let mut depth = 0i32;
    for (idx, tok) in toks.iter().enumerate().skip(1) {
        match tok.kind {
            TokenKind::Symbol('(') => depth += 1,
            TokenKind::Symbol(')') => {
                depth -= 1;
                if depth == 0 {
                    return idx == toks.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// Parse one CQL text into a `QueryInfo`. Never fails.
pub fn parse_query(cql: &str) -> QueryInfo {
    let mut parser = Parser::new(tokenize(cql));
    let bind_marker_count = parser.bind_marker_count();

    let Some(first) = parser.peek().copied() else {
        return QueryInfo::new(cql.to_string(), StatementType::Other);
    };

    let mut info = if first.is_keyword("SELECT") {
        parse_select(&mut parser, cql)
    } else if first.is_keyword("INSERT") {
        parser.advance();
        let mut info = QueryInfo::new(cql.to_string(), StatementType::Insert);
        if let Some((table, group)) = parse_insert_body(&mut parser) {
            info.table = Some(table);
            info.groups.push(group);
        }
        info
    } else if first.is_keyword("UPDATE") {
        parser.advance();
        let mut info = QueryInfo::new(cql.to_string(), StatementType::Update);
        if let Some((table, group)) = parse_update_body(&mut parser) {
            info.table = Some(table);
            info.groups.push(group);
        }
        info
    } else if first.is_keyword("DELETE") {
        parser.advance();
        let mut info = QueryInfo::new(cql.to_string(), StatementType::Delete);
        info.table = parse_delete_body(&mut parser);
        info
    } else if first.is_keyword("USE") {
        parser.advance();
        let mut info = QueryInfo::new(cql.to_string(), StatementType::Use);
        info.use_keyspace = parser.peek().copied().and_then(|t| t.identifier_value());
        info
    } else if first.is_keyword("BEGIN") {
        parse_batch(&mut parser, cql)
    } else {
        QueryInfo::new(cql.to_string(), StatementType::Other)
    };

    info.bind_marker_count = bind_marker_count;
    info
}

fn parse_select(parser: &mut Parser<'_>, cql: &str) -> QueryInfo {
    parser.advance();
    let mut info = QueryInfo::new(cql.to_string(), StatementType::Select);
    if parser.skip_until_keyword(&["FROM"]) {
        parser.advance();
        info.table = parser.parse_qualified_name();
    }
    info
}

/// `INTO table (cols) VALUES (values) ...`; the INSERT keyword has already
/// been consumed. Returns None when the shape is not recognised (JSON
/// inserts, truncated text), in which case no assignments are reported.
fn parse_insert_body(parser: &mut Parser<'_>) -> Option<(TableRef, AssignmentsGroup)> {
    if !parser.eat_keyword("INTO") {
        return None;
    }
    let table = parser.parse_qualified_name()?;

    if !parser.eat_symbol('(') {
        return None;
    }
    let mut columns = Vec::new();
    loop {
        let column = parser.peek().copied()?.identifier_value()?;
        parser.advance();
        columns.push(column);
        if parser.eat_symbol(',') {
            continue;
        }
        if parser.eat_symbol(')') {
            break;
        }
        return None;
    }

    if !parser.eat_keyword("VALUES") || !parser.eat_symbol('(') {
        return None;
    }
    let mut group = AssignmentsGroup::default();
    for column in columns {
        let (kind, value_span) = parser.scan_value(&[])?;
        group.assignments.push(Assignment {
            column_name: column,
            kind,
            value_span,
        });
        if parser.eat_symbol(',') {
            continue;
        }
        if parser.eat_symbol(')') {
            break;
        }
        return None;
    }

    Some((table, group))
}

/// `table [USING ...] SET a = v, ... [WHERE ...]`; the UPDATE keyword has
/// already been consumed.
fn parse_update_body(parser: &mut Parser<'_>) -> Option<(TableRef, AssignmentsGroup)> {
    let table = parser.parse_qualified_name()?;

    if !parser.skip_until_keyword(&["SET"]) {
        return None;
    }
    parser.advance();

    let mut group = AssignmentsGroup::default();
    loop {
        let column = parser.peek().copied()?.identifier_value()?;
        parser.advance();
        // Element assignments like `col[0] = v` or `col['key'] = v`.
        if parser.eat_symbol('[') {
            let mut depth = 1i32;
            while depth > 0 {
                match parser.advance()?.kind {
                    TokenKind::Symbol('[') => depth += 1,
                    TokenKind::Symbol(']') => depth -= 1,
                    _ => {}
                }
            }
        }
        if !parser.eat_symbol('=') {
            return None;
        }
        let (kind, value_span) = parser.scan_value(&["WHERE", "IF"])?;
        group.assignments.push(Assignment {
            column_name: column,
            kind,
            value_span,
        });
        if !parser.eat_symbol(',') {
            break;
        }
    }

    Some((table, group))
}

/// `[cols] FROM table ...`; the DELETE keyword has already been consumed.
fn parse_delete_body(parser: &mut Parser<'_>) -> Option<TableRef> {
    if !parser.skip_until_keyword(&["FROM"]) {
        return None;
    }
    parser.advance();
    parser.parse_qualified_name()
}

/// `BEGIN [UNLOGGED|COUNTER] BATCH child; ... APPLY BATCH`. Children keep
/// their own assignment groups; bind-marker ordinals run across children.
fn parse_batch(parser: &mut Parser<'_>, cql: &str) -> QueryInfo {
    parser.advance();
    let _ = parser.eat_keyword("UNLOGGED") || parser.eat_keyword("COUNTER");
    let mut info = QueryInfo::new(cql.to_string(), StatementType::Batch);
    if !parser.eat_keyword("BATCH") {
        info.statement_type = StatementType::Other;
        return info;
    }

    loop {
        // Child statements may be separated by semicolons.
        while parser.eat_symbol(';') {}

        let Some(tok) = parser.peek() else { break };
        if tok.is_keyword("APPLY") {
            break;
        } else if tok.is_keyword("INSERT") {
            parser.advance();
            if let Some((_, group)) = parse_insert_body(parser) {
                info.groups.push(group);
            } else {
                break;
            }
        } else if tok.is_keyword("UPDATE") {
            parser.advance();
            if let Some((_, group)) = parse_update_body(parser) {
                info.groups.push(group);
            } else {
                break;
            }
        } else if tok.is_keyword("DELETE") {
            parser.advance();
            parse_delete_body(parser);
        } else {
            break;
        }

        // Consume the child's tail (WHERE/IF/USING clauses) up to the next
        // statement boundary.
        parser.skip_until_keyword(&["INSERT", "UPDATE", "DELETE", "APPLY"]);
    }

    info
}
