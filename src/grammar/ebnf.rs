//! GBNF-flavoured EBNF front end.
//!
//! Rules are `name ::= body`. Bodies combine quoted strings (with `\n`,
//! `\xHH`, `\uHHHH` escapes), bracketed classes, rule names, grouping and
//! `|`. Postfix `* + ?` and `{n}`, `{n,}`, `{n,m}` repeat the preceding
//! element; `(= ...)` after a body is a lookahead. `#` starts a comment.
//!
//! Every failure is reported as [`Error::Parse`] with a line/column position.

use crate::config::DepthGuard;
use crate::error::{bail, err, Error, Result};

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

/// Largest repetition bound accepted in `{n,m}`.
const MAX_REPETITION_BOUND: i64 = 1 << 24;

fn hex_digit(c: u8) -> Option<u32> {
    (c as char).to_digit(16)
}

/// Characters that may be escaped inside `[...]` in addition to the common set.
const CHAR_CLASS_ESCAPES: &[u8] = b"^$\\.*+?()[]{}|/-";

/// Parse an escape sequence starting at `\`. Returns `(codepoint, bytes_consumed)`.
fn parse_escape(data: &[u8], in_char_class: bool) -> std::result::Result<(u32, usize), String> {
    let Some(&c) = data.get(1) else {
        return Err("unterminated escape sequence".into());
    };
    if in_char_class && CHAR_CLASS_ESCAPES.contains(&c) {
        return Ok((c as u32, 2));
    }
    let simple = match c {
        b'\'' | b'"' | b'?' | b'\\' => Some(c as u32),
        b'a' => Some(0x07),
        b'b' => Some(0x08),
        b'f' => Some(0x0C),
        b'n' => Some(0x0A),
        b'r' => Some(0x0D),
        b't' => Some(0x09),
        b'v' => Some(0x0B),
        b'0' => Some(0x00),
        b'e' => Some(0x1B),
        _ => None,
    };
    if let Some(cp) = simple {
        return Ok((cp, 2));
    }

    // \x takes any number of hex digits, \u exactly 4, \U exactly 8.
    let (min_digits, max_digits) = match c {
        b'x' => (1, 8),
        b'u' => (4, 4),
        b'U' => (8, 8),
        _ => return Err(format!("invalid escape sequence: \\{}", c as char)),
    };
    let mut cp = 0u32;
    let mut len = 0;
    while len < max_digits {
        match data.get(2 + len).copied().and_then(hex_digit) {
            Some(d) => {
                cp = cp.wrapping_mul(16).wrapping_add(d);
                len += 1;
            }
            None => break,
        }
    }
    if len < min_digits {
        return Err(format!(
            "invalid \\{} escape: expected {} hex digits",
            c as char, min_digits
        ));
    }
    Ok((cp, 2 + len))
}

/// Parse the next UTF-8 char or escape sequence. Returns `(codepoint, bytes_consumed)`.
fn parse_next_char(data: &[u8], in_char_class: bool) -> std::result::Result<(u32, usize), String> {
    match data.first() {
        None => Err("unexpected end of input".into()),
        Some(b'\\') => parse_escape(data, in_char_class),
        Some(_) => {
            let width = utf8_width(data[0]);
            let chunk = data.get(..width).ok_or("invalid UTF-8 sequence")?;
            let s = std::str::from_utf8(chunk).map_err(|_| "invalid UTF-8 sequence")?;
            let c = s.chars().next().ok_or("invalid UTF-8 sequence")?;
            Ok((c as u32, width))
        }
    }
}

fn utf8_width(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

// ─── Tokens ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenType {
    RuleName(String),
    Identifier(String),
    StringLiteral(String),
    LBracket,
    RBracket,
    Caret,
    CharInCharClass(u32),
    Dash,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Pipe,
    Star,
    Plus,
    Question,
    LookaheadLParen,
    IntegerLiteral(i64),
    Comma,
    EndOfFile,
}

#[derive(Debug, Clone)]
struct Token {
    ty: TokenType,
    line: usize,
    col: usize,
}

// Lexer

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<u8> {
        self.input.get(self.pos + delta).copied()
    }

    fn advance(&mut self) {
        if let Some(b) = self.peek() {
            if b == b'\n' || (b == b'\r' && self.peek_at(1) != Some(b'\n')) {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn advance_n(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn push(&mut self, ty: TokenType, line: usize, col: usize) {
        self.tokens.push(Token { ty, line, col });
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\n' | b'\r' => self.advance(),
                b'#' => {
                    while !matches!(self.peek(), None | Some(b'\n') | Some(b'\r')) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn err(&self, msg: &str) -> Error {
        err!(
            Parse,
            "EBNF lexer error at line {}, column {}: {}",
            self.line,
            self.col,
            msg
        )
    }

    fn is_name_char(c: u8, is_first: bool) -> bool {
        c == b'_' || c == b'-' || c == b'.' || c.is_ascii_alphabetic() || (!is_first && c.is_ascii_digit())
    }

    fn lex_identifier(&mut self) -> String {
        let start = self.pos;
        let mut first = true;
        while let Some(c) = self.peek() {
            if !Self::is_name_char(c, first) {
                break;
            }
            self.advance();
            first = false;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn lex_string(&mut self) -> Result<TokenType> {
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.err("unterminated string literal"));
                }
                Some(b'"') => break,
                Some(_) => {
                    let (cp, len) =
                        parse_next_char(&self.input[self.pos..], false).map_err(|e| self.err(&e))?;
                    let c = char::from_u32(cp)
                        .ok_or_else(|| self.err(&format!("invalid codepoint: U+{:04X}", cp)))?;
                    self.advance_n(len);
                    value.push(c);
                }
            }
        }
        self.advance(); // closing quote
        Ok(TokenType::StringLiteral(value))
    }

    fn lex_char_class(&mut self) -> Result<()> {
        self.push(TokenType::LBracket, self.line, self.col);
        self.advance();

        if self.peek() == Some(b'^') {
            self.push(TokenType::Caret, self.line, self.col);
            self.advance();
        }

        loop {
            let (line, col) = (self.line, self.col);
            match self.peek() {
                None => return Err(self.err("unterminated character class")),
                Some(b']') => break,
                Some(b'\r') | Some(b'\n') => {
                    return Err(self.err("character class should not contain newline"));
                }
                Some(b'-') => {
                    self.push(TokenType::Dash, line, col);
                    self.advance();
                }
                Some(_) => {
                    let (cp, len) =
                        parse_next_char(&self.input[self.pos..], true).map_err(|e| self.err(&e))?;
                    self.advance_n(len);
                    self.push(TokenType::CharInCharClass(cp), line, col);
                }
            }
        }

        self.push(TokenType::RBracket, self.line, self.col);
        self.advance();
        Ok(())
    }

    fn lex_integer(&mut self) -> Result<TokenType> {
        let mut num: i64 = 0;
        while let Some(c) = self.peek().filter(u8::is_ascii_digit) {
            num = num * 10 + (c - b'0') as i64;
            if num > MAX_REPETITION_BOUND {
                return Err(self.err("integer too large"));
            }
            self.advance();
        }
        Ok(TokenType::IntegerLiteral(num))
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        loop {
            self.skip_whitespace_and_comments();
            let (line, col) = (self.line, self.col);

            let Some(c) = self.peek() else {
                self.push(TokenType::EndOfFile, line, col);
                break;
            };

            let single = match c {
                b'(' if self.peek_at(1) == Some(b'=') => {
                    self.advance();
                    Some(TokenType::LookaheadLParen)
                }
                b'(' => Some(TokenType::LParen),
                b')' => Some(TokenType::RParen),
                b'{' => Some(TokenType::LBrace),
                b'}' => Some(TokenType::RBrace),
                b'|' => Some(TokenType::Pipe),
                b',' => Some(TokenType::Comma),
                b'*' => Some(TokenType::Star),
                b'+' => Some(TokenType::Plus),
                b'?' => Some(TokenType::Question),
                _ => None,
            };
            if let Some(ty) = single {
                self.advance();
                self.push(ty, line, col);
                continue;
            }

            match c {
                b':' => {
                    if self.peek_at(1) != Some(b':') || self.peek_at(2) != Some(b'=') {
                        return Err(self.err("unexpected character ':'"));
                    }
                    self.advance_n(3);
                    self.push(TokenType::Assign, line, col);
                }
                b'"' => {
                    let ty = self.lex_string()?;
                    self.push(ty, line, col);
                }
                b'[' => self.lex_char_class()?,
                c if Self::is_name_char(c, true) => {
                    let name = self.lex_identifier();
                    self.push(TokenType::Identifier(name), line, col);
                }
                c if c.is_ascii_digit() => {
                    let ty = self.lex_integer()?;
                    self.push(ty, line, col);
                }
                c => return Err(self.err(&format!("unexpected character: '{}'", c as char))),
            }
        }

        let mut tokens = self.tokens;
        mark_rule_names(&mut tokens)?;
        Ok(tokens)
    }
}

/// Turn every identifier directly followed by `::=` into a rule name.
fn mark_rule_names(tokens: &mut [Token]) -> Result<()> {
    for i in 0..tokens.len() {
        if tokens[i].ty != TokenType::Assign {
            continue;
        }
        let at = if i == 0 { &tokens[i] } else { &tokens[i - 1] };
        let (line, col) = (at.line, at.col);
        if i == 0 {
            bail!(Parse, "EBNF parser error at line {}, column {}: ::= should not be the first token", line, col);
        }
        let TokenType::Identifier(name) = &tokens[i - 1].ty else {
            bail!(Parse, "EBNF parser error at line {}, column {}: ::= should be preceded by an identifier", line, col);
        };
        if i >= 2 && tokens[i - 2].line == line {
            bail!(
                Parse,
                "EBNF parser error at line {}, column {}: rule name should be at the beginning of the line",
                line,
                col
            );
        }
        tokens[i - 1].ty = TokenType::RuleName(name.clone());
    }
    Ok(())
}

// Parser

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    builder: GrammarBuilder,
    cur_rule_name: String,
    aux_rule_counter: usize,
    depth: DepthGuard,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            builder: GrammarBuilder::new(),
            cur_rule_name: String::new(),
            aux_rule_counter: 0,
            depth: DepthGuard::new(),
        }
    }

    fn peek(&self) -> &TokenType {
        &self.tokens[self.pos].ty
    }

    fn peek_next(&self) -> Option<&TokenType> {
        self.tokens.get(self.pos + 1).map(|t| &t.ty)
    }

    fn consume(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: TokenType, msg: &str) -> Result<()> {
        if *self.peek() != expected {
            return Err(self.parse_error(msg));
        }
        self.consume();
        Ok(())
    }

    fn parse_error(&self, msg: &str) -> Error {
        let tok = &self.tokens[self.pos];
        err!(
            Parse,
            "EBNF parser error at line {}, column {}: {}",
            tok.line,
            tok.col,
            msg
        )
    }

    /// Collect all rule names up front so rules can reference each other
    /// regardless of definition order.
    fn init_rule_names(&mut self, root_rule_name: &str) -> Result<()> {
        for tok in &self.tokens {
            if let TokenType::RuleName(name) = &tok.ty {
                if self.builder.find_rule(name).is_some() {
                    bail!(
                        Parse,
                        "EBNF parser error at line {}, column {}: rule \"{}\" is defined multiple times",
                        tok.line,
                        tok.col,
                        name
                    );
                }
                self.builder.add_rule(name);
            }
        }
        if self.builder.find_rule(root_rule_name).is_none() {
            bail!(Parse, "EBNF parser error: root rule \"{}\" is not found", root_rule_name);
        }
        Ok(())
    }

    fn class_char(&self, ty: &TokenType) -> Option<u32> {
        match ty {
            TokenType::CharInCharClass(cp) => Some(*cp),
            TokenType::Dash => Some(b'-' as u32),
            _ => None,
        }
    }

    fn parse_char_class(&mut self) -> Result<ExprId> {
        self.expect(TokenType::LBracket, "expected [")?;

        let negated = *self.peek() == TokenType::Caret;
        if negated {
            self.consume();
        }

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        while !matches!(self.peek(), TokenType::RBracket | TokenType::EndOfFile) {
            let Some(lo) = self.class_char(self.peek()) else {
                return Err(self.parse_error("unexpected token in character class"));
            };
            self.consume();

            let range_hi = match (self.peek(), self.peek_next()) {
                (TokenType::Dash, Some(next)) => self.class_char(next),
                _ => None,
            };
            match range_hi {
                Some(hi) => {
                    self.consume();
                    self.consume();
                    if lo > hi {
                        return Err(self.parse_error(
                            "invalid character class: lower bound is larger than upper bound",
                        ));
                    }
                    ranges.push((lo, hi));
                }
                None => ranges.push((lo, lo)),
            }
        }

        self.expect(TokenType::RBracket, "expected ]")?;
        Ok(self.builder.add_character_class(negated, ranges))
    }

    fn parse_element(&mut self) -> Result<ExprId> {
        match self.peek().clone() {
            TokenType::LParen => {
                self.consume();
                if *self.peek() == TokenType::RParen {
                    self.consume();
                    return Ok(self.builder.add_empty_string());
                }
                let expr = self.parse_choices()?;
                self.expect(TokenType::RParen, "expected )")?;
                Ok(expr)
            }
            TokenType::LBracket => self.parse_char_class(),
            TokenType::StringLiteral(value) => {
                self.consume();
                if value.is_empty() {
                    Ok(self.builder.add_empty_string())
                } else {
                    Ok(self.builder.add_byte_string(value.as_bytes()))
                }
            }
            TokenType::Identifier(name) => match self.builder.find_rule(&name) {
                Some(rule_id) => {
                    self.consume();
                    Ok(self.builder.add_rule_ref(rule_id))
                }
                None => Err(self.parse_error(&format!("rule \"{}\" is not defined", name))),
            },
            other => Err(self.parse_error(&format!("expected element, got {:?}", other))),
        }
    }

    fn parse_integer(&mut self) -> Result<i64> {
        match *self.peek() {
            TokenType::IntegerLiteral(n) => {
                self.consume();
                Ok(n)
            }
            _ => Err(self.parse_error("expected integer")),
        }
    }

    /// Parse `{n}`, `{n,}` or `{n,m}`. An open upper bound is `None`.
    fn parse_repetition_range(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect(TokenType::LBrace, "expected {")?;
        let lower = self.parse_integer()?;

        match self.peek() {
            TokenType::RBrace => {
                self.consume();
                Ok((lower as u32, Some(lower as u32)))
            }
            TokenType::Comma => {
                self.consume();
                if *self.peek() == TokenType::RBrace {
                    self.consume();
                    return Ok((lower as u32, None));
                }
                let upper = self.parse_integer()?;
                if upper < lower {
                    return Err(self.parse_error("lower bound is larger than upper bound"));
                }
                self.expect(TokenType::RBrace, "expected }")?;
                Ok((lower as u32, Some(upper as u32)))
            }
            _ => Err(self.parse_error("expected ',' or '}' in repetition range")),
        }
    }

    /// Return the rule an expression refers to, wrapping anything that is not
    /// a plain rule reference in a fresh auxiliary rule.
    fn wrap_in_rule(&mut self, expr_id: ExprId) -> RuleId {
        if let Expr::RuleRef(rid) = self.builder.exprs[expr_id.0 as usize] {
            return rid;
        }
        let aux_name = loop {
            self.aux_rule_counter += 1;
            let candidate = format!("{}_{}", self.cur_rule_name, self.aux_rule_counter);
            if self.builder.find_rule(&candidate).is_none() {
                break candidate;
            }
        };
        let aux_rule = self.builder.add_rule(&aux_name);
        self.builder.set_rule_body(aux_rule, expr_id);
        aux_rule
    }

    fn apply_quantifier(&mut self, expr_id: ExprId, min: u32, max: Option<u32>) -> ExprId {
        if (min, max) == (0, None) {
            if let Expr::CharacterClass { negated, ranges } = &self.builder.exprs[expr_id.0 as usize] {
                let (negated, ranges) = (*negated, ranges.clone());
                return self.builder.add_character_class_star(negated, ranges);
            }
        }
        let rule_id = self.wrap_in_rule(expr_id);
        self.builder.add_repeat(rule_id, min, max)
    }

    fn parse_element_with_quantifier(&mut self) -> Result<ExprId> {
        let expr = self.parse_element()?;

        let (min, max) = match self.peek() {
            TokenType::Star => (0, None),
            TokenType::Plus => (1, None),
            TokenType::Question => (0, Some(1)),
            TokenType::LBrace => {
                let (min, max) = self.parse_repetition_range()?;
                return Ok(self.apply_quantifier(expr, min, max));
            }
            _ => return Ok(expr),
        };
        self.consume();
        Ok(self.apply_quantifier(expr, min, max))
    }

    fn parse_sequence(&mut self) -> Result<ExprId> {
        let mut elements = Vec::new();
        loop {
            elements.push(self.parse_element_with_quantifier()?);
            if matches!(
                self.peek(),
                TokenType::Pipe
                    | TokenType::RParen
                    | TokenType::LookaheadLParen
                    | TokenType::RuleName(_)
                    | TokenType::EndOfFile
            ) {
                break;
            }
        }
        Ok(self.builder.add_sequence(elements))
    }

    fn parse_choices(&mut self) -> Result<ExprId> {
        if !self.depth.enter() {
            return Err(self.parse_error(&format!(
                "maximum recursion depth {} exceeded",
                self.depth.max()
            )));
        }

        let mut choices = vec![self.parse_sequence()?];
        while *self.peek() == TokenType::Pipe {
            self.consume();
            choices.push(self.parse_sequence()?);
        }

        self.depth.exit();
        Ok(self.builder.add_choices(choices))
    }

    fn parse_rule(&mut self) -> Result<()> {
        let TokenType::RuleName(name) = self.peek().clone() else {
            return Err(self.parse_error("expected rule name"));
        };
        self.consume();
        self.expect(TokenType::Assign, "expected ::=")?;
        self.cur_rule_name = name.clone();
        self.aux_rule_counter = 0;

        let body = self.parse_choices()?;
        let rule_id = self
            .builder
            .find_rule(&name)
            .ok_or_else(|| self.parse_error(&format!("rule \"{}\" is not defined", name)))?;
        self.builder.set_rule_body(rule_id, body);

        if *self.peek() == TokenType::LookaheadLParen {
            self.consume();
            let la_expr = self.parse_choices()?;
            self.expect(TokenType::RParen, "expected )")?;
            self.builder.set_rule_lookahead(rule_id, la_expr, false);
        }

        Ok(())
    }

    fn parse(mut self, root_rule_name: &str) -> Result<Grammar> {
        self.init_rule_names(root_rule_name)?;

        while *self.peek() != TokenType::EndOfFile {
            self.parse_rule()?;
        }

        let root = self
            .builder
            .find_rule(root_rule_name)
            .ok_or_else(|| err!(Parse, "EBNF parser error: root rule \"{}\" is not found", root_rule_name))?;
        self.builder
            .build_with_root(root)
            .map_err(|e| err!(Parse, "EBNF parser error: {}", e))
    }
}

/// Quote `s` as an EBNF string literal that parses back to exactly `s`.
pub(crate) fn quote_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Control characters all fit in four hex digits.
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl Grammar {
    /// Parse EBNF text; `root_rule_name` must name one of its rules.
    ///
    /// ```
    /// use pie_grammar::Grammar;
    ///
    /// let grammar = Grammar::from_ebnf("root ::= digit+\ndigit ::= [0-9]", "root").unwrap();
    /// assert_eq!(grammar.root().name, "root");
    /// assert!(grammar.find_rule("digit").is_some());
    /// ```
    pub fn from_ebnf(source: &str, root_rule_name: &str) -> Result<Grammar> {
        let tokens = Lexer::new(source).tokenize()?;
        let grammar = Parser::new(tokens).parse(root_rule_name)?;
        tracing::debug!(
            rules = grammar.num_rules(),
            exprs = grammar.num_exprs(),
            "parsed EBNF grammar"
        );
        Ok(grammar)
    }
}
