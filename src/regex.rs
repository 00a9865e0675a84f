//! Regex-to-grammar converter.
//!
//! Converts a regular expression pattern to an EBNF grammar string, then
//! parses it into a [`Grammar`]. Matching is always whole-string, so the
//! anchors `^` and `$` are accepted and ignored. Escapes and `.` follow
//! JavaScript semantics.
//!
//! # Supported features
//! - Literals, character classes `[a-z]`, negated `[^...]`
//! - Quantifiers: `*`, `+`, `?`, `{n}`, `{n,}`, `{n,m}` (lazy `?` suffix ignored)
//! - Groups: `(...)`, `(?:...)`, `(?<name>...)`
//! - Alternation: `|`
//! - Escapes: `\d`, `\w`, `\s`, `\D`, `\W`, `\S`, `\uXXXX`, `\u{XXXXX}`, `\xHH`
//! - Any char: `.` (everything but line terminators)
//!
//! # Unsupported (errors)
//! - Lookahead/lookbehind: `(?=...)`, `(?!...)`, `(?<=...)`, `(?<!...)`
//! - Backreferences: `\1`, `\k<name>`
//! - Unicode properties: `\p{...}`, `\P{...}`
//! - Word boundaries: `\b`, `\B`

use std::fmt::Write;

use crate::config::DepthGuard;
use crate::error::{Error, Result};
use crate::grammar::ebnf::quote_literal;
use crate::grammar::Grammar;

const MAX_CODEPOINT: u32 = 0x10FFFF;

/// Convert a regex pattern to a Grammar with a single root rule.
///
/// ```
/// use pie_grammar::regex::regex_to_grammar;
///
/// let grammar = regex_to_grammar("[a-z]+").unwrap();
/// assert_eq!(grammar.root().name, "root");
/// ```
pub fn regex_to_grammar(pattern: &str) -> Result<Grammar> {
    let ebnf = regex_to_ebnf(pattern)?;
    Grammar::from_ebnf(&ebnf, "root")
}

/// Convert a regex pattern to an EBNF grammar string of the form
/// `root ::= ...\n`.
pub fn regex_to_ebnf(pattern: &str) -> Result<String> {
    let body = RegexConverter::new(pattern).convert()?;
    Ok(format!("root ::= {}\n", body))
}

impl Grammar {
    /// Build a grammar accepting exactly the strings matched by `pattern`.
    pub fn from_regex(pattern: &str) -> Result<Grammar> {
        let grammar = regex_to_grammar(pattern)?;
        tracing::debug!(pattern, rules = grammar.num_rules(), "converted regex to grammar");
        Ok(grammar)
    }
}

/// Sorted, non-overlapping codepoint ranges.
#[derive(Debug, Default, Clone)]
struct CharSet {
    ranges: Vec<(u32, u32)>,
}

impl CharSet {
    fn from_ranges(ranges: &[(u32, u32)]) -> Self {
        let mut set = CharSet::default();
        for &(lo, hi) in ranges {
            set.add(lo, hi);
        }
        set
    }

    fn add(&mut self, lo: u32, hi: u32) {
        self.ranges.push((lo, hi));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(lo, hi) in &self.ranges {
            match merged.last_mut() {
                Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        self.ranges = merged;
    }

    fn union(&mut self, other: &CharSet) {
        for &(lo, hi) in &other.ranges {
            self.add(lo, hi);
        }
    }

    fn complement(&self) -> CharSet {
        let mut out = Vec::new();
        let mut next = 0u32;
        for &(lo, hi) in &self.ranges {
            if lo > next {
                out.push((next, lo - 1));
            }
            next = hi + 1;
        }
        if next <= MAX_CODEPOINT {
            out.push((next, MAX_CODEPOINT));
        }
        CharSet { ranges: out }
    }

    /// Render as an EBNF character class.
    fn to_ebnf(&self, negated: bool) -> String {
        let mut s = String::from("[");
        if negated {
            s.push('^');
        }
        for &(lo, hi) in &self.ranges {
            push_class_char(&mut s, lo);
            if hi != lo {
                s.push('-');
                push_class_char(&mut s, hi);
            }
        }
        s.push(']');
        s
    }
}

const DIGIT: &[(u32, u32)] = &[(0x30, 0x39)];
const WORD: &[(u32, u32)] = &[(0x30, 0x39), (0x41, 0x5A), (0x5F, 0x5F), (0x61, 0x7A)];
const SPACE: &[(u32, u32)] = &[
    (0x09, 0x0D),
    (0x20, 0x20),
    (0xA0, 0xA0),
    (0x1680, 0x1680),
    (0x2000, 0x200A),
    (0x2028, 0x2029),
    (0x202F, 0x202F),
    (0x205F, 0x205F),
    (0x3000, 0x3000),
    (0xFEFF, 0xFEFF),
];
const LINE_TERMINATORS: &[(u32, u32)] = &[(0x0A, 0x0A), (0x0D, 0x0D), (0x2028, 0x2029)];

fn push_class_char(out: &mut String, cp: u32) {
    match char::from_u32(cp) {
        Some(c) if matches!(c, '\\' | ']' | '[' | '^' | '-') => {
            out.push('\\');
            out.push(c);
        }
        Some(c) if c.is_ascii_graphic() || c == ' ' => out.push(c),
        _ => push_unicode_escape(out, cp),
    }
}

fn push_unicode_escape(out: &mut String, cp: u32) {
    if cp <= 0xFFFF {
        let _ = write!(out, "\\u{:04x}", cp);
    } else {
        let _ = write!(out, "\\U{:08x}", cp);
    }
}

fn quote_codepoint(cp: u32) -> String {
    match char::from_u32(cp) {
        Some(c) => quote_literal(c.encode_utf8(&mut [0u8; 4])),
        // Lone surrogates can never appear in UTF-8 text.
        None => "[^\\U00000000-\\U0010ffff]".to_string(),
    }
}

/// One parsed escape: either a single codepoint or a predefined class.
enum Escape {
    Char(u32),
    Class(CharSet),
}

struct RegexConverter {
    input: Vec<char>,
    pos: usize,
    depth: DepthGuard,
}

impl RegexConverter {
    fn new(pattern: &str) -> Self {
        Self {
            input: pattern.chars().collect(),
            pos: 0,
            depth: DepthGuard::new(),
        }
    }

    fn err(&self, msg: impl std::fmt::Display) -> Error {
        Error::Parse(format!("regex error at position {}: {}", self.pos, msg))
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<char> {
        self.input.get(self.pos + delta).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.advance() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.err(format!("expected '{}'", expected))),
        }
    }

    fn convert(&mut self) -> Result<String> {
        let result = self.parse_alternation()?;
        if let Some(c) = self.peek() {
            return Err(self.err(format!("unexpected character '{}'", c)));
        }
        Ok(if result.is_empty() { "\"\"".to_string() } else { result })
    }

    /// `a|b|c`, rendered without surrounding parentheses.
    fn parse_alternation(&mut self) -> Result<String> {
        if !self.depth.enter() {
            return Err(self.err(format!("nesting exceeds the maximum depth {}", self.depth.max())));
        }
        let mut alternatives = vec![self.parse_sequence()?];
        while self.peek() == Some('|') {
            self.advance();
            alternatives.push(self.parse_sequence()?);
        }
        self.depth.exit();

        if alternatives.len() == 1 {
            return Ok(alternatives.swap_remove(0));
        }
        let parts: Vec<String> = alternatives
            .into_iter()
            .map(|a| if a.is_empty() { "\"\"".to_string() } else { a })
            .collect();
        Ok(parts.join(" | "))
    }

    fn parse_sequence(&mut self) -> Result<String> {
        let mut segments = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '|' | ')' => break,
                '^' | '$' => {
                    self.advance();
                }
                _ => {
                    let atom = self.parse_atom()?;
                    let quantified = self.parse_quantifier(atom)?;
                    segments.push(quantified);
                }
            }
        }
        Ok(segments.join(" "))
    }

    fn parse_quantifier(&mut self, atom: String) -> Result<String> {
        let suffix = match self.peek() {
            Some(q @ ('*' | '+' | '?')) => {
                self.advance();
                q.to_string()
            }
            Some('{') if self.looks_like_repetition() => match self.parse_repetition()? {
                (min, Some(max)) if min == max => format!("{{{}}}", min),
                (min, Some(max)) => format!("{{{},{}}}", min, max),
                (min, None) => format!("{{{},}}", min),
            },
            _ => return Ok(atom),
        };
        // Lazy quantifiers match the same language.
        if self.peek() == Some('?') {
            self.advance();
        }
        if matches!(self.peek(), Some('*' | '+' | '?')) || (self.peek() == Some('{') && self.looks_like_repetition()) {
            return Err(self.err("consecutive quantifiers are not supported"));
        }
        Ok(format!("{}{}", atom, suffix))
    }

    /// In JavaScript a `{` that does not start a valid bound is a literal.
    fn looks_like_repetition(&self) -> bool {
        let mut i = self.pos + 1;
        let digits = |i: &mut usize| {
            let start = *i;
            while self.input.get(*i).is_some_and(|c| c.is_ascii_digit()) {
                *i += 1;
            }
            *i > start
        };
        if !digits(&mut i) {
            return false;
        }
        if self.input.get(i) == Some(&',') {
            i += 1;
            digits(&mut i);
        }
        self.input.get(i) == Some(&'}')
    }

    /// `{n}`, `{n,}` or `{n,m}`.
    fn parse_repetition(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect('{')?;
        let min = self.read_int()?;
        let max = if self.peek() == Some(',') {
            self.advance();
            if self.peek() == Some('}') {
                None
            } else {
                Some(self.read_int()?)
            }
        } else {
            Some(min)
        };
        self.expect('}')?;
        if max.is_some_and(|m| m < min) {
            return Err(self.err(format!("repetition range {{{},{}}} is out of order", min, max.unwrap_or(0))));
        }
        Ok((min, max))
    }

    fn read_int(&mut self) -> Result<u32> {
        let mut n: u32 = 0;
        let mut any = false;
        while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(d))
                .ok_or_else(|| self.err("repetition bound too large"))?;
            self.advance();
            any = true;
        }
        if !any {
            return Err(self.err("expected integer in repetition"));
        }
        Ok(n)
    }

    fn parse_atom(&mut self) -> Result<String> {
        match self.peek() {
            Some('(') => self.parse_group(),
            Some('[') => self.parse_char_class(),
            Some('.') => {
                self.advance();
                Ok(CharSet::from_ranges(LINE_TERMINATORS).to_ebnf(true))
            }
            Some('\\') => match self.parse_escape()? {
                Escape::Char(cp) => Ok(quote_codepoint(cp)),
                Escape::Class(set) => Ok(set.to_ebnf(false)),
            },
            Some(c @ ('*' | '+' | '?')) => Err(self.err(format!("nothing to repeat before '{}'", c))),
            Some('{') if self.looks_like_repetition() => Err(self.err("nothing to repeat before '{'")),
            Some(c) => {
                self.advance();
                Ok(quote_codepoint(c as u32))
            }
            None => Err(self.err("unexpected end of pattern")),
        }
    }

    fn parse_group(&mut self) -> Result<String> {
        self.expect('(')?;
        if self.peek() == Some('?') {
            self.advance();
            match self.advance() {
                Some(':') => {}
                Some('=') | Some('!') => return Err(self.err("lookahead assertions are not supported")),
                Some('<') if matches!(self.peek(), Some('=') | Some('!')) => {
                    return Err(self.err("lookbehind assertions are not supported"));
                }
                Some('<') => loop {
                    match self.advance() {
                        Some('>') => break,
                        Some(_) => {}
                        None => return Err(self.err("unterminated group name")),
                    }
                },
                _ => return Err(self.err("unsupported group modifier")),
            }
        }

        let inner = self.parse_alternation()?;
        if self.peek() != Some(')') {
            return Err(self.err("unmatched '('"));
        }
        self.advance();
        Ok(if inner.is_empty() { "\"\"".to_string() } else { format!("({})", inner) })
    }

    fn parse_char_class(&mut self) -> Result<String> {
        self.expect('[')?;
        let negated = self.peek() == Some('^');
        if negated {
            self.advance();
        }

        let mut set = CharSet::default();
        loop {
            let lo = match self.peek() {
                None => return Err(self.err("unclosed character class")),
                Some(']') => break,
                Some('\\') => match self.parse_escape_in_class()? {
                    Escape::Char(cp) => cp,
                    Escape::Class(class) => {
                        set.union(&class);
                        continue;
                    }
                },
                Some(c) => {
                    self.advance();
                    c as u32
                }
            };

            if self.peek() == Some('-') && !matches!(self.peek_at(1), Some(']') | None) {
                self.advance();
                let hi = match self.peek() {
                    Some('\\') => match self.parse_escape_in_class()? {
                        Escape::Char(cp) => cp,
                        Escape::Class(_) => return Err(self.err("character class escape cannot end a range")),
                    },
                    Some(c) => {
                        self.advance();
                        c as u32
                    }
                    None => return Err(self.err("unclosed character class")),
                };
                if lo > hi {
                    return Err(self.err("range out of order in character class"));
                }
                set.add(lo, hi);
            } else {
                set.add(lo, lo);
            }
        }
        self.advance();

        if set.ranges.is_empty() {
            // `[]` matches nothing and `[^]` matches anything.
            return Ok(if negated {
                CharSet::default().complement().to_ebnf(false)
            } else {
                CharSet::from_ranges(&[(0, MAX_CODEPOINT)]).to_ebnf(true)
            });
        }
        Ok(set.to_ebnf(negated))
    }

    fn parse_escape_in_class(&mut self) -> Result<Escape> {
        if self.peek_at(1) == Some('b') {
            self.pos += 2;
            return Ok(Escape::Char(0x08));
        }
        if self.peek_at(1) == Some('-') {
            self.pos += 2;
            return Ok(Escape::Char('-' as u32));
        }
        self.parse_escape()
    }

    fn parse_escape(&mut self) -> Result<Escape> {
        self.expect('\\')?;
        let Some(c) = self.advance() else {
            return Err(self.err("pattern ends with a lone backslash"));
        };
        let esc = match c {
            'd' => Escape::Class(CharSet::from_ranges(DIGIT)),
            'D' => Escape::Class(CharSet::from_ranges(DIGIT).complement()),
            'w' => Escape::Class(CharSet::from_ranges(WORD)),
            'W' => Escape::Class(CharSet::from_ranges(WORD).complement()),
            's' => Escape::Class(CharSet::from_ranges(SPACE)),
            'S' => Escape::Class(CharSet::from_ranges(SPACE).complement()),
            'n' => Escape::Char(0x0A),
            'r' => Escape::Char(0x0D),
            't' => Escape::Char(0x09),
            'f' => Escape::Char(0x0C),
            'v' => Escape::Char(0x0B),
            '0' if !self.peek().is_some_and(|c| c.is_ascii_digit()) => Escape::Char(0),
            'b' | 'B' => return Err(self.err("word boundaries (\\b, \\B) are not supported")),
            'p' | 'P' => return Err(self.err("unicode property escapes (\\p, \\P) are not supported")),
            '1'..='9' | 'k' => return Err(self.err("backreferences are not supported")),
            'c' => match self.advance() {
                Some(l) if l.is_ascii_alphabetic() => Escape::Char(l as u32 % 32),
                _ => return Err(self.err("invalid control escape")),
            },
            'x' => Escape::Char(self.read_hex(2)?),
            'u' if self.peek() == Some('{') => {
                self.advance();
                let mut cp = 0u32;
                let mut len = 0;
                while let Some(d) = self.peek().and_then(|c| c.to_digit(16)) {
                    cp = cp.saturating_mul(16).saturating_add(d);
                    len += 1;
                    self.advance();
                }
                if len == 0 || self.advance() != Some('}') {
                    return Err(self.err("invalid unicode escape"));
                }
                if cp > MAX_CODEPOINT {
                    return Err(self.err(format!("codepoint {:#x} is out of range", cp)));
                }
                Escape::Char(cp)
            }
            'u' => Escape::Char(self.read_hex(4)?),
            c if c.is_ascii_alphanumeric() => {
                return Err(self.err(format!("invalid escape sequence \\{}", c)));
            }
            c => Escape::Char(c as u32),
        };
        Ok(esc)
    }

    fn read_hex(&mut self, count: usize) -> Result<u32> {
        let mut cp = 0u32;
        for _ in 0..count {
            match self.advance().and_then(|c| c.to_digit(16)) {
                Some(d) => cp = cp * 16 + d,
                None => return Err(self.err("expected hex digit")),
            }
        }
        Ok(cp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn body(pattern: &str) -> String {
        let ebnf = regex_to_ebnf(pattern).unwrap();
        ebnf.trim_start_matches("root ::= ").trim_end().to_string()
    }

    #[test]
    fn test_literals_and_anchors() {
        assert_eq!(body("^ab$"), "\"a\" \"b\"");
        assert_eq!(body(""), "\"\"");
    }

    #[test]
    fn test_quantifiers() {
        assert_eq!(body("a{2,4}"), "\"a\"{2,4}");
        assert_eq!(body("a{3}"), "\"a\"{3}");
        assert_eq!(body("a{3,}?"), "\"a\"{3,}");
        assert_eq!(body("(ab)+"), "(\"a\" \"b\")+");
    }

    #[test]
    fn test_literal_brace() {
        assert_eq!(body("a{x"), "\"a\" \"{\" \"x\"");
    }

    #[test]
    fn test_classes() {
        assert_eq!(body("[a-c_]"), "[_a-c]");
        assert_eq!(body("[^\\d]"), "[^0-9]");
        assert_eq!(body("\\d"), "[0-9]");
        assert_eq!(body("[\\-\\]]"), "[\\-\\]]");
        assert_eq!(body("."), "[^\\u000a\\u000d\\u2028-\\u2029]");
    }

    #[test]
    fn test_escapes_and_unicode() {
        assert_eq!(body("\\u00e9\\x41\\n"), "\"é\" \"A\" \"\\n\"");
        assert_eq!(body("\\u{1F600}"), "\"😀\"");
        assert_eq!(body("\\.\\\""), "\".\" \"\\\"\"");
    }

    #[test]
    fn test_groups() {
        assert_eq!(body("(?:a|b)c"), "(\"a\" | \"b\") \"c\"");
        assert_eq!(body("(?<year>\\d)"), "([0-9])");
        assert_eq!(body("a||b"), "\"a\" | \"\" | \"b\"");
    }

    #[test]
    fn test_unsupported_features() {
        for pattern in ["(?=a)", "(?<!a)b", "(a)\\1", "\\bword", "\\p{L}", "a**", "(a", "[a-", "*a", "[z-a]"] {
            let e = regex_to_grammar(pattern).unwrap_err();
            assert_eq!(e.kind(), ErrorKind::Parse, "{}", pattern);
            assert!(e.to_string().starts_with("regex error at position"), "{}", e);
        }
    }

    #[test]
    fn test_grammar_parses() {
        let g = Grammar::from_regex("[a-z]+@[a-z]+\\.(com|org)").unwrap();
        assert_eq!(g.root().name, "root");
    }
}
