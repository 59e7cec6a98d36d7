//! Dialect-aware SQL statement splitter
//!
//! Splits the text of a migration file into individual statements. The lexer
//! tracks quoting, escaping and comment syntax, so a `;` inside a string
//! literal, a quoted identifier, a comment or a dollar-quoted body never ends
//! a statement. Bodies of `CREATE TRIGGER/PROCEDURE/FUNCTION/EVENT` written
//! as `BEGIN ... END` blocks are kept in one piece.
//!
//! All delimiters are ASCII, so the lexer walks bytes; multi-byte UTF-8
//! sequences never match a delimiter and every slice boundary is a char
//! boundary.

use thiserror::Error;

/// Lexical features of an engine's SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lexicon {
    /// `\'` escapes a quote inside string literals (MySQL)
    pub backslash_escapes: bool,
    /// `E'...'` strings honour backslash escapes (Postgres, DuckDB)
    pub escape_string_prefix: bool,
    /// `$$ ... $$` and `$tag$ ... $tag$` bodies
    pub dollar_quotes: bool,
    /// `/* /* */ */` nests
    pub nested_block_comments: bool,
    /// `#` starts a line comment
    pub hash_comments: bool,
    /// `` `name` `` identifiers
    pub backtick_identifiers: bool,
    /// `[name]` identifiers
    pub bracket_identifiers: bool,
}

impl Lexicon {
    pub const ANSI: Lexicon = Lexicon {
        backslash_escapes: false,
        escape_string_prefix: false,
        dollar_quotes: false,
        nested_block_comments: false,
        hash_comments: false,
        backtick_identifiers: false,
        bracket_identifiers: false,
    };

    pub const POSTGRES: Lexicon = Lexicon {
        escape_string_prefix: true,
        dollar_quotes: true,
        nested_block_comments: true,
        ..Lexicon::ANSI
    };

    pub const DUCKDB: Lexicon = Lexicon::POSTGRES;

    pub const SQLITE: Lexicon = Lexicon {
        backtick_identifiers: true,
        bracket_identifiers: true,
        ..Lexicon::ANSI
    };

    pub const MYSQL: Lexicon = Lexicon {
        backslash_escapes: true,
        hash_comments: true,
        backtick_identifiers: true,
        ..Lexicon::ANSI
    };
}

/// One executable statement of a migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Zero-based position in the file
    pub index: usize,
    /// One-based line of the statement's first token
    pub line: usize,
    /// Statement text without the terminating `;`
    pub sql: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    #[error("unterminated {what} starting at line {line}")]
    Unterminated { what: &'static str, line: usize },
}

/// Split `sql` into statements using the lexical rules of `lexicon`.
///
/// Fragments holding only whitespace and comments are dropped.
pub fn split_statements(sql: &str, lexicon: &Lexicon) -> Result<Vec<Statement>, SplitError> {
    Lexer::new(sql, *lexicon).run()
}

/// Words that introduce a routine whose body may contain `;`
const ROUTINE_KEYWORDS: &[&str] = &["TRIGGER", "PROCEDURE", "FUNCTION", "EVENT"];

/// Words allowed between `CREATE` and the routine keyword
const CREATE_MODIFIERS: &[&str] = &[
    "OR",
    "REPLACE",
    "TEMP",
    "TEMPORARY",
    "CONSTRAINT",
    "AGGREGATE",
];

/// `DEFINER=user@host` spans at most two unquoted words
const DEFINER_WORDS: usize = 2;

/// `END <word>` closers whose opener is not tracked
const UNTRACKED_CLOSERS: &[&str] = &["IF", "LOOP", "WHILE", "REPEAT"];

/// Where the lexer is within a statement's leading `CREATE ...` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    /// No word read yet
    Start,
    /// After `CREATE` and any modifiers
    Create,
    /// Inside a `DEFINER=` clause, counting its words
    Definer(usize),
    /// Routine header seen; `BEGIN`/`CASE`/`END` nesting is tracked
    Routine,
    /// Any other statement
    Plain,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    lexicon: Lexicon,
    pos: usize,
    line: usize,
    /// Byte offset and line of the current statement's first token
    code_start: Option<(usize, usize)>,
    header: Header,
    depth: usize,
    statements: Vec<Statement>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, lexicon: Lexicon) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            lexicon,
            pos: 0,
            line: 1,
            code_start: None,
            header: Header::Start,
            depth: 0,
            statements: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Statement>, SplitError> {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            let next = self.bytes.get(self.pos + 1).copied();
            match b {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'\'' => {
                    self.mark_code();
                    self.skip_quoted(b'\'', self.lexicon.backslash_escapes, "string literal")?;
                }
                b'"' => {
                    self.mark_code();
                    self.skip_quoted(b'"', self.lexicon.backslash_escapes, "quoted identifier")?;
                }
                b'`' if self.lexicon.backtick_identifiers => {
                    self.mark_code();
                    self.skip_quoted(b'`', false, "quoted identifier")?;
                }
                b'[' if self.lexicon.bracket_identifiers => {
                    self.mark_code();
                    self.skip_quoted(b']', false, "bracketed identifier")?;
                }
                b'-' if next == Some(b'-') => self.skip_line_comment(),
                b'#' if self.lexicon.hash_comments => self.skip_line_comment(),
                b'/' if next == Some(b'*') => self.skip_block_comment()?,
                b'$' if self.lexicon.dollar_quotes => {
                    self.mark_code();
                    match self.dollar_tag() {
                        Some(tag_len) => self.skip_dollar_quoted(tag_len)?,
                        None => self.pos += 1,
                    }
                }
                b';' => {
                    if self.depth == 0 {
                        self.finish(self.pos);
                    }
                    self.pos += 1;
                }
                b'E' | b'e' if self.lexicon.escape_string_prefix && next == Some(b'\'') => {
                    self.mark_code();
                    self.pos += 1;
                    self.skip_quoted(b'\'', true, "string literal")?;
                }
                _ if is_word_start(b) => {
                    self.mark_code();
                    self.read_word();
                }
                _ if b.is_ascii_whitespace() => self.pos += 1,
                _ => {
                    self.mark_code();
                    self.pos += 1;
                }
            }
        }
        self.finish(self.bytes.len());
        Ok(self.statements)
    }

    fn mark_code(&mut self) {
        if self.code_start.is_none() {
            self.code_start = Some((self.pos, self.line));
        }
    }

    fn finish(&mut self, end: usize) {
        if let Some((offset, line)) = self.code_start.take() {
            let sql = self.src[offset..end].trim_end();
            self.statements.push(Statement {
                index: self.statements.len(),
                line,
                sql: sql.to_string(),
            });
        }
        self.header = Header::Start;
        self.depth = 0;
    }

    /// Skip a quoted section opened at `self.pos` and closed by `close`.
    /// A doubled closing character is an escaped one.
    fn skip_quoted(&mut self, close: u8, escapes: bool, what: &'static str) -> Result<(), SplitError> {
        let start_line = self.line;
        self.pos += 1;
        while self.pos < self.bytes.len() {
            let c = self.bytes[self.pos];
            if escapes && c == b'\\' {
                if self.bytes.get(self.pos + 1) == Some(&b'\n') {
                    self.line += 1;
                }
                self.pos += 2;
                continue;
            }
            if c == b'\n' {
                self.line += 1;
            }
            if c == close {
                if self.bytes.get(self.pos + 1) == Some(&close) {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                return Ok(());
            }
            self.pos += 1;
        }
        Err(SplitError::Unterminated {
            what,
            line: start_line,
        })
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), SplitError> {
        let start_line = self.line;
        let mut nesting = 1;
        self.pos += 2;
        while self.pos < self.bytes.len() {
            let c = self.bytes[self.pos];
            let next = self.bytes.get(self.pos + 1).copied();
            if c == b'/' && next == Some(b'*') && self.lexicon.nested_block_comments {
                nesting += 1;
                self.pos += 2;
            } else if c == b'*' && next == Some(b'/') {
                nesting -= 1;
                self.pos += 2;
                if nesting == 0 {
                    return Ok(());
                }
            } else {
                if c == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            }
        }
        Err(SplitError::Unterminated {
            what: "block comment",
            line: start_line,
        })
    }

    /// Length of a `$tag$` opener at `self.pos`, if there is one.
    /// `$1` style parameters are not tags.
    fn dollar_tag(&self) -> Option<usize> {
        let mut end = self.pos + 1;
        match self.bytes.get(end) {
            Some(b'$') => return Some(2),
            Some(&c) if is_word_start(c) => {}
            _ => return None,
        }
        while let Some(&c) = self.bytes.get(end) {
            if c == b'$' {
                return Some(end - self.pos + 1);
            }
            if !is_tag_char(c) {
                return None;
            }
            end += 1;
        }
        None
    }

    fn skip_dollar_quoted(&mut self, tag_len: usize) -> Result<(), SplitError> {
        let tag = &self.src[self.pos..self.pos + tag_len];
        let body_start = self.pos + tag_len;
        match self.src[body_start..].find(tag) {
            Some(offset) => {
                let end = body_start + offset + tag_len;
                self.line += self.src[self.pos..end].matches('\n').count();
                self.pos = end;
                Ok(())
            }
            None => Err(SplitError::Unterminated {
                what: "dollar-quoted string",
                line: self.line,
            }),
        }
    }

    fn read_word(&mut self) {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_word_char(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let word = self.src[start..self.pos].to_ascii_uppercase();

        match self.header {
            Header::Routine => {}
            Header::Plain => return,
            state => {
                self.header = next_header(state, &word);
                return;
            }
        }
        match word.as_str() {
            "BEGIN" | "CASE" => self.depth += 1,
            "END" => {
                let closer = self.peek_word();
                if !UNTRACKED_CLOSERS.contains(&closer.as_str()) {
                    self.depth = self.depth.saturating_sub(1);
                }
            }
            _ => {}
        }
    }

    /// Upper-cased word following the current position, skipping spaces
    fn peek_word(&self) -> String {
        let mut at = self.pos;
        while at < self.bytes.len() && self.bytes[at].is_ascii_whitespace() {
            at += 1;
        }
        let start = at;
        while at < self.bytes.len() && is_word_char(self.bytes[at]) {
            at += 1;
        }
        self.src[start..at].to_ascii_uppercase()
    }
}

/// Advance the header state by one word
fn next_header(state: Header, word: &str) -> Header {
    match state {
        Header::Start if word == "CREATE" => Header::Create,
        Header::Create | Header::Definer(_) if ROUTINE_KEYWORDS.contains(&word) => {
            Header::Routine
        }
        Header::Create if CREATE_MODIFIERS.contains(&word) => Header::Create,
        Header::Create if word == "DEFINER" => Header::Definer(0),
        Header::Definer(n) if n < DEFINER_WORDS => Header::Definer(n + 1),
        _ => Header::Plain,
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_word_char(b: u8) -> bool {
    is_word_start(b) || b.is_ascii_digit() || b == b'$'
}

fn is_tag_char(b: u8) -> bool {
    is_word_start(b) || b.is_ascii_digit()
}
