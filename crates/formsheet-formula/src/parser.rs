//! Formula tokenizer and parser
//!
//! Tokens carry their byte span in the formula text, so reference tokens can
//! be rewritten in place (see [`crate::dependency::requalify_formula`]).
//! The parser is a recursive descent parser with spreadsheet operator
//! precedence, run over the token stream.

use crate::ast::{BinaryOperator, CellReference, FormulaExpr, RangeReference, UnaryOperator};
use crate::error::{FormulaError, FormulaResult};
use formsheet_core::coordinate::scope_eq;
use formsheet_core::{CellAddress, CellRange};
use std::ops::Range;

/// Token types
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    String(String),
    Boolean(bool),
    Error(String),

    /// Cell or range reference, optionally scope-qualified
    Reference(ReferenceToken),
    /// Function name or defined name
    Identifier(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Percent,
    Ampersand,
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Colon,
    Comma,

    // Delimiters
    LeftParen,
    RightParen,
}

/// A reference as written in a formula
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceToken {
    /// Unquoted scope name from the prefix, if any
    pub sheet: Option<String>,
    pub start: CellAddress,
    /// Second corner for a range reference
    pub end: Option<CellAddress>,
}

impl ReferenceToken {
    /// Addresses covered by the reference, row by row
    pub fn cells(&self) -> Vec<CellAddress> {
        match self.end {
            Some(end) => CellRange::new(self.start, end).cells().collect(),
            None => vec![self.start],
        }
    }
}

/// A token and the byte range it occupies in the formula text
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
}

/// Split formula text into tokens
///
/// A leading `=` is optional and skipped. Spans index into `formula` itself.
///
/// ```rust
/// use formsheet_formula::parser::{tokenize, TokenKind};
///
/// let tokens = tokenize("='Annual report'!B7*2").unwrap();
/// assert_eq!(tokens.len(), 3);
/// assert_eq!(tokens[0].span, 1..19);
/// assert!(matches!(tokens[0].kind, TokenKind::Reference(_)));
/// ```
pub fn tokenize(formula: &str) -> FormulaResult<Vec<Token>> {
    let mut lexer = Lexer::new(formula);
    lexer.skip_whitespace();
    if lexer.peek_char() == Some('=') {
        lexer.advance();
    }

    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

/// Parse a formula string into an AST
///
/// # Example
/// ```rust
/// use formsheet_formula::parse_formula;
///
/// let ast = parse_formula("=1+2").unwrap();
/// let ast = parse_formula("=SUM(A1:A10)").unwrap();
/// let ast = parse_formula("=IF(Форма1!A1>0,\"Yes\",\"No\")").unwrap();
/// ```
pub fn parse_formula(formula: &str) -> FormulaResult<FormulaExpr> {
    let trimmed = formula.trim();
    if !trimmed.starts_with('=') {
        return Err(FormulaError::Parse("Formula must start with '='".into()));
    }

    let tokens = tokenize(trimmed)?;
    let mut parser = FormulaParser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;

    // Make sure we consumed all input
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(FormulaError::Parse(format!(
            "Unexpected characters after expression: '{}'",
            &trimmed[token.span.start..]
        )));
    }

    Ok(expr)
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn next_token(&mut self) -> FormulaResult<Option<Token>> {
        self.skip_whitespace();

        let start = self.pos;
        let Some(c) = self.peek_char() else {
            return Ok(None);
        };

        let single = match c {
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '^' => Some(TokenKind::Caret),
            '%' => Some(TokenKind::Percent),
            '&' => Some(TokenKind::Ampersand),
            ':' => Some(TokenKind::Colon),
            ',' => Some(TokenKind::Comma),
            '(' => Some(TokenKind::LeftParen),
            ')' => Some(TokenKind::RightParen),
            '=' => Some(TokenKind::Equal),
            _ => None,
        };

        let kind = if let Some(kind) = single {
            self.advance();
            kind
        } else if c == '<' {
            self.advance();
            match self.peek_char() {
                Some('=') => {
                    self.advance();
                    TokenKind::LessEqual
                }
                Some('>') => {
                    self.advance();
                    TokenKind::NotEqual
                }
                _ => TokenKind::LessThan,
            }
        } else if c == '>' {
            self.advance();
            if self.peek_char() == Some('=') {
                self.advance();
                TokenKind::GreaterEqual
            } else {
                TokenKind::GreaterThan
            }
        } else if c == '"' {
            self.scan_string()?
        } else if c.is_ascii_digit()
            || (c == '.' && self.peek_char_at(1).map_or(false, |c| c.is_ascii_digit()))
        {
            self.scan_number()?
        } else if c == '#' {
            self.scan_error()
        } else if c == '\'' {
            let sheet = self.scan_quoted_sheet()?;
            self.scan_reference(Some(sheet))?
        } else if is_word_start(c) {
            self.scan_word()?
        } else {
            return Err(self.error(format!("unexpected character '{}'", c)));
        };

        Ok(Some(Token {
            kind,
            span: start..self.pos,
        }))
    }

    fn scan_string(&mut self) -> FormulaResult<TokenKind> {
        let start = self.pos;
        self.advance(); // Skip opening quote

        let mut s = String::new();
        loop {
            match self.peek_char() {
                Some('"') if self.peek_char_at(1) == Some('"') => {
                    s.push('"');
                    self.advance();
                    self.advance();
                }
                Some('"') => {
                    self.advance();
                    return Ok(TokenKind::String(s));
                }
                Some(c) => {
                    s.push(c);
                    self.advance();
                }
                None => {
                    return Err(FormulaError::Tokenize {
                        position: start,
                        message: "unterminated string literal".into(),
                    })
                }
            }
        }
    }

    fn scan_number(&mut self) -> FormulaResult<TokenKind> {
        let start = self.pos;

        self.skip_digits();
        if self.peek_char() == Some('.') {
            self.advance();
            self.skip_digits();
        }

        // Exponent part
        if matches!(self.peek_char(), Some('e' | 'E')) {
            self.advance();
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.advance();
            }
            self.skip_digits();
        }

        let text = &self.input[start..self.pos];
        text.parse()
            .map(TokenKind::Number)
            .map_err(|_| FormulaError::Tokenize {
                position: start,
                message: format!("invalid number '{}'", text),
            })
    }

    fn scan_error(&mut self) -> TokenKind {
        let start = self.pos;
        self.advance();
        while self
            .peek_char()
            .map_or(false, |c| c.is_ascii_alphanumeric() || c == '/' || c == '?')
        {
            self.advance();
        }
        if self.peek_char() == Some('!') {
            self.advance();
        }
        TokenKind::Error(self.input[start..self.pos].to_string())
    }

    fn scan_quoted_sheet(&mut self) -> FormulaResult<String> {
        let start = self.pos;
        self.advance(); // Skip opening quote

        let mut name = String::new();
        loop {
            match self.peek_char() {
                Some('\'') if self.peek_char_at(1) == Some('\'') => {
                    name.push('\'');
                    self.advance();
                    self.advance();
                }
                Some('\'') => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    name.push(c);
                    self.advance();
                }
                None => {
                    return Err(FormulaError::Tokenize {
                        position: start,
                        message: "unterminated sheet name".into(),
                    })
                }
            }
        }

        if self.peek_char() != Some('!') {
            return Err(self.error("expected '!' after quoted sheet name".into()));
        }
        self.advance();
        Ok(name)
    }

    /// Identifier, boolean, or (possibly prefixed) reference
    fn scan_word(&mut self) -> FormulaResult<TokenKind> {
        let word = self.take_word();

        if self.peek_char() == Some('!') {
            self.advance();
            return self.scan_reference(Some(word.to_string()));
        }

        let followed_by_paren = self.peek_char() == Some('(');
        if !followed_by_paren {
            if word.eq_ignore_ascii_case("TRUE") {
                return Ok(TokenKind::Boolean(true));
            }
            if word.eq_ignore_ascii_case("FALSE") {
                return Ok(TokenKind::Boolean(false));
            }
            // LOG10(100) is a function call, not a cell
            if let Ok(start) = CellAddress::parse(word) {
                let end = self.scan_range_end(None);
                return Ok(TokenKind::Reference(ReferenceToken {
                    sheet: None,
                    start,
                    end,
                }));
            }
        }

        Ok(TokenKind::Identifier(word.to_string()))
    }

    /// The address part after a `Sheet!` prefix
    fn scan_reference(&mut self, sheet: Option<String>) -> FormulaResult<TokenKind> {
        let at = self.pos;
        let word = self.take_word();
        let start = CellAddress::parse(word).map_err(|_| FormulaError::Tokenize {
            position: at,
            message: format!("expected cell reference after sheet prefix, got '{}'", word),
        })?;
        let end = self.scan_range_end(sheet.as_deref());
        Ok(TokenKind::Reference(ReferenceToken { sheet, start, end }))
    }

    /// Consume `:B2` (or `:Sheet!B2` naming the same sheet) if present
    fn scan_range_end(&mut self, sheet: Option<&str>) -> Option<CellAddress> {
        if self.peek_char() != Some(':') {
            return None;
        }
        let checkpoint = self.pos;
        self.advance();

        let mut word = self.take_word();
        if self.peek_char() == Some('!') {
            let same_sheet = sheet.map_or(false, |s| scope_eq(s, word));
            if !same_sheet {
                self.pos = checkpoint;
                return None;
            }
            self.advance();
            word = self.take_word();
        }

        match CellAddress::parse(word) {
            Ok(end) if self.peek_char() != Some('(') => Some(end),
            _ => {
                self.pos = checkpoint;
                None
            }
        }
    }

    fn take_word(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek_char().map_or(false, is_word_char) {
            self.advance();
        }
        &self.input[start..self.pos]
    }

    fn skip_digits(&mut self) {
        while self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
    }

    fn error(&self, message: String) -> FormulaError {
        FormulaError::Tokenize {
            position: self.pos,
            message,
        }
    }

    // === Helper methods ===

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(offset)
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().map_or(false, |c| c.is_whitespace()) {
            self.advance();
        }
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '.'
}

/// Formula parser over a token stream
struct FormulaParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl FormulaParser {
    fn current_token(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn consume(&mut self) -> Option<TokenKind> {
        let token = self.tokens.get(self.pos).map(|t| t.kind.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &TokenKind) -> FormulaResult<()> {
        if self.current_token() == Some(expected) {
            self.consume();
            Ok(())
        } else {
            Err(FormulaError::Parse(format!(
                "Expected {:?}, got {:?}",
                expected,
                self.current_token()
            )))
        }
    }

    // === Expression parsing with precedence ===
    // Precedence (lowest to highest):
    // 1. Comparison: =, <>, <, <=, >, >=
    // 2. Concatenation: &
    // 3. Addition/Subtraction: +, -
    // 4. Multiplication/Division: *, /
    // 5. Exponentiation: ^
    // 6. Unary: -, %
    // 7. Primary: literals, references, function calls, parentheses

    fn parse_expression(&mut self) -> FormulaResult<FormulaExpr> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> FormulaResult<FormulaExpr> {
        let mut left = self.parse_concatenation()?;

        loop {
            let op = match self.current_token() {
                Some(TokenKind::Equal) => BinaryOperator::Equal,
                Some(TokenKind::NotEqual) => BinaryOperator::NotEqual,
                Some(TokenKind::LessThan) => BinaryOperator::LessThan,
                Some(TokenKind::LessEqual) => BinaryOperator::LessEqual,
                Some(TokenKind::GreaterThan) => BinaryOperator::GreaterThan,
                Some(TokenKind::GreaterEqual) => BinaryOperator::GreaterEqual,
                _ => break,
            };

            self.consume();
            let right = self.parse_concatenation()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_concatenation(&mut self) -> FormulaResult<FormulaExpr> {
        let mut left = self.parse_additive()?;

        while matches!(self.current_token(), Some(TokenKind::Ampersand)) {
            self.consume();
            let right = self.parse_additive()?;
            left = binary(BinaryOperator::Concat, left, right);
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> FormulaResult<FormulaExpr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.current_token() {
                Some(TokenKind::Plus) => BinaryOperator::Add,
                Some(TokenKind::Minus) => BinaryOperator::Subtract,
                _ => break,
            };

            self.consume();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> FormulaResult<FormulaExpr> {
        let mut left = self.parse_exponent()?;

        loop {
            let op = match self.current_token() {
                Some(TokenKind::Star) => BinaryOperator::Multiply,
                Some(TokenKind::Slash) => BinaryOperator::Divide,
                _ => break,
            };

            self.consume();
            let right = self.parse_exponent()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_exponent(&mut self) -> FormulaResult<FormulaExpr> {
        let left = self.parse_unary()?;

        if matches!(self.current_token(), Some(TokenKind::Caret)) {
            self.consume();
            let right = self.parse_exponent()?; // Right associative
            return Ok(binary(BinaryOperator::Power, left, right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> FormulaResult<FormulaExpr> {
        match self.current_token() {
            Some(TokenKind::Minus) => {
                self.consume();
                let operand = self.parse_unary()?;
                return Ok(FormulaExpr::UnaryOp {
                    op: UnaryOperator::Negate,
                    operand: Box::new(operand),
                });
            }
            Some(TokenKind::Plus) => {
                self.consume();
                return self.parse_unary();
            }
            _ => {}
        }

        let mut expr = self.parse_primary()?;

        while matches!(self.current_token(), Some(TokenKind::Percent)) {
            self.consume();
            expr = FormulaExpr::UnaryOp {
                op: UnaryOperator::Percent,
                operand: Box::new(expr),
            };
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> FormulaResult<FormulaExpr> {
        let token = self
            .consume()
            .ok_or_else(|| FormulaError::Parse("Unexpected end of formula".into()))?;

        match token {
            TokenKind::Number(n) => Ok(FormulaExpr::Number(n)),
            TokenKind::String(s) => Ok(FormulaExpr::String(s)),
            TokenKind::Boolean(b) => Ok(FormulaExpr::Boolean(b)),
            TokenKind::Error(e) => Ok(FormulaExpr::Error(e)),

            TokenKind::LeftParen => {
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RightParen)?;
                Ok(expr)
            }

            TokenKind::Reference(reference) => Ok(match reference.end {
                Some(end) => FormulaExpr::RangeRef(RangeReference {
                    sheet: reference.sheet,
                    range: CellRange::new(reference.start, end),
                }),
                None => FormulaExpr::CellRef(CellReference {
                    sheet: reference.sheet,
                    address: reference.start,
                }),
            }),

            TokenKind::Identifier(name) => {
                if matches!(self.current_token(), Some(TokenKind::LeftParen)) {
                    self.parse_function_call(name)
                } else {
                    Ok(FormulaExpr::NameRef(name))
                }
            }

            other => Err(FormulaError::Parse(format!(
                "Unexpected token: {:?}",
                other
            ))),
        }
    }

    fn parse_function_call(&mut self, name: String) -> FormulaResult<FormulaExpr> {
        self.expect(&TokenKind::LeftParen)?;

        let mut args = Vec::new();

        if !matches!(self.current_token(), Some(TokenKind::RightParen)) {
            args.push(self.parse_expression()?);

            while matches!(self.current_token(), Some(TokenKind::Comma)) {
                self.consume();
                args.push(self.parse_expression()?);
            }
        }

        self.expect(&TokenKind::RightParen)?;

        Ok(FormulaExpr::Function {
            name: name.to_uppercase(),
            args,
        })
    }
}

fn binary(op: BinaryOperator, left: FormulaExpr, right: FormulaExpr) -> FormulaExpr {
    FormulaExpr::BinaryOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cell(sheet: Option<&str>, a1: &str) -> FormulaExpr {
        FormulaExpr::CellRef(CellReference {
            sheet: sheet.map(str::to_string),
            address: CellAddress::parse(a1).unwrap(),
        })
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse_formula("=42").unwrap(), FormulaExpr::Number(42.0));
        assert_eq!(parse_formula("=1e3").unwrap(), FormulaExpr::Number(1000.0));
        assert_eq!(
            parse_formula("=\"Hello \"\"World\"\"\"").unwrap(),
            FormulaExpr::String("Hello \"World\"".into())
        );
        assert_eq!(parse_formula("=true").unwrap(), FormulaExpr::Boolean(true));
        assert_eq!(
            parse_formula("=#DIV/0!").unwrap(),
            FormulaExpr::Error("#DIV/0!".into())
        );
    }

    #[test]
    fn test_parse_precedence() {
        let ast = parse_formula("=1+2*3").unwrap();
        assert_eq!(
            ast,
            binary(
                BinaryOperator::Add,
                FormulaExpr::Number(1.0),
                binary(
                    BinaryOperator::Multiply,
                    FormulaExpr::Number(2.0),
                    FormulaExpr::Number(3.0)
                )
            )
        );

        let ast = parse_formula("=2^3^2").unwrap();
        assert_eq!(
            ast,
            binary(
                BinaryOperator::Power,
                FormulaExpr::Number(2.0),
                binary(
                    BinaryOperator::Power,
                    FormulaExpr::Number(3.0),
                    FormulaExpr::Number(2.0)
                )
            )
        );
    }

    #[test]
    fn test_parse_references() {
        assert_eq!(parse_formula("=$A$1").unwrap(), cell(None, "A1"));
        assert_eq!(parse_formula("=Форма1!B2").unwrap(), cell(Some("Форма1"), "B2"));
        assert_eq!(
            parse_formula("='It''s here'!C3").unwrap(),
            cell(Some("It's here"), "C3")
        );
        assert_eq!(
            parse_formula("=Data!B2:A1").unwrap(),
            FormulaExpr::RangeRef(RangeReference {
                sheet: Some("Data".into()),
                range: CellRange::parse("A1:B2").unwrap(),
            })
        );
    }

    #[test]
    fn test_parse_function() {
        let ast = parse_formula("=sum(A1:A3, 4)").unwrap();
        match ast {
            FormulaExpr::Function { name, args } => {
                assert_eq!(name, "SUM");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected function, got {:?}", other),
        }

        // A cell-shaped name followed by '(' is a function
        assert!(matches!(
            parse_formula("=LOG10(100)").unwrap(),
            FormulaExpr::Function { .. }
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_formula("1+2").is_err());
        assert!(parse_formula("=1+").is_err());
        assert!(parse_formula("=(1+2").is_err());
        assert!(parse_formula("=1 2").is_err());
        assert!(parse_formula("=Sheet1!").is_err());
    }

    #[test]
    fn test_tokenize_spans() {
        let formula = "= Form2!A1:B2 + 'My sheet'!C3";
        let tokens = tokenize(formula).unwrap();
        let spans: Vec<&str> = tokens.iter().map(|t| &formula[t.span.clone()]).collect();
        assert_eq!(spans, vec!["Form2!A1:B2", "+", "'My sheet'!C3"]);
    }

    #[test]
    fn test_tokenize_range_on_other_sheet_is_not_merged() {
        let tokens = tokenize("=A1:Other!B2").unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[1].kind, TokenKind::Colon);
    }

    #[test]
    fn test_tokenize_failures() {
        assert!(tokenize("=\"open").is_err());
        assert!(tokenize("='open!A1").is_err());
        assert!(tokenize("=A1 @ B1").is_err());
        assert!(tokenize("=Form1!Total").is_err());
    }
}
