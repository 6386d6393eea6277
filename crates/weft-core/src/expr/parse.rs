//! Lexer and recursive-descent parser for the expression mini-DSL.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr        = and_expr ( "||" and_expr )*
//! and_expr    = comparison ( "&&" comparison )*
//! comparison  = unary ( ("==" | "!=" | ">=" | "<=" | ">" | "<") unary )?
//! unary       = "!" unary | pipeline
//! pipeline    = primary ( "|" ident [ "(" args ")" ] )*
//! primary     = literal | path | "(" expr ")"
//! path        = ident ( "." ident | "[" index-or-key "]" )*
//! ```
//!
//! Identifiers may contain hyphens (step IDs like `deploy-to-prod`), which is
//! unambiguous because the language has no arithmetic operators. The boolean
//! operators have word forms: `and`, `or`, and `not` are interchangeable
//! with `&&`, `||`, and `!`, and are reserved words.

use serde_json::{Number, Value};

use super::{BinaryOp, Call, EvalError, Expr, PathSeg};

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    OrOr,
    AndAnd,
    Not,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

fn lex(src: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    tokens.push(Token::Pipe);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(EvalError::Parse("unexpected '&'".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(EvalError::Parse(
                        "unexpected '='; use '==' for comparison".to_string(),
                    ));
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EvalError::Parse("unterminated string".to_string()));
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&esc @ ('\\' | '\'' | '"')) => s.push(esc),
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                other => {
                                    return Err(EvalError::Parse(format!(
                                        "invalid escape: \\{}",
                                        other.copied().unwrap_or(' ')
                                    )));
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if !matches!(chars.get(i), Some('0'..='9')) {
                        return Err(EvalError::Parse("unexpected '-'".to_string()));
                    }
                }
                while matches!(chars.get(i), Some('0'..='9')) {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') && matches!(chars.get(i + 1), Some('0'..='9')) {
                    i += 1;
                    while matches!(chars.get(i), Some('0'..='9')) {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| EvalError::Parse(format!("invalid number: {text}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while matches!(
                    chars.get(i),
                    Some(ch) if ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'
                ) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    // Word forms of the boolean operators are reserved.
                    "and" => Token::AndAnd,
                    "or" => Token::OrOr,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(EvalError::Parse(format!("unexpected character: {other}")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse an expression string into an AST.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        return Err(EvalError::Parse("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Parse(format!(
            "trailing tokens after expression (at token {})",
            parser.pos
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), EvalError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(EvalError::Parse(format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Lt) => BinaryOp::Lt,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_unary()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            Ok(Expr::Not(Box::new(inner)))
        } else {
            self.parse_pipeline()
        }
    }

    fn parse_pipeline(&mut self) -> Result<Expr, EvalError> {
        let input = self.parse_primary()?;
        let mut calls = Vec::new();
        while self.eat(&Token::Pipe) {
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => {
                    return Err(EvalError::Parse(
                        "expected function name after '|'".to_string(),
                    ));
                }
            };
            let mut args = Vec::new();
            if self.eat(&Token::LParen) {
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(Token::RParen, "')' after function arguments")?;
                        break;
                    }
                }
            }
            calls.push(Call { name, args });
        }
        if calls.is_empty() {
            Ok(input)
        } else {
            Ok(Expr::Pipeline {
                input: Box::new(input),
                calls,
            })
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Some(Token::Number(n)) => {
                let num = Number::from_f64(n)
                    .ok_or_else(|| EvalError::Parse(format!("invalid number: {n}")))?;
                Ok(Expr::Literal(Value::Number(num)))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "closing ')'")?;
                Ok(inner)
            }
            Some(Token::Ident(first)) => {
                let mut segs = vec![PathSeg::Key(first)];
                loop {
                    if self.eat(&Token::Dot) {
                        match self.advance() {
                            Some(Token::Ident(key)) => segs.push(PathSeg::Key(key)),
                            _ => {
                                return Err(EvalError::Parse(
                                    "expected identifier after '.'".to_string(),
                                ));
                            }
                        }
                    } else if self.eat(&Token::LBracket) {
                        match self.advance() {
                            Some(Token::Number(n)) => {
                                if n < 0.0 || n.fract() != 0.0 {
                                    return Err(EvalError::Parse(format!(
                                        "array index must be a non-negative integer, got {n}"
                                    )));
                                }
                                segs.push(PathSeg::Index(n as usize));
                            }
                            Some(Token::Str(key)) => segs.push(PathSeg::Key(key)),
                            _ => {
                                return Err(EvalError::Parse(
                                    "expected index or key inside '[]'".to_string(),
                                ));
                            }
                        }
                        self.expect(Token::RBracket, "closing ']'")?;
                    } else {
                        break;
                    }
                }
                Ok(Expr::Path(segs))
            }
            other => Err(EvalError::Parse(format!(
                "expected a value, got {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> PathSeg {
        PathSeg::Key(k.to_string())
    }

    #[test]
    fn test_parse_simple_path() {
        let expr = parse("steps.fetch.output").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![key("steps"), key("fetch"), key("output")])
        );
    }

    #[test]
    fn test_parse_path_with_index_and_bracket_key() {
        let expr = parse("steps.fetch.output[0][\"title\"]").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![
                key("steps"),
                key("fetch"),
                key("output"),
                PathSeg::Index(0),
                key("title"),
            ])
        );
    }

    #[test]
    fn test_parse_hyphenated_step_id() {
        let expr = parse("steps.deploy-to-prod.output").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec![key("steps"), key("deploy-to-prod"), key("output")])
        );
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("42").unwrap(), Expr::Literal(json!(42.0)));
        assert_eq!(parse("-1.5").unwrap(), Expr::Literal(json!(-1.5)));
        assert_eq!(parse("'hi'").unwrap(), Expr::Literal(json!("hi")));
        assert_eq!(parse("true").unwrap(), Expr::Literal(json!(true)));
        assert_eq!(parse("null").unwrap(), Expr::Literal(Value::Null));
    }

    #[test]
    fn test_parse_pipeline_binds_tighter_than_comparison() {
        let expr = parse("steps.fetch.output | length > 0").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Gt,
                lhs,
                ..
            } => assert!(matches!(*lhs, Expr::Pipeline { .. })),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn test_parse_pipeline_with_args() {
        let expr = parse("steps.fetch.output | first(100) | length").unwrap();
        match expr {
            Expr::Pipeline { calls, .. } => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].name, "first");
                assert_eq!(calls[0].args, vec![Expr::Literal(json!(100.0))]);
                assert_eq!(calls[1].name, "length");
                assert!(calls[1].args.is_empty());
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn test_parse_boolean_precedence() {
        // a && b || c parses as (a && b) || c
        let expr = parse("a && b || c").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Or,
                lhs,
                ..
            } => {
                assert!(matches!(
                    *lhs,
                    Expr::Binary {
                        op: BinaryOp::And,
                        ..
                    }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn test_parse_word_operators() {
        // `and`/`or`/`not` are interchangeable with the symbolic forms.
        assert_eq!(parse("a and b").unwrap(), parse("a && b").unwrap());
        assert_eq!(parse("a or b").unwrap(), parse("a || b").unwrap());
        assert_eq!(parse("not a").unwrap(), parse("!a").unwrap());
        assert_eq!(
            parse("a == 1 and b == 2 or not c").unwrap(),
            parse("a == 1 && b == 2 || !c").unwrap()
        );
    }

    #[test]
    fn test_parse_negation_and_parens() {
        let expr = parse("!(a == b)").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(EvalError::Parse(_))));
        assert!(matches!(parse("a =="), Err(EvalError::Parse(_))));
        assert!(matches!(parse("a b"), Err(EvalError::Parse(_))));
        assert!(matches!(parse("'unterminated"), Err(EvalError::Parse(_))));
        assert!(matches!(parse("a | "), Err(EvalError::Parse(_))));
        assert!(matches!(parse("a[1.5]"), Err(EvalError::Parse(_))));
    }
}
