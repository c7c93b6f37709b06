//! Context, label and dbms filter expressions.
//!
//! A change set may carry an expression such as `dev and !staging` or
//! `postgresql, h2`. At run time it is matched against the set of values the
//! caller selected:
//!
//! - identifiers are true when the selection contains them (case-insensitive)
//! - `,` and `or` mean OR, `and` means AND, `!` and `not` negate
//! - parentheses group
//!
//! An empty expression matches any selection, and an empty selection matches
//! any expression.

use std::fmt;

use crate::error::{Result, TidemarkError};

/// Maximum nesting depth for expression parsing.
const MAX_PARSE_DEPTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Ident(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn matches(&self, selection: &[String]) -> bool {
        match self {
            Node::Ident(name) => selection.iter().any(|s| s.eq_ignore_ascii_case(name)),
            Node::Not(inner) => !inner.matches(selection),
            Node::And(l, r) => l.matches(selection) && r.matches(selection),
            Node::Or(l, r) => l.matches(selection) || r.matches(selection),
        }
    }
}

/// A parsed filter expression. Keeps its source text for the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expression {
    source: String,
    root: Option<Node>,
}

impl Expression {
    /// Parse an expression. Blank input yields the match-everything expression.
    pub fn parse(input: &str) -> Result<Self> {
        let source = input.trim().to_string();
        if source.is_empty() {
            return Ok(Self::default());
        }
        let tokens = tokenize(&source)?;
        let mut parser = Parser::new(tokens);
        let root = parser.parse_or_expr(0)?;
        if parser.pos < parser.tokens.len() {
            return Err(TidemarkError::ChangelogParseError(format!(
                "Expression '{}': unexpected token '{}' after complete expression",
                source, parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            source,
            root: Some(root),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether this expression accepts the given runtime selection.
    pub fn matches(&self, selection: &[String]) -> bool {
        match &self.root {
            None => true,
            Some(_) if selection.is_empty() => true,
            Some(root) => root.matches(selection),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, ","),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    let mut i = 0;

    while i < len {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        match ch {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Or),
            '!' => tokens.push(Token::Not),
            _ if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' => {
                let start = i;
                while i < len
                    && (chars[i].is_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '-'
                        || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word.eq_ignore_ascii_case("and") {
                    tokens.push(Token::And);
                } else if word.eq_ignore_ascii_case("or") {
                    tokens.push(Token::Or);
                } else if word.eq_ignore_ascii_case("not") {
                    tokens.push(Token::Not);
                } else {
                    tokens.push(Token::Ident(word));
                }
                continue;
            }
            _ => {
                return Err(TidemarkError::ChangelogParseError(format!(
                    "Expression '{input}': unexpected character '{ch}'"
                )))
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn too_deep() -> TidemarkError {
        TidemarkError::ChangelogParseError(
            "Expression: maximum nesting depth exceeded".to_string(),
        )
    }

    /// `or_expr → and_expr ((',' | or) and_expr)*`
    fn parse_or_expr(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_PARSE_DEPTH {
            return Err(Self::too_deep());
        }
        let mut left = self.parse_and_expr(depth + 1)?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and_expr(depth + 1)?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// `and_expr → not_expr (and not_expr)*`
    fn parse_and_expr(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_PARSE_DEPTH {
            return Err(Self::too_deep());
        }
        let mut left = self.parse_not_expr(depth + 1)?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not_expr(depth + 1)?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// `not_expr → ('!' | not) not_expr | primary`
    fn parse_not_expr(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_PARSE_DEPTH {
            return Err(Self::too_deep());
        }
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_not_expr(depth + 1)?;
            Ok(Node::Not(Box::new(inner)))
        } else {
            self.parse_primary(depth + 1)
        }
    }

    /// `primary → ident | '(' or_expr ')'`
    fn parse_primary(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_PARSE_DEPTH {
            return Err(Self::too_deep());
        }
        match self.advance() {
            Some(Token::Ident(name)) => Ok(Node::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or_expr(depth + 1)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(tok) => Err(TidemarkError::ChangelogParseError(format!(
                        "Expression: expected ')', found '{tok}'"
                    ))),
                    None => Err(TidemarkError::ChangelogParseError(
                        "Expression: expected ')', found end of input".to_string(),
                    )),
                }
            }
            Some(tok) => Err(TidemarkError::ChangelogParseError(format!(
                "Expression: unexpected token '{tok}'"
            ))),
            None => Err(TidemarkError::ChangelogParseError(
                "Expression: unexpected end of input".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_expression_matches_everything() {
        let expr = Expression::parse("  ").unwrap();
        assert!(expr.is_empty());
        assert!(expr.matches(&sel(&["prod"])));
        assert!(expr.matches(&[]));
    }

    #[test]
    fn test_empty_selection_matches_everything() {
        let expr = Expression::parse("dev").unwrap();
        assert!(expr.matches(&[]));
    }

    #[test]
    fn test_single_identifier_is_case_insensitive() {
        let expr = Expression::parse("Dev").unwrap();
        assert!(expr.matches(&sel(&["dev"])));
        assert!(!expr.matches(&sel(&["prod"])));
    }

    #[test]
    fn test_comma_means_or() {
        let expr = Expression::parse("dev, test").unwrap();
        assert!(expr.matches(&sel(&["test"])));
        assert!(!expr.matches(&sel(&["prod"])));
    }

    #[test]
    fn test_and_not() {
        let expr = Expression::parse("dev and !eu").unwrap();
        assert!(expr.matches(&sel(&["dev", "us"])));
        assert!(!expr.matches(&sel(&["dev", "eu"])));
    }

    #[test]
    fn test_precedence_and_binds_tighter() {
        let expr = Expression::parse("a or b and c").unwrap();
        assert!(expr.matches(&sel(&["a"])));
        assert!(!expr.matches(&sel(&["b"])));
        assert!(expr.matches(&sel(&["b", "c"])));
    }

    #[test]
    fn test_parentheses() {
        let expr = Expression::parse("(a or b) and not c").unwrap();
        assert!(expr.matches(&sel(&["b"])));
        assert!(!expr.matches(&sel(&["b", "c"])));
    }

    #[test]
    fn test_source_is_kept() {
        let expr = Expression::parse(" dev, test ").unwrap();
        assert_eq!(expr.source(), "dev, test");
        assert_eq!(expr.to_string(), "dev, test");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("dev and").is_err());
        assert!(Expression::parse("(dev").is_err());
        assert!(Expression::parse("dev test").is_err());
        assert!(Expression::parse("dev & test").is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let input = format!("{}a{}", "(".repeat(60), ")".repeat(60));
        assert!(Expression::parse(&input).is_err());
    }
}
