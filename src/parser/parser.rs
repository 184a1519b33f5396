//! Recursive-descent parser producing query ASTs.
//!
//! Grammar (informal):
//!
//! ```text
//! union    := branch ("UNION" branch)*
//! branch   := select | "(" select ")"
//! select   := ["DISTINCT"] "Any" term ("," term)* clause*
//! clause   := "GROUPBY" var-list | "ORDERBY" sort-list | "LIMIT" n
//!           | "OFFSET" n | "WHERE" expr | "HAVING" expr | with
//! with     := "WITH" alias-list "BEING" "(" union ")"
//!             ("," alias-list "BEING" "(" union ")")*
//! expr     := or-term ("," or-term)*
//! or-term  := unary ("OR" unary)*
//! unary    := "NOT" unary | "EXISTS" "(" expr ")" | "(" expr ")" | atom
//! atom     := VAR "is" (TYPE | "IN" "(" type-list ")" | "NULL")
//!           | VAR ["?"] rtype [op] term ["?"]
//!           | func-term op term
//! ```

use crate::ast::{CmpOp, Expr, Optional, Select, SortDirection, SortSpec, SubQuery, Term, Union};

use super::errors::{ParseError, ParseResult};
use super::lexer::{tokenize, Token};

const CLAUSE_KEYWORDS: &[&str] = &[
    "GROUPBY", "ORDERBY", "HAVING", "LIMIT", "OFFSET", "WHERE", "WITH", "UNION",
];

/// Parses a complete statement (one or more UNION-joined selects).
pub fn parse_query(input: &str) -> ParseResult<Union> {
    let mut parser = Parser::new(input)?;
    let union = parser.union()?;
    parser.expect_end()?;
    Ok(union)
}

/// Parses a bare restriction expression (permission-rule snippet body).
pub fn parse_expression(input: &str) -> ParseResult<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.expr()?;
    parser.expect_end()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> ParseResult<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, p)| *p)
            .unwrap_or_else(|| self.tokens.last().map(|(_, p)| *p + 1).unwrap_or(0))
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Token::Name(name)) = self.peek() {
            if name == keyword {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(name)) if name == keyword)
    }

    fn expect(&mut self, token: Token) -> ParseResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            self.unexpected(&token.describe())
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            self.unexpected(&format!("`{}`", keyword))
        }
    }

    fn expect_end(&mut self) -> ParseResult<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ParseError::TrailingInput {
                position: self.position(),
            })
        }
    }

    fn unexpected<T>(&self, expected: &str) -> ParseResult<T> {
        match self.peek() {
            Some(token) => Err(ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: token.describe(),
                position: self.position(),
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: expected.to_string(),
            }),
        }
    }

    fn name(&mut self, expected: &str) -> ParseResult<String> {
        match self.peek() {
            Some(Token::Name(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => self.unexpected(expected),
        }
    }

    // ---- statements -----------------------------------------------------

    fn union(&mut self) -> ParseResult<Union> {
        let mut branches = vec![self.branch()?];
        while self.eat_keyword("UNION") {
            branches.push(self.branch()?);
        }
        Ok(Union { branches })
    }

    fn branch(&mut self) -> ParseResult<Select> {
        if self.peek() == Some(&Token::LParen) {
            self.expect(Token::LParen)?;
            let select = self.select()?;
            self.expect(Token::RParen)?;
            Ok(select)
        } else {
            self.select()
        }
    }

    fn select(&mut self) -> ParseResult<Select> {
        let mut select = Select::new();
        if self.eat_keyword("DISTINCT") {
            select.distinct = true;
        }
        self.expect_keyword("Any")?;

        select.selection.push(self.term()?);
        while self.eat(&Token::Comma) {
            select.selection.push(self.term()?);
        }

        loop {
            if self.eat_keyword("GROUPBY") {
                select.groupby.push(self.name("grouping variable")?);
                while self.eat(&Token::Comma) {
                    select.groupby.push(self.name("grouping variable")?);
                }
            } else if self.eat_keyword("ORDERBY") {
                select.orderby.push(self.sort_spec()?);
                while self.eat(&Token::Comma) {
                    select.orderby.push(self.sort_spec()?);
                }
            } else if self.eat_keyword("LIMIT") {
                select.limit = Some(self.integer()?);
            } else if self.eat_keyword("OFFSET") {
                select.offset = Some(self.integer()?);
            } else if self.eat_keyword("WHERE") {
                select.restriction = Some(self.expr()?);
            } else if self.eat_keyword("HAVING") {
                select.having = Some(self.expr()?);
            } else if self.eat_keyword("WITH") {
                loop {
                    let mut aliases = vec![self.name("subquery alias")?];
                    while self.eat(&Token::Comma) {
                        aliases.push(self.name("subquery alias")?);
                    }
                    self.expect_keyword("BEING")?;
                    self.expect(Token::LParen)?;
                    let query = self.union()?;
                    self.expect(Token::RParen)?;
                    select.subqueries.push(SubQuery { aliases, query });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
            } else {
                break;
            }
        }

        Ok(select)
    }

    fn sort_spec(&mut self) -> ParseResult<SortSpec> {
        let term = self.term()?;
        let direction = if self.eat_keyword("DESC") {
            SortDirection::Desc
        } else {
            self.eat_keyword("ASC");
            SortDirection::Asc
        };
        Ok(SortSpec { term, direction })
    }

    fn integer(&mut self) -> ParseResult<u64> {
        match self.peek() {
            Some(Token::Number(n)) => match n.as_u64() {
                Some(value) => {
                    self.pos += 1;
                    Ok(value)
                }
                None => self.unexpected("non-negative integer"),
            },
            _ => self.unexpected("integer"),
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expr(&mut self) -> ParseResult<Expr> {
        let mut terms = vec![self.or_term()?];
        while self.peek() == Some(&Token::Comma) && !self.comma_starts_clause() {
            self.expect(Token::Comma)?;
            terms.push(self.or_term()?);
        }
        Ok(Expr::and(terms))
    }

    /// A comma inside a WITH clause separates subqueries, not conjuncts.
    fn comma_starts_clause(&self) -> bool {
        matches!(self.peek_at(1), Some(Token::Name(n)) if CLAUSE_KEYWORDS.contains(&n.as_str()))
    }

    fn or_term(&mut self) -> ParseResult<Expr> {
        let mut terms = vec![self.unary()?];
        while self.eat_keyword("OR") {
            terms.push(self.unary()?);
        }
        Ok(Expr::or(terms))
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat_keyword("EXISTS") {
            self.expect(Token::LParen)?;
            let inner = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::Exists(Box::new(inner)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.expect(Token::LParen)?;
            let inner = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        self.atom()
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        // Function call on the left means a comparison (HAVING territory).
        if matches!(self.peek(), Some(Token::Name(_))) && self.peek_at(1) == Some(&Token::LParen) {
            let left = self.term()?;
            let operator = self
                .operator()
                .ok_or(ParseError::UnexpectedEnd {
                    expected: "comparison operator".into(),
                })?;
            let right = self.term()?;
            return Ok(Expr::Comparison {
                left,
                operator,
                right,
            });
        }

        let position = self.position();
        let subject = self.name("variable")?;
        let subject_optional = self.eat(&Token::Question);

        match self.peek().cloned() {
            Some(Token::Word(word)) if word == "is" => {
                if subject_optional {
                    return Err(ParseError::DoubleOptional {
                        rtype: "is".into(),
                        position,
                    });
                }
                self.pos += 1;
                if self.eat_keyword("NULL") {
                    return Ok(Expr::IsNull { var: subject });
                }
                if self.at_keyword("IN") {
                    self.pos += 1;
                    self.expect(Token::LParen)?;
                    let mut types = vec![self.name("type name")?];
                    while self.eat(&Token::Comma) {
                        types.push(self.name("type name")?);
                    }
                    self.expect(Token::RParen)?;
                    return Ok(Expr::TypeIs { var: subject, types });
                }
                let etype = self.name("type name")?;
                Ok(Expr::TypeIs {
                    var: subject,
                    types: vec![etype],
                })
            }
            Some(Token::Word(rtype)) => {
                self.pos += 1;
                let operator = self.operator().unwrap_or(CmpOp::Eq);
                let object = self.term()?;
                let object_optional = self.eat(&Token::Question);
                let optional = match (subject_optional, object_optional) {
                    (false, false) => Optional::Neither,
                    (true, false) => Optional::Subject,
                    (false, true) => Optional::Object,
                    (true, true) => {
                        return Err(ParseError::DoubleOptional { rtype, position });
                    }
                };
                Ok(Expr::Relation {
                    subject,
                    rtype,
                    object,
                    operator,
                    optional,
                })
            }
            _ => self.unexpected("relation type or `is`"),
        }
    }

    fn operator(&mut self) -> Option<CmpOp> {
        let op = match self.peek()? {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn term(&mut self) -> ParseResult<Term> {
        match self.peek().cloned() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "TRUE" => return Ok(Term::constant(serde_json::Value::Bool(true))),
                    "FALSE" => return Ok(Term::constant(serde_json::Value::Bool(false))),
                    "NULL" => return Ok(Term::constant(serde_json::Value::Null)),
                    _ => {}
                }
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        args.push(self.term()?);
                        while self.eat(&Token::Comma) {
                            args.push(self.term()?);
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Term::Function { name, args })
                } else {
                    Ok(Term::Variable(name))
                }
            }
            Some(Token::Str(text)) => {
                self.pos += 1;
                Ok(Term::Constant(serde_json::Value::String(text)))
            }
            Some(Token::Number(number)) => {
                self.pos += 1;
                Ok(Term::Constant(serde_json::Value::Number(number)))
            }
            Some(Token::Param(name)) => {
                self.pos += 1;
                Ok(Term::Param(name))
            }
            _ => self.unexpected("term"),
        }
    }
}
