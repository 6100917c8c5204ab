//! Recursive-descent parser producing the script AST.

use super::lexer::{Spanned, Token};
use super::ScriptError;
use serde_json::Value;

/// Maximum nesting of expressions and blocks.
const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub(crate) struct Function {
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub(crate) enum Stmt {
    Return(Option<Expr>),
    Declare(String, Option<Expr>),
    Assign(Place, Expr),
    Delete(Place),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Expr(Expr),
}

/// Assignment target: a variable followed by property accessors.
#[derive(Clone, Debug)]
pub(crate) struct Place {
    pub root: String,
    pub path: Vec<Expr>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum UnOp {
    Not,
    Neg,
}

#[derive(Clone, Debug)]
pub(crate) enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, Box<Expr>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>, source_len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            end: source_len,
        }
    }

    /// program := (function ';'?)+
    pub fn parse_program(mut self) -> Result<Vec<Function>, ScriptError> {
        let mut functions = Vec::new();
        while !self.at_end() {
            if self.eat(&Token::Semi) {
                continue;
            }
            functions.push(self.parse_function()?);
        }
        if functions.is_empty() {
            return Err(ScriptError::syntax(0, "script defines no function"));
        }
        Ok(functions)
    }

    fn parse_function(&mut self) -> Result<Function, ScriptError> {
        self.expect(&Token::Function, "'function'")?;
        // Optional name, ignored.
        if let Some(Token::Ident(_)) = self.peek() {
            self.pos += 1;
        }
        self.expect(&Token::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                params.push(self.ident()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma, "',' or ')'")?;
            }
        }
        let body = self.parse_block()?;
        Ok(Function { params, body })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&Token::LBrace, "'{'")?;
        self.enter()?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("unexpected end of script, expected '}'"));
            }
            if self.eat(&Token::Semi) {
                continue;
            }
            stmts.push(self.parse_stmt()?);
        }
        self.leave();
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Some(Token::Return) => {
                self.pos += 1;
                let value = match self.peek() {
                    None | Some(Token::Semi) | Some(Token::RBrace) => None,
                    _ => Some(self.parse_expr()?),
                };
                self.eat(&Token::Semi);
                Ok(Stmt::Return(value))
            }
            Some(Token::Var) => {
                self.pos += 1;
                let name = self.ident()?;
                let init = if self.eat(&Token::Assign) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.eat(&Token::Semi);
                Ok(Stmt::Declare(name, init))
            }
            Some(Token::Delete) => {
                self.pos += 1;
                let target = self.parse_expr()?;
                let place = self.to_place(target)?;
                self.eat(&Token::Semi);
                Ok(Stmt::Delete(place))
            }
            Some(Token::If) => {
                self.pos += 1;
                self.expect(&Token::LParen, "'('")?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                let then = self.parse_branch()?;
                let otherwise = if self.eat(&Token::Else) {
                    if let Some(Token::If) = self.peek() {
                        vec![self.parse_stmt()?]
                    } else {
                        self.parse_branch()?
                    }
                } else {
                    Vec::new()
                };
                Ok(Stmt::If(cond, then, otherwise))
            }
            _ => {
                let expr = self.parse_expr()?;
                let stmt = if self.eat(&Token::Assign) {
                    let place = self.to_place(expr)?;
                    Stmt::Assign(place, self.parse_expr()?)
                } else {
                    Stmt::Expr(expr)
                };
                self.eat(&Token::Semi);
                Ok(stmt)
            }
        }
    }

    fn parse_branch(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        if let Some(Token::LBrace) = self.peek() {
            self.parse_block()
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    fn to_place(&self, expr: Expr) -> Result<Place, ScriptError> {
        let mut path = Vec::new();
        let mut current = expr;
        loop {
            match current {
                Expr::Ident(root) => {
                    path.reverse();
                    return Ok(Place { root, path });
                }
                Expr::Member(object, key) => {
                    path.push(*key);
                    current = *object;
                }
                _ => return Err(self.error("invalid assignment target")),
            }
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let expr = self.parse_conditional();
        self.leave();
        expr
    }

    fn parse_conditional(&mut self) -> Result<Expr, ScriptError> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_expr()?;
            self.expect(&Token::Colon, "':'")?;
            let otherwise = self.parse_expr()?;
            return Ok(Expr::Conditional(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::And) {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) | Some(Token::StrictEq) => BinOp::Eq,
                Some(Token::NotEq) | Some(Token::StrictNotEq) => BinOp::NotEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            Some(Token::Bang) => UnOp::Not,
            Some(Token::Minus) => UnOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident()?;
                expr = Expr::Member(Box::new(expr), Box::new(Expr::Literal(Value::String(name))));
            } else if self.eat(&Token::LBracket) {
                let key = self.parse_expr()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Member(Box::new(expr), Box::new(key));
            } else if let Some(Token::LParen) = self.peek() {
                return Err(self.error("function calls are not supported"));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        let Some(spanned) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error("unexpected end of script"));
        };
        self.pos += 1;

        match spanned.token {
            Token::Number(n) => Ok(Expr::Literal(super::eval::number(n).map_err(|_| {
                ScriptError::syntax(spanned.pos, "number literal out of range")
            })?)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                self.enter()?;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma, "',' or ']'")?;
                    }
                }
                self.leave();
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                self.enter()?;
                let mut fields = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.tokens.get(self.pos).map(|s| s.token.clone()) {
                            Some(Token::Ident(k)) | Some(Token::Str(k)) => k,
                            _ => return Err(self.error("expected property name")),
                        };
                        self.pos += 1;
                        self.expect(&Token::Colon, "':'")?;
                        fields.push((key, self.parse_expr()?));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(&Token::Comma, "',' or '}'")?;
                    }
                }
                self.leave();
                Ok(Expr::Object(fields))
            }
            other => Err(ScriptError::syntax(
                spanned.pos,
                format!("unexpected token {:?}", other),
            )),
        }
    }

    // --- Helpers ---

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ScriptError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn ident(&mut self) -> Result<String, ScriptError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("script nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        let pos = self
            .tokens
            .get(self.pos)
            .map(|s| s.pos)
            .unwrap_or(self.end);
        ScriptError::syntax(pos, message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse(source: &str) -> Result<Vec<Function>, ScriptError> {
        Parser::new(tokenize(source)?, source.len()).parse_program()
    }

    #[test]
    fn test_parse_two_functions() {
        let functions = parse(
            "function (e) { e.b = e.a + 1; }\nfunction transform(e) { delete e.a; }",
        )
        .unwrap();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].params, vec!["e".to_string()]);
        assert!(matches!(functions[1].body[0], Stmt::Delete(_)));
    }

    #[test]
    fn test_parse_nested_place() {
        let functions = parse("function (e) { e.a['b'].c = 1 }").unwrap();
        match &functions[0].body[0] {
            Stmt::Assign(place, _) => {
                assert_eq!(place.root, "e");
                assert_eq!(place.path.len(), 3);
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("function (h) { return h.x(1) }").is_err());
        assert!(parse("function (h) { 1 = 2 }").is_err());
        assert!(parse("function (h) { return h.x ").is_err());
        assert!(parse("h => true").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("function (h) {{ return {}1{} }}", "(".repeat(200), ")".repeat(200));
        assert!(parse(&deep).is_err());
    }
}
