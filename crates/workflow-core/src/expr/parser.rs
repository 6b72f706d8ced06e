//! Recursive-descent parser over the token stream, producing an `Expr` AST.
//! Precedence (low to high): ternary, `||`, `&&`, equality, comparison,
//! additive, multiplicative, unary, postfix (member/index/call), primary.

use super::ast::{BinOp, Expr, UnOp};
use super::lexer::{tokenize, Token};
use crate::error::{EngineError, Result};

pub fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_ternary()?;
    p.expect(Token::Eof)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(EngineError::Expression(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        // Try a lambda first: `ident => expr` or `(a, b) => expr`.
        if let Some(lambda) = self.try_parse_lambda()? {
            return Ok(lambda);
        }

        let cond = self.parse_or()?;
        if *self.peek() == Token::Question {
            self.advance();
            let then_branch = self.parse_ternary()?;
            self.expect(Token::Colon)?;
            let else_branch = self.parse_ternary()?;
            Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then_branch),
                Box::new(else_branch),
            ))
        } else {
            Ok(cond)
        }
    }

    fn try_parse_lambda(&mut self) -> Result<Option<Expr>> {
        let start = self.pos;
        let params = if let Token::Ident(name) = self.peek().clone() {
            self.advance();
            vec![name]
        } else if *self.peek() == Token::LParen {
            self.advance();
            let mut names = Vec::new();
            if *self.peek() != Token::RParen {
                loop {
                    if let Token::Ident(name) = self.peek().clone() {
                        names.push(name);
                        self.advance();
                    } else {
                        self.pos = start;
                        return Ok(None);
                    }
                    if *self.peek() == Token::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
            if *self.peek() != Token::RParen {
                self.pos = start;
                return Ok(None);
            }
            self.advance();
            names
        } else {
            return Ok(None);
        };

        if *self.peek() == Token::FatArrow {
            self.advance();
            let body = self.parse_ternary()?;
            Ok(Some(Expr::Lambda(params, Box::new(body))))
        } else {
            self.pos = start;
            Ok(None)
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::OrOr {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        while *self.peek() == Token::AndAnd {
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(n) => n,
                        Token::True => "true".to_string(),
                        Token::False => "false".to_string(),
                        Token::Null => "null".to_string(),
                        other => {
                            return Err(EngineError::Expression(format!(
                                "expected identifier after '.', found {other:?}"
                            )))
                        }
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_ternary()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if *self.peek() != Token::RParen {
                        loop {
                            args.push(self.parse_ternary()?);
                            if *self.peek() == Token::Comma {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.parse_ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if *self.peek() != Token::RBracket {
                    loop {
                        items.push(self.parse_ternary()?);
                        if *self.peek() == Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let mut fields = Vec::new();
                if *self.peek() != Token::RBrace {
                    loop {
                        let key = match self.advance() {
                            Token::Ident(n) => n,
                            Token::Str(s) => s,
                            other => {
                                return Err(EngineError::Expression(format!(
                                    "expected object key, found {other:?}"
                                )))
                            }
                        };
                        self.expect(Token::Colon)?;
                        let value = self.parse_ternary()?;
                        fields.push((key, value));
                        if *self.peek() == Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::Object(fields))
            }
            other => Err(EngineError::Expression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(
                    BinOp::Mul,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(3.0))
                ))
            )
        );
    }

    #[test]
    fn parses_path_chain() {
        let expr = parse("state.counters.retries").unwrap();
        assert_eq!(
            expr,
            Expr::Member(
                Box::new(Expr::Member(
                    Box::new(Expr::Ident("state".into())),
                    "counters".into()
                )),
                "retries".into()
            )
        );
    }

    #[test]
    fn parses_ternary() {
        let expr = parse("a ? 1 : 2").unwrap();
        assert!(matches!(expr, Expr::Ternary(..)));
    }

    #[test]
    fn parses_method_call_with_lambda() {
        let expr = parse("state.items.filter(x => x.id > 1)").unwrap();
        match expr {
            Expr::Call(callee, args) => {
                assert!(matches!(*callee, Expr::Member(_, ref m) if m == "filter"));
                assert_eq!(args.len(), 1);
                assert!(matches!(args[0], Expr::Lambda(..)));
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn parses_two_arg_lambda_for_reduce() {
        let expr = parse("state.items.reduce((acc, item) => acc + item.id, 0)").unwrap();
        match expr {
            Expr::Call(_, args) => {
                assert_eq!(args.len(), 2);
                match &args[0] {
                    Expr::Lambda(params, _) => assert_eq!(params, &["acc".to_string(), "item".to_string()]),
                    _ => panic!("expected lambda"),
                }
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn parses_bracket_index() {
        let expr = parse("state.items[0]").unwrap();
        assert!(matches!(expr, Expr::Index(..)));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("1 + 2 3").is_err());
    }
}
