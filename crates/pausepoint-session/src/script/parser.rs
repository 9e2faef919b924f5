//! Lexer and parser for the command script language.
//!
//! ```text
//! program := stmt ((';' | newline) stmt)*
//! stmt    := 'pass' | 'continue' | 'del' NAME
//!          | 'global' NAME '=' expr | NAME '=' expr
//!          | 'return' expr | 'next' expr | 'fault' expr [',' expr]
//!          | expr
//! expr    := NUMBER | STRING | 'true' | 'false' | 'null' | NAME
//!          | NAME '(' [expr (',' expr)*] ')'
//!          | '[' [expr (',' expr)*] ']'
//!          | '{' [STRING ':' expr (',' STRING ':' expr)*] '}'
//! ```
//!
//! `#` starts a comment that runs to the end of the line.

use serde_json::Value;

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Str(String),
    Num(Value),
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Sep,
}

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Call(String, Vec<Expr>),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

/// Parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Pass,
    Continue,
    Del(String),
    Assign {
        name: String,
        global: bool,
        value: Expr,
    },
    Return(Expr),
    Next(Expr),
    Fault {
        message: Expr,
        payload: Option<Expr>,
    },
    Expr(Expr),
}

/// Deepest accepted nesting of lists, objects and calls.
const MAX_NESTING: usize = 128;

const KEYWORDS: &[&str] = &[
    "pass", "continue", "del", "global", "return", "next", "fault", "true", "false", "null",
];

/// Parse a whole program.
///
/// # Errors
/// Returns `Syntax` on the first lexical or grammatical error.
pub fn parse(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = lex(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

fn lex(source: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' | ';' => {
                tokens.push(Token::Sep);
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '=' => {
                tokens.push(Token::Assign);
                i += 1;
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ':' | ',' => {
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    ':' => Token::Colon,
                    _ => Token::Comma,
                });
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ScriptError::syntax("unterminated string"));
                }
                i += 1;
                let raw: String = chars[start..i].iter().collect();
                let text: String = serde_json::from_str(&raw)
                    .map_err(|e| ScriptError::syntax(format!("bad string literal {raw}: {e}")))?;
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-'))
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                match serde_json::from_str::<Value>(&raw) {
                    Ok(num @ Value::Number(_)) => tokens.push(Token::Num(num)),
                    _ => return Err(ScriptError::syntax(format!("bad number {raw}"))),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(ScriptError::syntax(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(&Token::Sep) {}
            if self.peek().is_none() {
                return Ok(stmts);
            }
            stmts.push(self.stmt()?);
            match self.peek() {
                None | Some(Token::Sep) => {}
                Some(other) => {
                    return Err(ScriptError::syntax(format!(
                        "expected end of statement, found {other:?}"
                    )));
                }
            }
        }
    }

    fn stmt(&mut self) -> Result<Stmt, ScriptError> {
        let keyword = match self.peek() {
            Some(Token::Name(name)) => name.clone(),
            _ => return Ok(Stmt::Expr(self.expr()?)),
        };
        match keyword.as_str() {
            "pass" => {
                self.pos += 1;
                Ok(Stmt::Pass)
            }
            "continue" => {
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            "del" => {
                self.pos += 1;
                Ok(Stmt::Del(self.name()?))
            }
            "global" => {
                self.pos += 1;
                let name = self.name()?;
                self.expect(&Token::Assign)?;
                Ok(Stmt::Assign {
                    name,
                    global: true,
                    value: self.expr()?,
                })
            }
            "return" => {
                self.pos += 1;
                Ok(Stmt::Return(self.expr()?))
            }
            "next" => {
                self.pos += 1;
                Ok(Stmt::Next(self.expr()?))
            }
            "fault" => {
                self.pos += 1;
                let message = self.expr()?;
                let payload = if self.eat(&Token::Comma) {
                    Some(self.expr()?)
                } else {
                    None
                };
                Ok(Stmt::Fault { message, payload })
            }
            _ if self.tokens.get(self.pos + 1) == Some(&Token::Assign) => {
                let name = self.name()?;
                self.pos += 1;
                Ok(Stmt::Assign {
                    name,
                    global: false,
                    value: self.expr()?,
                })
            }
            _ => Ok(Stmt::Expr(self.expr()?)),
        }
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(ScriptError::syntax("nesting too deep"));
        }
        self.depth += 1;
        let expr = self.term();
        self.depth -= 1;
        expr
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        match self.next() {
            Some(Token::Num(value)) => Ok(Expr::Literal(value)),
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Name(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                kw if KEYWORDS.contains(&kw) => {
                    Err(ScriptError::syntax(format!("unexpected keyword {kw}")))
                }
                _ if self.eat(&Token::LParen) => {
                    let args = self.list_tail(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Var(name)),
            },
            Some(Token::LBracket) => Ok(Expr::List(self.list_tail(&Token::RBracket)?)),
            Some(Token::LBrace) => {
                let mut fields = Vec::new();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Object(fields));
                }
                loop {
                    let key = match self.next() {
                        Some(Token::Str(key)) => key,
                        other => {
                            return Err(ScriptError::syntax(format!(
                                "expected string key, found {other:?}"
                            )));
                        }
                    };
                    self.expect(&Token::Colon)?;
                    fields.push((key, self.expr()?));
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Object(fields));
                    }
                    self.expect(&Token::Comma)?;
                }
            }
            other => Err(ScriptError::syntax(format!(
                "expected expression, found {other:?}"
            ))),
        }
    }

    /// Comma-separated expressions up to `close`, which is consumed.
    fn list_tail(&mut self, close: &Token) -> Result<Vec<Expr>, ScriptError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn name(&mut self) -> Result<String, ScriptError> {
        match self.next() {
            Some(Token::Name(name)) if !KEYWORDS.contains(&name.as_str()) => Ok(name),
            other => Err(ScriptError::syntax(format!("expected name, found {other:?}"))),
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ScriptError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(ScriptError::syntax(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_assignments_and_separators() {
        let program = parse("x = 1; global y = \"two\"\n# comment\nz = [x, {\"k\": null}]").unwrap();
        assert_eq!(program.len(), 3);
        assert_eq!(
            program[0],
            Stmt::Assign {
                name: "x".into(),
                global: false,
                value: Expr::Literal(json!(1)),
            }
        );
        assert!(matches!(&program[1], Stmt::Assign { global: true, .. }));
        assert_eq!(
            program[2],
            Stmt::Assign {
                name: "z".into(),
                global: false,
                value: Expr::List(vec![
                    Expr::Var("x".into()),
                    Expr::Object(vec![("k".into(), Expr::Literal(Value::Null))]),
                ]),
            }
        );
    }

    #[test]
    fn test_control_statements() {
        let program = parse("next \"x = 2\"; continue").unwrap();
        assert_eq!(
            program,
            vec![Stmt::Next(Expr::Literal(json!("x = 2"))), Stmt::Continue]
        );

        let program = parse("fault \"stop\", {\"code\": -3}").unwrap();
        assert!(matches!(&program[0], Stmt::Fault { payload: Some(_), .. }));
    }

    #[test]
    fn test_calls_and_numbers() {
        let program = parse("r = add(1.5, -2e3)").unwrap();
        assert_eq!(
            program[0],
            Stmt::Assign {
                name: "r".into(),
                global: false,
                value: Expr::Call(
                    "add".into(),
                    vec![Expr::Literal(json!(1.5)), Expr::Literal(json!(-2000.0))]
                ),
            }
        );
    }

    #[test]
    fn test_escaped_strings() {
        let program = parse(r#"next "say \"hi\"""#).unwrap();
        assert_eq!(program[0], Stmt::Next(Expr::Literal(json!("say \"hi\""))));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let shallow = format!("x = {}1{}", "[".repeat(100), "]".repeat(100));
        assert!(parse(&shallow).is_ok());

        let deep = format!("x = {}", "[".repeat(200_000));
        assert!(matches!(parse(&deep), Err(ScriptError::Syntax(msg)) if msg == "nesting too deep"));

        let calls = format!("x = {}1{}", "len(".repeat(500), ")".repeat(500));
        assert!(matches!(parse(&calls), Err(ScriptError::Syntax(_))));
    }

    #[test]
    fn test_syntax_errors() {
        for source in ["x = ", "x = \"open", "1 2", "del 5", "x = @", "return = 3"] {
            assert!(
                matches!(parse(source), Err(ScriptError::Syntax(_))),
                "{source:?} should not parse"
            );
        }
    }
}
