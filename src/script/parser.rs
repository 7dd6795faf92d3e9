//! Lexer and parser for test scripts

use thiserror::Error;

use super::{Call, Literal, Program};

/// Script syntax errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected character '{ch}' at {line}:{column}")]
    UnexpectedChar { ch: char, line: usize, column: usize },

    #[error("unterminated string starting at {line}:{column}")]
    UnterminatedString { line: usize, column: usize },

    #[error("invalid integer '{text}' at {line}:{column}")]
    InvalidInteger {
        text: String,
        line: usize,
        column: usize,
    },

    #[error("expected {expected} at {line}:{column}, found {found}")]
    Expected {
        expected: &'static str,
        found: String,
        line: usize,
        column: usize,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    Comma,
    Semi,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Str(_) => "string literal".to_string(),
            Token::Int(value) => format!("integer {value}"),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Semi => "';'".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_line(&mut self) {
        while let Some(&ch) = self.chars.peek() {
            if ch == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, ParseError> {
        let mut tokens = Vec::new();

        loop {
            let (line, column) = (self.line, self.column);
            let Some(&ch) = self.chars.peek() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let token = match ch {
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                '#' => {
                    self.skip_line();
                    continue;
                }
                '/' => {
                    self.bump();
                    if self.chars.peek() == Some(&'/') {
                        self.skip_line();
                        continue;
                    }
                    return Err(ParseError::UnexpectedChar { ch, line, column });
                }
                '(' => {
                    self.bump();
                    Token::LParen
                }
                ')' => {
                    self.bump();
                    Token::RParen
                }
                ',' => {
                    self.bump();
                    Token::Comma
                }
                ';' => {
                    self.bump();
                    Token::Semi
                }
                '"' => {
                    self.bump();
                    Token::Str(self.string(line, column)?)
                }
                c if c.is_ascii_digit() || c == '-' => Token::Int(self.integer(line, column)?),
                c if c.is_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' || c == '.' {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Token::Ident(name)
                }
                _ => return Err(ParseError::UnexpectedChar { ch, line, column }),
            };

            tokens.push(Spanned {
                token,
                line,
                column,
            });
        }
    }

    fn string(&mut self, line: usize, column: usize) -> Result<String, ParseError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(ParseError::UnterminatedString { line, column }),
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => value.push(other),
                    None => return Err(ParseError::UnterminatedString { line, column }),
                },
                Some(other) => value.push(other),
            }
        }
    }

    fn integer(&mut self, line: usize, column: usize) -> Result<i64, ParseError> {
        let mut text = String::new();
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.bump();
        }
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text.replace('_', "")
            .parse()
            .map_err(|_| ParseError::InvalidInteger { text, line, column })
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Spanned {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, describe: &'static str) -> Result<Spanned, ParseError> {
        let token = self.next();
        if token.token == expected {
            Ok(token)
        } else {
            Err(unexpected(describe, &token))
        }
    }

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut statements = Vec::new();
        loop {
            match &self.peek().token {
                Token::Eof => break,
                Token::Semi => {
                    self.next();
                }
                _ => statements.push(self.call()?),
            }
        }
        Ok(Program { statements })
    }

    fn call(&mut self) -> Result<Call, ParseError> {
        let head = self.next();
        let Token::Ident(callee) = head.token else {
            return Err(unexpected("a call", &head));
        };
        self.expect(Token::LParen, "'('")?;

        let mut args = Vec::new();
        if self.peek().token == Token::RParen {
            self.next();
        } else {
            loop {
                let arg = self.next();
                args.push(match arg.token {
                    Token::Str(value) => Literal::Str(value),
                    Token::Int(value) => Literal::Int(value),
                    _ => return Err(unexpected("a literal argument", &arg)),
                });

                let separator = self.next();
                match separator.token {
                    Token::Comma => continue,
                    Token::RParen => break,
                    _ => return Err(unexpected("',' or ')'", &separator)),
                }
            }
        }

        Ok(Call {
            callee,
            args,
            line: head.line,
            column: head.column,
        })
    }
}

fn unexpected(expected: &'static str, found: &Spanned) -> ParseError {
    ParseError::Expected {
        expected,
        found: found.token.describe(),
        line: found.line,
        column: found.column,
    }
}

/// Parse script source into a [`Program`]
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser { tokens, pos: 0 }.program()
}
