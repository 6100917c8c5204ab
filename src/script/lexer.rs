//! Tokenizer for filter and transformation scripts.

use super::ScriptError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Function,
    Return,
    Var,
    If,
    Else,
    Delete,
    True,
    False,
    Null,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    Dot,
    Question,
    Bang,
    Assign,
    Eq,
    StrictEq,
    NotEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    And,
    Or,
}

/// A token with its byte offset in the source.
#[derive(Clone, Debug)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ScriptError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Comments
        if c == '/' && i + 1 < chars.len() {
            match chars[i + 1].1 {
                '/' => {
                    while i < chars.len() && chars[i].1 != '\n' {
                        i += 1;
                    }
                    continue;
                }
                '*' => {
                    i += 2;
                    loop {
                        if i + 1 >= chars.len() {
                            return Err(ScriptError::syntax(pos, "unterminated comment"));
                        }
                        if chars[i].1 == '*' && chars[i + 1].1 == '/' {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                    continue;
                }
                _ => {}
            }
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ScriptError::syntax(pos, format!("invalid number '{}'", text)))?;
            tokens.push(Spanned {
                token: Token::Number(value),
                pos,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let token = match word.as_str() {
                "function" => Token::Function,
                "return" => Token::Return,
                "var" | "let" | "const" => Token::Var,
                "if" => Token::If,
                "else" => Token::Else,
                "delete" => Token::Delete,
                "true" => Token::True,
                "false" => Token::False,
                "null" | "undefined" => Token::Null,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, pos });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(ScriptError::syntax(pos, "unterminated string"));
                }
                let ch = chars[i].1;
                if ch == quote {
                    i += 1;
                    break;
                }
                if ch == '\\' {
                    i += 1;
                    let escaped = chars
                        .get(i)
                        .map(|(_, c)| *c)
                        .ok_or_else(|| ScriptError::syntax(pos, "unterminated string"))?;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    value.push(ch);
                }
                i += 1;
            }
            tokens.push(Spanned {
                token: Token::Str(value),
                pos,
            });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let next2 = chars.get(i + 2).map(|(_, c)| *c);
        let (token, width) = match (c, next, next2) {
            ('=', Some('='), Some('=')) => (Token::StrictEq, 3),
            ('!', Some('='), Some('=')) => (Token::StrictNotEq, 3),
            ('=', Some('='), _) => (Token::Eq, 2),
            ('!', Some('='), _) => (Token::NotEq, 2),
            ('<', Some('='), _) => (Token::Le, 2),
            ('>', Some('='), _) => (Token::Ge, 2),
            ('&', Some('&'), _) => (Token::And, 2),
            ('|', Some('|'), _) => (Token::Or, 2),
            ('(', _, _) => (Token::LParen, 1),
            (')', _, _) => (Token::RParen, 1),
            ('{', _, _) => (Token::LBrace, 1),
            ('}', _, _) => (Token::RBrace, 1),
            ('[', _, _) => (Token::LBracket, 1),
            (']', _, _) => (Token::RBracket, 1),
            (',', _, _) => (Token::Comma, 1),
            (';', _, _) => (Token::Semi, 1),
            (':', _, _) => (Token::Colon, 1),
            ('.', _, _) => (Token::Dot, 1),
            ('?', _, _) => (Token::Question, 1),
            ('!', _, _) => (Token::Bang, 1),
            ('=', _, _) => (Token::Assign, 1),
            ('<', _, _) => (Token::Lt, 1),
            ('>', _, _) => (Token::Gt, 1),
            ('+', _, _) => (Token::Plus, 1),
            ('-', _, _) => (Token::Minus, 1),
            ('*', _, _) => (Token::Star, 1),
            ('/', _, _) => (Token::Slash, 1),
            ('%', _, _) => (Token::Percent, 1),
            _ => {
                return Err(ScriptError::syntax(
                    pos,
                    format!("unexpected character '{}'", c),
                ))
            }
        };
        tokens.push(Spanned { token, pos });
        i += width;
    }

    Ok(tokens)
}
