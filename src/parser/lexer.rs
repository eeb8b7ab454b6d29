use super::types::{BinOp, Expr, ParseError};

pub const DONT_TRACE_MARKER: &str = "@DontTrace";
pub const IGNORE_EXCEPTION_MARKER: &str = "@IgnoreException";

/// A source line with its comment removed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine<'a> {
    pub text: &'a str,
    pub ignore_exceptions: bool,
}

/// Split off a `#` comment, honoring quotes. The comment may carry the
/// ignore-exception marker.
pub fn strip_comment(line: &str) -> SourceLine<'_> {
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (ch, quote) {
            ('\\', _) => escaped = true,
            ('"' | '\'', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            ('#', None) => {
                return SourceLine {
                    text: line[..i].trim(),
                    ignore_exceptions: line[i..].contains(IGNORE_EXCEPTION_MARKER),
                };
            }
            _ => {}
        }
    }

    SourceLine {
        text: line.trim(),
        ignore_exceptions: false,
    }
}

/// Shell-style word splitting for statement arguments.
pub fn split_words(text: &str, line: u32) -> Result<Vec<String>, ParseError> {
    shlex::split(text).ok_or_else(|| ParseError::new(line, "unbalanced quotes"))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Op(BinOp),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == ch {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                        continue;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err("unterminated string".to_string());
                }
                tokens.push(Token::Quoted(value));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Op(BinOp::Add));
            }
            '-' if tokens.last().map_or(false, |t| !matches!(t, Token::Op(_))) => {
                chars.next();
                tokens.push(Token::Op(BinOp::Sub));
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let followed_by_eq = chars.peek() == Some(&'=');
                if followed_by_eq {
                    chars.next();
                }
                let op = match (ch, followed_by_eq) {
                    ('=', true) => BinOp::Eq,
                    ('!', true) => BinOp::Ne,
                    ('<', false) => BinOp::Lt,
                    ('<', true) => BinOp::Le,
                    ('>', false) => BinOp::Gt,
                    ('>', true) => BinOp::Ge,
                    _ => return Err(format!("unexpected '{}'", ch)),
                };
                tokens.push(Token::Op(op));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "\"'+=!<>".contains(c) || (c == '-' && !word.is_empty()) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn operand(token: Token) -> Result<Expr, String> {
    match token {
        Token::Quoted(s) => Ok(Expr::Str(s)),
        Token::Op(_) => Err("expected a value".to_string()),
        Token::Word(word) => match word.as_str() {
            "true" | "True" => Ok(Expr::Bool(true)),
            "false" | "False" => Ok(Expr::Bool(false)),
            "none" | "None" => Ok(Expr::None),
            _ => {
                if let Ok(n) = word.parse::<i64>() {
                    Ok(Expr::Int(n))
                } else if word.chars().next().map_or(false, |c| c.is_alphabetic() || c == '_')
                    && word.chars().all(|c| c.is_alphanumeric() || c == '_')
                {
                    Ok(Expr::Var(word))
                } else {
                    Err(format!("invalid token '{}'", word))
                }
            }
        },
    }
}

/// `VALUE` or `VALUE OP VALUE`.
pub fn parse_expr(text: &str) -> Result<Expr, String> {
    let mut tokens = tokenize(text)?.into_iter();
    let first = tokens.next().ok_or_else(|| "empty expression".to_string())?;
    let left = operand(first)?;
    match (tokens.next(), tokens.next(), tokens.next()) {
        (None, _, _) => Ok(left),
        (Some(Token::Op(op)), Some(right), None) => Ok(Expr::Binary(Box::new(left), op, Box::new(operand(right)?))),
        _ => Err(format!("cannot parse expression '{}'", text.trim())),
    }
}

/// Find the `=` of an assignment (`name = expr`), ignoring `==`, `!=`,
/// `<=` and `>=`.
pub fn split_assignment(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'=' {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(i + 1);
        if matches!(prev, Some(b'=' | b'!' | b'<' | b'>')) || next == Some(&b'=') {
            continue;
        }
        let name = text[..i].trim();
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Some((name, text[i + 1..].trim()));
        }
        return None;
    }
    None
}
