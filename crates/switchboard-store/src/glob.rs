//! Redis-style glob matching for channel patterns.
//!
//! Supports `*` (any run), `?` (any single byte) and `\` escapes. Character
//! classes are not supported; a `[` matches itself.

#[derive(Clone, Copy, PartialEq, Eq)]
enum Token {
    Star,
    One,
    Lit(u8),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut bytes = pattern.bytes();
    while let Some(b) = bytes.next() {
        tokens.push(match b {
            b'*' => Token::Star,
            b'?' => Token::One,
            b'\\' => Token::Lit(bytes.next().unwrap_or(b'\\')),
            other => Token::Lit(other),
        });
    }
    tokens
}

/// Whether `text` matches the glob `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pt = tokenize(pattern);
    let tb = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < tb.len() {
        match pt.get(pi) {
            Some(Token::One) => {
                pi += 1;
                ti += 1;
            }
            Some(Token::Lit(c)) if *c == tb[ti] => {
                pi += 1;
                ti += 1;
            }
            Some(Token::Star) => {
                star = Some((pi, ti));
                pi += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    while pt.get(pi) == Some(&Token::Star) {
        pi += 1;
    }
    pi == pt.len()
}

/// Escape glob metacharacters so `literal` matches only itself.
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
