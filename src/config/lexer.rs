//! Tokeniser for the directive-block configuration grammar.

use super::ConfigError;

const SYMBOLS: &str = "{};";
const ATTRIBUTES: &[&str] = &[
    "root",
    "client_max_body_size",
    "listen",
    "index",
    "error_page",
    "server_name",
    "autoindex",
    "return",
    "cgi_enabled",
    "cgi_pass",
    "allow_methods",
    "upload_dir",
    "transfer_encoding",
];
const LEVELS: &[&str] = &["http", "server", "location"];

/// Characters allowed inside an unquoted word beyond alphanumerics.
const WORD_EXTRA: &str = "_./:=?&%@!*+~^$-\\";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Attribute,
    Level,
    Keyword,
    Number,
    String,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenType,
    pub value: String,
    pub quoted: bool,
}

impl Token {
    fn word(value: String) -> Self {
        let kind = if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            TokenType::Number
        } else if ATTRIBUTES.contains(&value.as_str()) {
            TokenType::Attribute
        } else if LEVELS.contains(&value.as_str()) {
            TokenType::Level
        } else {
            TokenType::String
        };
        Token {
            kind,
            value,
            quoted: false,
        }
    }
}

/// Tokenise `content`, then validate the resulting stream.
pub fn lex(content: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err(ConfigError::Lex("unclosed quote".into()));
            }
            let value: String = chars[start..i].iter().collect();
            i += 1;
            tokens.push(Token {
                kind: TokenType::String,
                value,
                quoted: true,
            });
            continue;
        }
        if SYMBOLS.contains(c) {
            tokens.push(Token {
                kind: TokenType::Symbol,
                value: c.to_string(),
                quoted: false,
            });
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() && !SYMBOLS.contains(chars[i]) {
            i += 1;
        }
        let value: String = chars[start..i].iter().collect();
        tokens.push(Token::word(value));
    }

    validate(&tokens)?;
    Ok(tokens)
}

fn validate(tokens: &[Token]) -> Result<(), ConfigError> {
    for token in tokens {
        match token.kind {
            TokenType::Symbol => {
                if !SYMBOLS.contains(token.value.as_str()) {
                    return Err(ConfigError::Lex(format!("invalid symbol: {}", token.value)));
                }
            }
            TokenType::Number => {
                if !token.value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ConfigError::Lex(format!("invalid number: {}", token.value)));
                }
            }
            TokenType::String | TokenType::Keyword if !token.quoted => {
                for c in token.value.chars() {
                    if !c.is_ascii_alphanumeric() && !WORD_EXTRA.contains(c) {
                        return Err(ConfigError::Lex(format!(
                            "invalid identifier: {}",
                            token.value
                        )));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_basic_server_block() {
        let tokens = lex("server { listen 80; root /www/; }").unwrap();
        let kinds: Vec<TokenType> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenType::Level,
                TokenType::Symbol,
                TokenType::Attribute,
                TokenType::Number,
                TokenType::Symbol,
                TokenType::Attribute,
                TokenType::String,
                TokenType::Symbol,
                TokenType::Symbol,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let tokens = lex("# full line comment\nserver {}").unwrap();
        assert_eq!(tokens[0].value, "server");
    }

    #[test]
    fn quoted_strings_preserve_content() {
        let tokens = lex(r#"index "weird name.html";"#).unwrap();
        assert_eq!(tokens[1].value, "weird name.html");
        assert!(tokens[1].quoted);
    }

    #[test]
    fn unclosed_quote_is_an_error() {
        assert!(lex(r#"root "unterminated"#).is_err());
    }

    #[test]
    fn rejects_invalid_symbol_free_floating() {
        // '(' is never emitted by the lexer as a symbol, but a word containing
        // disallowed punctuation should fail validation.
        assert!(lex("root /a(b);").is_err());
    }
}
