//! Brace-field token streams.
//!
//! Command text is parsed into a flat sequence of literal segments and
//! field references. Field syntax is `{name}`, `{name.attr}` and
//! `{name[key]}` with arbitrary accessor chains; `{{` and `}}` escape
//! literal braces. A field whose base is `templates` is a reference to
//! another template and is spliced away during composition.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref FIELD_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Errors raised while parsing command text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Field base names may not start with a digit
    #[error("positional arguments are not supported: '{{{field}}}'")]
    Positional {
        /// The offending field text
        field: String,
    },

    /// A `{` was opened but never closed
    #[error("unterminated field reference starting at byte {at}")]
    Unterminated {
        /// Byte offset of the opening brace
        at: usize,
    },

    /// A `}` appeared outside any field (use `}}` for a literal brace)
    #[error("single '}}' encountered at byte {at}")]
    StrayBrace {
        /// Byte offset of the stray brace
        at: usize,
    },

    /// The field text does not match the supported grammar
    #[error("invalid field reference: '{{{field}}}'")]
    InvalidField {
        /// The offending field text
        field: String,
    },
}

/// One step of a field accessor chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    /// `.name` attribute access
    Attr(String),
    /// `[key]` index access
    Index(String),
}

/// A parsed field reference such as `jobs`, `TempFile.log` or `templates[build]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    /// The base variable name
    pub base: String,
    /// Accessors applied to the base value, in order
    pub accessors: Vec<Accessor>,
}

impl FieldRef {
    /// The referenced template name, if this field is `templates[<name>]`
    pub fn template_ref(&self) -> Option<&str> {
        if self.base != "templates" {
            return None;
        }
        match self.accessors.as_slice() {
            [Accessor::Index(name)] => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)?;
        for acc in &self.accessors {
            match acc {
                Accessor::Attr(a) => write!(f, ".{a}")?,
                Accessor::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// One segment of parsed command text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Verbatim text
    Literal(String),
    /// A field reference to be substituted at bind time
    Field(FieldRef),
}

/// A parsed command-text pattern
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    /// Parse command text into a token stream
    pub fn parse(text: &str) -> Result<Self, TokenError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let bytes = text.char_indices().collect::<Vec<_>>();
        let mut i = 0;

        while i < bytes.len() {
            let (at, c) = bytes[i];
            match c {
                '{' => {
                    if matches!(bytes.get(i + 1), Some((_, '{'))) {
                        literal.push('{');
                        i += 2;
                        continue;
                    }
                    let mut field = String::new();
                    let mut j = i + 1;
                    loop {
                        match bytes.get(j) {
                            Some((_, '}')) => break,
                            Some((_, ch)) => {
                                field.push(*ch);
                                j += 1;
                            }
                            None => return Err(TokenError::Unterminated { at }),
                        }
                    }
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Field(parse_field(&field)?));
                    i = j + 1;
                }
                '}' => {
                    if matches!(bytes.get(i + 1), Some((_, '}'))) {
                        literal.push('}');
                        i += 2;
                    } else {
                        return Err(TokenError::StrayBrace { at });
                    }
                }
                _ => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(Self { tokens })
    }

    /// Build a stream directly from tokens (used by the composer)
    pub(crate) fn from_tokens(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    /// The parsed segments
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Base variable names in first-reference order, excluding template references
    pub fn variables(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for token in &self.tokens {
            if let Token::Field(field) = token {
                if field.base != "templates" && seen.insert(field.base.clone()) {
                    out.push(field.base.clone());
                }
            }
        }
        out
    }

    /// True if any `templates[...]` reference remains
    pub fn has_template_refs(&self) -> bool {
        self.tokens.iter().any(|t| {
            matches!(t, Token::Field(f) if f.template_ref().is_some())
        })
    }

    /// Reconstruct the source text, re-escaping literal braces
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => {
                    out.push_str(&text.replace('{', "{{").replace('}', "}}"));
                }
                Token::Field(field) => {
                    out.push('{');
                    out.push_str(&field.to_string());
                    out.push('}');
                }
            }
        }
        out
    }
}

fn parse_field(field: &str) -> Result<FieldRef, TokenError> {
    let mut chars = field.char_indices().peekable();
    let mut base = String::new();
    while let Some((_, c)) = chars.peek() {
        if *c == '.' || *c == '[' {
            break;
        }
        base.push(*c);
        chars.next();
    }
    if base.is_empty() {
        return Err(TokenError::InvalidField {
            field: field.to_string(),
        });
    }
    if base.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(TokenError::Positional {
            field: field.to_string(),
        });
    }
    if !FIELD_NAME.is_match(&base) {
        return Err(TokenError::InvalidField {
            field: field.to_string(),
        });
    }

    let mut accessors = Vec::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '.' => {
                let mut attr = String::new();
                while let Some((_, c)) = chars.peek() {
                    if *c == '.' || *c == '[' {
                        break;
                    }
                    attr.push(*c);
                    chars.next();
                }
                if !FIELD_NAME.is_match(&attr) {
                    return Err(TokenError::InvalidField {
                        field: field.to_string(),
                    });
                }
                accessors.push(Accessor::Attr(attr));
            }
            '[' => {
                let mut key = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    key.push(c);
                }
                if !closed || key.is_empty() {
                    return Err(TokenError::InvalidField {
                        field: field.to_string(),
                    });
                }
                accessors.push(Accessor::Index(key));
            }
            _ => {
                return Err(TokenError::InvalidField {
                    field: field.to_string(),
                })
            }
        }
    }

    let parsed = FieldRef { base, accessors };
    // A templates[...] field admits exactly one bracketed name, nothing else
    if parsed.base == "templates" && parsed.template_ref().is_none() {
        return Err(TokenError::InvalidField {
            field: field.to_string(),
        });
    }
    Ok(parsed)
}
