//! UDMF `TEXTMAP` parsing.
//!
//! The textual map format is a flat list of global assignments and
//! `identifier { key = value; ... }` blocks.  Only the handful of
//! fields the node builder consumes are kept; everything else is
//! skipped.  Objects may appear in any order, so references are stored
//! raw and validated later by the builder.

use crate::bsp::util::round_to_integer;
use crate::wad::level::{
    GeoLinedef, GeoSidedef, GeoThing, GeoVertex, LevelError, LevelGeometry, MapFormat,
};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Text(String),
    Punct(char),
}

struct Lexer<'a> {
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { rest: src }
    }

    fn bump(&mut self, n: usize) {
        self.rest = &self.rest[n..];
    }

    fn skip_trivia(&mut self) -> Result<(), LevelError> {
        loop {
            self.rest = self.rest.trim_start();

            if let Some(stripped) = self.rest.strip_prefix("//") {
                self.rest = stripped.split_once('\n').map_or("", |(_, tail)| tail);
            } else if let Some(stripped) = self.rest.strip_prefix("/*") {
                self.rest = stripped
                    .split_once("*/")
                    .ok_or_else(|| LevelError::Textmap("unterminated comment".into()))?
                    .1;
            } else {
                return Ok(());
            }
        }
    }

    fn next(&mut self) -> Result<Option<Token>, LevelError> {
        self.skip_trivia()?;

        let mut chars = self.rest.chars();
        let Some(c) = chars.next() else {
            return Ok(None);
        };

        if c == '"' {
            let body = &self.rest[1..];
            let end = body
                .find('"')
                .ok_or_else(|| LevelError::Textmap("unterminated string".into()))?;
            let text = body[..end].to_owned();
            self.bump(end + 2);
            return Ok(Some(Token::Text(text)));
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let end = self
                .rest
                .find(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
                .unwrap_or(self.rest.len());
            let ident = self.rest[..end].to_ascii_lowercase();
            self.bump(end);
            return Ok(Some(Token::Ident(ident)));
        }

        if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' {
            let end = self.rest[1..]
                .find(|ch: char| !ch.is_ascii_hexdigit() && !"+-.xX".contains(ch))
                .map_or(self.rest.len(), |i| i + 1);
            let text = &self.rest[..end];

            let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16).map(|v| v as f64).ok()
            } else {
                text.parse::<f64>().ok()
            };

            let value =
                value.ok_or_else(|| LevelError::Textmap(format!("bad number: {text}")))?;
            self.bump(end);
            return Ok(Some(Token::Number(value)));
        }

        self.bump(c.len_utf8());
        Ok(Some(Token::Punct(c)))
    }

    fn expect_punct(&mut self, want: char) -> Result<(), LevelError> {
        match self.next()? {
            Some(Token::Punct(c)) if c == want => Ok(()),
            other => Err(LevelError::Textmap(format!(
                "expected '{want}', found {other:?}"
            ))),
        }
    }
}

/// One `key = value;` right-hand side.
#[derive(Clone, Debug)]
enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    fn number(&self) -> f64 {
        match self {
            Self::Number(v) => *v,
            _ => 0.0,
        }
    }

    fn index(&self) -> i32 {
        match self {
            Self::Number(v) => *v as i32,
            _ => -1,
        }
    }

    fn boolean(&self) -> bool {
        matches!(self, Self::Bool(true))
    }
}

fn read_value(lex: &mut Lexer<'_>) -> Result<Value, LevelError> {
    match lex.next()? {
        Some(Token::Number(v)) => Ok(Value::Number(v)),
        Some(Token::Text(s)) => Ok(Value::Text(s)),
        Some(Token::Ident(word)) => match word.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(LevelError::Textmap(format!("bad value: {other}"))),
        },
        other => Err(LevelError::Textmap(format!("missing value, found {other:?}"))),
    }
}

/// Parse one `{ ... }` block into (key, value) pairs.
fn read_block(lex: &mut Lexer<'_>) -> Result<Vec<(String, Value)>, LevelError> {
    let mut fields = Vec::new();

    loop {
        match lex.next()? {
            Some(Token::Punct('}')) => return Ok(fields),
            Some(Token::Ident(key)) => {
                lex.expect_punct('=')?;
                let value = read_value(lex)?;
                lex.expect_punct(';')?;
                fields.push((key, value));
            }
            other => {
                return Err(LevelError::Textmap(format!(
                    "expected key or '}}', found {other:?}"
                )));
            }
        }
    }
}

fn field<'a>(fields: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Parse a whole `TEXTMAP` lump into geometry arrays.
pub fn parse_textmap(data: &str, name: &str) -> Result<LevelGeometry, LevelError> {
    let mut geo = LevelGeometry {
        name: name.to_owned(),
        format: MapFormat::Udmf,
        vertices: Vec::new(),
        num_sectors: 0,
        sidedefs: Vec::new(),
        linedefs: Vec::new(),
        things: Vec::new(),
    };

    let mut lex = Lexer::new(data);

    while let Some(token) = lex.next()? {
        let Token::Ident(section) = token else {
            return Err(LevelError::Textmap(format!(
                "expected block name, found {token:?}"
            )));
        };

        match lex.next()? {
            // top-level assignment such as `namespace = "doom";`
            Some(Token::Punct('=')) => {
                read_value(&mut lex)?;
                lex.expect_punct(';')?;
                continue;
            }
            Some(Token::Punct('{')) => {}
            other => {
                return Err(LevelError::Textmap(format!(
                    "expected '{{' after {section}, found {other:?}"
                )));
            }
        }

        let fields = read_block(&mut lex)?;

        match section.as_str() {
            "vertex" => geo.vertices.push(GeoVertex {
                x: field(&fields, "x").map_or(0.0, Value::number),
                y: field(&fields, "y").map_or(0.0, Value::number),
            }),
            "linedef" => geo.linedefs.push(GeoLinedef {
                start: field(&fields, "v1").map_or(0, Value::index) as u32,
                end: field(&fields, "v2").map_or(0, Value::index) as u32,
                two_sided: field(&fields, "twosided").is_some_and(Value::boolean),
                special: field(&fields, "special").map_or(0, Value::index) as u16,
                tag: field(&fields, "id").map_or(0, Value::index) as i16,
                right: field(&fields, "sidefront").map_or(-1, Value::index),
                left: field(&fields, "sideback").map_or(-1, Value::index),
            }),
            "sidedef" => geo.sidedefs.push(GeoSidedef {
                sector: field(&fields, "sector").map_or(-1, Value::index),
            }),
            "sector" => geo.num_sectors += 1,
            "thing" => geo.things.push(GeoThing {
                x: round_to_integer(field(&fields, "x").map_or(0.0, Value::number)),
                y: round_to_integer(field(&fields, "y").map_or(0.0, Value::number)),
                kind: field(&fields, "type").map_or(0, Value::index) as u16,
            }),
            _ => {} // unknown block, already skipped
        }
    }

    Ok(geo)
}
