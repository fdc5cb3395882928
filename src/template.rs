// Copyright 2020 Joyent, Inc.

//! Hex byte templates with named placeholders.
//!
//! A template such as `"02 sequence lenw 0x0d0a"` is a whitespace separated
//! list of hex literals and placeholder names. Rendering substitutes each
//! placeholder with its current value in the configured byte order:
//!
//! * `timestamp`  4 bytes, header timestamp
//! * `sequence`   2 bytes, header sequence id
//! * `lenb`       1 byte, length
//! * `lenw`       2 bytes, length
//! * `id`         2 bytes, message id

use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::ByteOrder;
use crate::error::DevCommError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(Vec<u8>),
    Timestamp,
    Sequence,
    LenByte,
    LenWord,
    Id,
}

/// Values substituted into a template at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateValues {
    pub timestamp: u32,
    pub sequence: u16,
    pub length: usize,
    pub id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteTemplate {
    tokens: Vec<Token>,
}

impl ByteTemplate {
    pub fn render(&self, values: &TemplateValues, order: ByteOrder) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.rendered_len());
        let mut word = [0u8; 2];
        let mut dword = [0u8; 4];

        for token in &self.tokens {
            match token {
                Token::Literal(bytes) => buf.put_slice(bytes),
                Token::Timestamp => {
                    order.write_u32(&mut dword, values.timestamp);
                    buf.put_slice(&dword);
                }
                Token::Sequence => {
                    order.write_u16(&mut word, values.sequence);
                    buf.put_slice(&word);
                }
                Token::LenByte => buf.put_u8(values.length as u8),
                Token::LenWord => {
                    order.write_u16(&mut word, values.length as u16);
                    buf.put_slice(&word);
                }
                Token::Id => {
                    order.write_u16(&mut word, values.id);
                    buf.put_slice(&word);
                }
            }
        }

        buf.freeze()
    }

    pub fn rendered_len(&self) -> usize {
        self.tokens
            .iter()
            .map(|t| match t {
                Token::Literal(bytes) => bytes.len(),
                Token::Timestamp => 4,
                Token::LenByte => 1,
                Token::Sequence | Token::LenWord | Token::Id => 2,
            })
            .sum()
    }
}

impl FromStr for ByteTemplate {
    type Err = DevCommError;

    fn from_str(s: &str) -> Result<ByteTemplate, DevCommError> {
        let tokens = s
            .split_whitespace()
            .map(parse_token)
            .collect::<Result<Vec<Token>, DevCommError>>()?;
        Ok(ByteTemplate { tokens })
    }
}

fn parse_token(word: &str) -> Result<Token, DevCommError> {
    match word {
        "timestamp" => return Ok(Token::Timestamp),
        "sequence" => return Ok(Token::Sequence),
        "lenb" => return Ok(Token::LenByte),
        "lenw" => return Ok(Token::LenWord),
        "id" => return Ok(Token::Id),
        _ => (),
    }

    let digits = word
        .strip_prefix("0x")
        .or_else(|| word.strip_prefix("0X"))
        .unwrap_or(word);
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(DevCommError::Template(format!(
            "'{}' is neither a placeholder nor an even-length hex literal",
            word
        )));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| {
                DevCommError::Template(format!("bad hex literal '{}'", word))
            })
        })
        .collect::<Result<Vec<u8>, DevCommError>>()
        .map(Token::Literal)
}
