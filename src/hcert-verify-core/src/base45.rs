//! Base45 text encoding (RFC 9285).
//!
//! QR alphanumeric mode packs two bytes into three characters of a 45-symbol
//! alphabet. Each 3-character chunk `c, d, e` encodes `c + d*45 + e*45^2`
//! (big-endian 16-bit); a trailing 2-character chunk encodes one byte.

use thiserror::Error;

const ALPHABET: &[u8; 45] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ $%*+-./:";

/// Base45 decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Base45Error {
    /// Character outside the alphabet.
    #[error("invalid character {character:?} at position {position}")]
    InvalidCharacter {
        /// Byte offset in the input.
        position: usize,
        /// Offending character.
        character: char,
    },

    /// Input length leaves a single dangling character.
    #[error("dangling trailing character (input length {length})")]
    DanglingCharacter {
        /// Input length.
        length: usize,
    },

    /// Chunk value does not fit in the bytes it encodes.
    #[error("chunk at position {position} overflows ({value})")]
    Overflow {
        /// Byte offset of the chunk.
        position: usize,
        /// Decoded chunk value.
        value: u32,
    },
}

fn symbol_value(position: usize, byte: u8) -> Result<u32, Base45Error> {
    ALPHABET
        .iter()
        .position(|&c| c == byte)
        .map(|v| v as u32)
        .ok_or(Base45Error::InvalidCharacter {
            position,
            character: char::from(byte),
        })
}

/// Decode base45 text.
///
/// # Errors
///
/// Returns an error for characters outside the alphabet, a dangling single
/// character, or a chunk that overflows.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, Base45Error> {
    if input.len() % 3 == 1 {
        return Err(Base45Error::DanglingCharacter {
            length: input.len(),
        });
    }

    let mut out = Vec::with_capacity(input.len() / 3 * 2 + 1);
    for (index, chunk) in input.chunks(3).enumerate() {
        let position = index * 3;
        let mut value = 0u32;
        let mut weight = 1u32;
        for (offset, &byte) in chunk.iter().enumerate() {
            value += symbol_value(position + offset, byte)? * weight;
            weight *= 45;
        }

        if chunk.len() == 3 {
            if value > 0xFFFF {
                return Err(Base45Error::Overflow { position, value });
            }
            out.push((value >> 8) as u8);
            out.push((value & 0xFF) as u8);
        } else {
            if value > 0xFF {
                return Err(Base45Error::Overflow { position, value });
            }
            out.push(value as u8);
        }
    }
    Ok(out)
}

/// Encode bytes as base45 text.
#[must_use]
pub fn encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(2) * 3);
    for chunk in input.chunks(2) {
        let (mut value, width) = match chunk {
            [a, b] => ((u32::from(*a) << 8) | u32::from(*b), 3),
            [a] => (u32::from(*a), 2),
            _ => unreachable!("chunks(2) yields one or two bytes"),
        };
        for _ in 0..width {
            out.push(char::from(ALPHABET[(value % 45) as usize]));
            value /= 45;
        }
    }
    out
}
