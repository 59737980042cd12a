//! Conversion between register words and twin wire strings.
//!
//! Twin values travel as strings. Reads turn register words into the
//! string form of the twin's data type; writes turn a desired string back
//! into the single 16-bit word a register accepts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conversion failures.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("cannot parse '{value}' as {data_type}")]
    Parse { value: String, data_type: DataType },

    #[error("value {0} does not fit in a 16-bit register")]
    OutOfRange(f64),

    #[error("{0} values cannot be written to a register")]
    NotWritable(DataType),

    #[error("no register data to decode")]
    Empty,

    #[error("register data is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown data type '{0}'")]
    UnknownType(String),
}

/// Twin data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
    Double,
    Boolean,
    String,
}

impl DataType {
    /// Return the wire name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
            DataType::String => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(DataType::Int),
            "float" => Ok(DataType::Float),
            "double" => Ok(DataType::Double),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "string" => Ok(DataType::String),
            _ => Err(CodecError::UnknownType(s.to_string())),
        }
    }
}

/// How a value is laid out across registers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterLayout {
    /// Multiplier applied to decoded numbers (and divided out on writes).
    pub scale: f64,
    /// Swap the two bytes of every word.
    pub byte_swap: bool,
    /// Reverse the order of words.
    pub word_swap: bool,
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self {
            scale: 1.0,
            byte_swap: false,
            word_swap: false,
        }
    }
}

impl RegisterLayout {
    /// Effective scale; an unset (zero) scale means 1.
    fn scale(&self) -> f64 {
        if self.scale == 0.0 { 1.0 } else { self.scale }
    }

    fn arrange(&self, words: &[u16]) -> Vec<u16> {
        let mut words: Vec<u16> = words
            .iter()
            .map(|w| if self.byte_swap { w.swap_bytes() } else { *w })
            .collect();
        if self.word_swap {
            words.reverse();
        }
        words
    }
}

/// Decode register words into the wire string of `data_type`.
///
/// Numeric types read 1, 2 or 4 words as one value (16/32/64-bit). Any
/// other word count is decoded word by word and joined with commas, which
/// is how multi-channel aggregates (e.g. 21 shutter positions) are reported.
pub fn decode(
    words: &[u16],
    data_type: DataType,
    layout: &RegisterLayout,
) -> Result<String, CodecError> {
    if words.is_empty() {
        return Err(CodecError::Empty);
    }

    match data_type {
        DataType::Boolean => Ok(words.iter().any(|w| *w != 0).to_string()),
        DataType::String => decode_string(&layout.arrange(words)),
        DataType::Int | DataType::Float | DataType::Double => {
            let scale = layout.scale();
            match words.len() {
                1 | 2 | 4 => {
                    let value = numeric_value(&layout.arrange(words), data_type);
                    Ok(format_number(value * scale, data_type))
                }
                _ => Ok(words
                    .iter()
                    .map(|w| {
                        let word = layout.arrange(&[*w])[0];
                        format_number(f64::from(word as i16) * scale, data_type)
                    })
                    .collect::<Vec<_>>()
                    .join(",")),
            }
        }
    }
}

/// Encode a desired wire string into one register word.
///
/// Integers and floats accept -32768..=32767 after dividing by the scale,
/// the range a one-word reading decodes to. Floats are rounded to the
/// nearest integer. Negative values are written in two's complement.
pub fn encode(value: &str, data_type: DataType, layout: &RegisterLayout) -> Result<u16, CodecError> {
    let raw = value.trim();
    let parse_error = || CodecError::Parse {
        value: value.to_string(),
        data_type,
    };

    let word = match data_type {
        DataType::Boolean => u16::from(parse_bool(raw).ok_or_else(parse_error)?),
        DataType::String => return Err(CodecError::NotWritable(data_type)),
        DataType::Int => {
            let number = raw.parse::<i64>().map_err(|_| parse_error())?;
            to_word(number as f64 / layout.scale())?
        }
        DataType::Float | DataType::Double => {
            let number = raw.parse::<f64>().map_err(|_| parse_error())?;
            to_word(number / layout.scale())?
        }
    };

    Ok(if layout.byte_swap { word.swap_bytes() } else { word })
}

fn numeric_value(words: &[u16], data_type: DataType) -> f64 {
    let float = matches!(data_type, DataType::Float | DataType::Double);
    match words.len() {
        2 => {
            let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
            if float {
                f64::from(f32::from_bits(bits))
            } else {
                f64::from(bits as i32)
            }
        }
        4 => {
            let bits = words
                .iter()
                .fold(0u64, |acc, w| (acc << 16) | u64::from(*w));
            if float {
                f64::from_bits(bits)
            } else {
                bits as i64 as f64
            }
        }
        _ => f64::from(words[0] as i16),
    }
}

fn format_number(value: f64, data_type: DataType) -> String {
    if data_type == DataType::Int && value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn decode_string(words: &[u16]) -> Result<String, CodecError> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let text = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    Ok(text.trim_matches('\0').to_string())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

fn to_word(value: f64) -> Result<u16, CodecError> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < f64::from(i16::MIN) || rounded > f64::from(i16::MAX) {
        return Err(CodecError::OutOfRange(value));
    }

    Ok(rounded as i16 as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> RegisterLayout {
        RegisterLayout::default()
    }

    #[test]
    fn test_data_type_names() {
        assert_eq!("int".parse::<DataType>().unwrap(), DataType::Int);
        assert_eq!("Boolean".parse::<DataType>().unwrap(), DataType::Boolean);
        assert_eq!(DataType::Double.to_string(), "double");
        assert!(matches!(
            "uint8".parse::<DataType>(),
            Err(CodecError::UnknownType(_))
        ));
    }

    #[test]
    fn test_decode_int_widths() {
        assert_eq!(decode(&[42], DataType::Int, &plain()).unwrap(), "42");
        assert_eq!(decode(&[0xFFFF], DataType::Int, &plain()).unwrap(), "-1");
        assert_eq!(
            decode(&[0x0001, 0x0000], DataType::Int, &plain()).unwrap(),
            "65536"
        );
        assert_eq!(
            decode(&[0, 0, 0, 7], DataType::Int, &plain()).unwrap(),
            "7"
        );
    }

    #[test]
    fn test_decode_float() {
        let bits = 21.5f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(decode(&words, DataType::Float, &plain()).unwrap(), "21.5");

        // A single word is an integer reading.
        assert_eq!(decode(&[12], DataType::Float, &plain()).unwrap(), "12");
    }

    #[test]
    fn test_decode_scale_and_swaps() {
        let layout = RegisterLayout {
            scale: 0.5,
            ..Default::default()
        };
        assert_eq!(decode(&[85], DataType::Float, &layout).unwrap(), "42.5");

        let swapped = RegisterLayout {
            byte_swap: true,
            ..Default::default()
        };
        assert_eq!(decode(&[0x2A00], DataType::Int, &swapped).unwrap(), "42");

        let word_swapped = RegisterLayout {
            word_swap: true,
            ..Default::default()
        };
        assert_eq!(
            decode(&[0x0000, 0x0001], DataType::Int, &word_swapped).unwrap(),
            "65536"
        );
    }

    #[test]
    fn test_decode_multi_channel() {
        let words = [1, 2, 3];
        assert_eq!(decode(&words, DataType::Float, &plain()).unwrap(), "1,2,3");
    }

    #[test]
    fn test_decode_boolean_and_string() {
        assert_eq!(decode(&[0], DataType::Boolean, &plain()).unwrap(), "false");
        assert_eq!(decode(&[1], DataType::Boolean, &plain()).unwrap(), "true");
        assert_eq!(
            decode(&[0x4F4B, 0x0000], DataType::String, &plain()).unwrap(),
            "OK"
        );
        assert_eq!(decode(&[], DataType::Int, &plain()), Err(CodecError::Empty));
    }

    #[test]
    fn test_encode_numbers() {
        assert_eq!(encode("42", DataType::Int, &plain()).unwrap(), 42);
        assert_eq!(encode(" -1 ", DataType::Int, &plain()).unwrap(), 0xFFFF);
        assert_eq!(encode("32767", DataType::Int, &plain()).unwrap(), 0x7FFF);
        assert_eq!(encode("41.6", DataType::Float, &plain()).unwrap(), 42);

        let layout = RegisterLayout {
            scale: 0.1,
            ..Default::default()
        };
        assert_eq!(encode("4.2", DataType::Double, &layout).unwrap(), 42);
    }

    #[test]
    fn test_encode_rejects() {
        assert!(matches!(
            encode("fast", DataType::Int, &plain()),
            Err(CodecError::Parse { .. })
        ));
        assert!(matches!(
            encode("70000", DataType::Int, &plain()),
            Err(CodecError::OutOfRange(_))
        ));
        assert_eq!(
            encode("hello", DataType::String, &plain()),
            Err(CodecError::NotWritable(DataType::String))
        );
    }

    #[test]
    fn test_encode_range_matches_single_word_decode() {
        for value in ["32767", "-32768", "-1", "0"] {
            let word = encode(value, DataType::Int, &plain()).unwrap();
            assert_eq!(decode(&[word], DataType::Int, &plain()).unwrap(), value);
        }

        for value in ["32768", "65535", "-32769"] {
            assert!(matches!(
                encode(value, DataType::Int, &plain()),
                Err(CodecError::OutOfRange(_))
            ));
        }

        // Rounding happens before the range check.
        assert_eq!(encode("32767.4", DataType::Float, &plain()).unwrap(), 0x7FFF);
        assert!(matches!(
            encode("32767.5", DataType::Float, &plain()),
            Err(CodecError::OutOfRange(_))
        ));

        let tenths = RegisterLayout {
            scale: 0.1,
            ..Default::default()
        };
        let word = encode("3276.7", DataType::Float, &tenths).unwrap();
        let decoded: f64 = decode(&[word], DataType::Float, &tenths).unwrap().parse().unwrap();
        assert!((decoded - 3276.7).abs() < 1e-9);
        assert!(encode("3276.8", DataType::Float, &tenths).is_err());
    }

    #[test]
    fn test_encode_boolean() {
        assert_eq!(encode("true", DataType::Boolean, &plain()).unwrap(), 1);
        assert_eq!(encode("F", DataType::Boolean, &plain()).unwrap(), 0);
        assert!(encode("maybe", DataType::Boolean, &plain()).is_err());
    }

    #[test]
    fn test_encode_then_decode_with_byte_swap() {
        let layout = RegisterLayout {
            byte_swap: true,
            ..Default::default()
        };
        let word = encode("300", DataType::Int, &layout).unwrap();
        assert_eq!(word, 300u16.swap_bytes());
        assert_eq!(decode(&[word], DataType::Int, &layout).unwrap(), "300");
    }
}
