use std::{fmt, sync::OnceLock};

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Datatype, PropertyAttributes};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("Expected true or false, got [{0}]")]
    NotABoolean(String),
    #[error("Expected a number, got [{0}]")]
    NotANumber(String),
    #[error("Value [{value}] is outside of [{min:?}:{max:?}]")]
    OutOfRange {
        value: String,
        min: Option<String>,
        max: Option<String>,
    },
    #[error("[{value}] is not one of {allowed:?}")]
    NotInEnum { value: String, allowed: Vec<String> },
    #[error("Invalid {space} color [{value}]")]
    InvalidColor { space: ColorSpace, value: String },
    #[error("Invalid datetime [{0}]")]
    InvalidDateTime(String),
    #[error("Value {value:?} does not fit a {representation} representation")]
    Mismatch {
        value: PropertyValue,
        representation: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Rgb,
    Hsv,
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorSpace::Rgb => write!(f, "rgb"),
            ColorSpace::Hsv => write!(f, "hsv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorValue {
    Rgb { r: u8, g: u8, b: u8 },
    Hsv { h: u16, s: u8, v: u8 },
}

impl ColorValue {
    pub fn space(&self) -> ColorSpace {
        match self {
            ColorValue::Rgb { .. } => ColorSpace::Rgb,
            ColorValue::Hsv { .. } => ColorSpace::Hsv,
        }
    }

    pub fn parse(space: ColorSpace, payload: &str) -> Result<Self, ValueError> {
        static TRIPLE: OnceLock<Regex> = OnceLock::new();
        let triple = TRIPLE.get_or_init(|| {
            Regex::new(r"^\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})\s*$")
                .expect("color pattern is valid")
        });
        let invalid = || ValueError::InvalidColor {
            space,
            value: payload.to_owned(),
        };
        let captures = triple.captures(payload).ok_or_else(invalid)?;
        let part = |idx: usize| -> Result<u16, ValueError> {
            captures[idx].parse::<u16>().map_err(|_| invalid())
        };
        let (a, b, c) = (part(1)?, part(2)?, part(3)?);
        match space {
            ColorSpace::Rgb if a <= 255 && b <= 255 && c <= 255 => Ok(ColorValue::Rgb {
                r: a as u8,
                g: b as u8,
                b: c as u8,
            }),
            ColorSpace::Hsv if a <= 360 && b <= 100 && c <= 100 => Ok(ColorValue::Hsv {
                h: a,
                s: b as u8,
                v: c as u8,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ColorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorValue::Rgb { r, g, b } => write!(f, "{},{},{}", r, g, b),
            ColorValue::Hsv { h, s, v } => write!(f, "{},{},{}", h, s, v),
        }
    }
}

/// Typed value of a property, as received on its state topic or sent as a command.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Enum(String),
    Color(ColorValue),
    DateTime(DateTime<FixedOffset>),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(value) => write!(f, "{}", value),
            PropertyValue::Integer(value) => write!(f, "{}", value),
            PropertyValue::Float(value) => write!(f, "{}", value),
            PropertyValue::Enum(value) | PropertyValue::Text(value) => f.write_str(value),
            PropertyValue::Color(value) => write!(f, "{}", value),
            PropertyValue::DateTime(value) => f.write_str(&value.to_rfc3339()),
        }
    }
}

/// How a property's value is represented towards the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRepresentation {
    Switch,
    Color(ColorSpace),
    Enumeration(Vec<String>),
    Number {
        min: Option<f64>,
        max: Option<f64>,
        step: Option<f64>,
        unit: String,
        integer: bool,
    },
    Percentage {
        min: Option<f64>,
        max: Option<f64>,
        step: Option<f64>,
        integer: bool,
    },
    DateTime,
    Text,
}

impl fmt::Display for ValueRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueRepresentation::Switch => "switch",
            ValueRepresentation::Color(_) => "color",
            ValueRepresentation::Enumeration(_) => "enumeration",
            ValueRepresentation::Number { .. } => "number",
            ValueRepresentation::Percentage { .. } => "percentage",
            ValueRepresentation::DateTime => "datetime",
            ValueRepresentation::Text => "text",
        };
        f.write_str(name)
    }
}

impl ValueRepresentation {
    /// Picks the representation for a property from its (complete) attributes.
    pub fn derive(attributes: &PropertyAttributes) -> Self {
        match attributes.datatype {
            Datatype::Boolean => ValueRepresentation::Switch,
            Datatype::Color => derive_color(&attributes.format),
            Datatype::Enum => derive_enumeration(&attributes.format),
            Datatype::Integer | Datatype::Float => derive_number(attributes),
            Datatype::Datetime => ValueRepresentation::DateTime,
            Datatype::String => ValueRepresentation::Text,
        }
    }

    /// Converts an inbound payload.
    pub fn parse(&self, payload: &str) -> Result<PropertyValue, ValueError> {
        match self {
            ValueRepresentation::Switch => match payload {
                "true" => Ok(PropertyValue::Bool(true)),
                "false" => Ok(PropertyValue::Bool(false)),
                _ => Err(ValueError::NotABoolean(payload.to_owned())),
            },
            ValueRepresentation::Color(space) => {
                ColorValue::parse(*space, payload).map(PropertyValue::Color)
            }
            ValueRepresentation::Enumeration(allowed) => {
                if allowed.is_empty() || allowed.iter().any(|v| v == payload) {
                    Ok(PropertyValue::Enum(payload.to_owned()))
                } else {
                    Err(ValueError::NotInEnum {
                        value: payload.to_owned(),
                        allowed: allowed.clone(),
                    })
                }
            }
            ValueRepresentation::Number { integer, .. }
            | ValueRepresentation::Percentage { integer, .. } => parse_number(payload, *integer),
            ValueRepresentation::DateTime => parse_datetime(payload).map(PropertyValue::DateTime),
            ValueRepresentation::Text => Ok(PropertyValue::Text(payload.to_owned())),
        }
    }

    /// Validates `value` and renders it as a command payload.
    pub fn format(&self, value: &PropertyValue) -> Result<String, ValueError> {
        let mismatch = || ValueError::Mismatch {
            value: value.clone(),
            representation: self.to_string(),
        };
        match (self, value) {
            (ValueRepresentation::Switch, PropertyValue::Bool(value)) => Ok(value.to_string()),
            (ValueRepresentation::Color(space), PropertyValue::Color(color)) => {
                if color.space() == *space {
                    Ok(color.to_string())
                } else {
                    Err(mismatch())
                }
            }
            (ValueRepresentation::Enumeration(allowed), PropertyValue::Enum(value))
            | (ValueRepresentation::Enumeration(allowed), PropertyValue::Text(value)) => {
                if allowed.is_empty() || allowed.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(ValueError::NotInEnum {
                        value: value.clone(),
                        allowed: allowed.clone(),
                    })
                }
            }
            (
                ValueRepresentation::Number {
                    min, max, integer, ..
                }
                | ValueRepresentation::Percentage {
                    min, max, integer, ..
                },
                PropertyValue::Integer(_) | PropertyValue::Float(_),
            ) => format_number(value, *min, *max, *integer).ok_or_else(mismatch)?,
            (ValueRepresentation::DateTime, PropertyValue::DateTime(value)) => {
                Ok(value.to_rfc3339())
            }
            (ValueRepresentation::Text, value) => Ok(value.to_string()),
            _ => Err(mismatch()),
        }
    }
}

fn derive_color(format: &str) -> ValueRepresentation {
    match format {
        "rgb" => ValueRepresentation::Color(ColorSpace::Rgb),
        "hsv" => ValueRepresentation::Color(ColorSpace::Hsv),
        _ => {
            log::warn!(
                "Color format [{}] is neither rgb nor hsv, using a text representation",
                format
            );
            ValueRepresentation::Text
        }
    }
}

fn derive_enumeration(format: &str) -> ValueRepresentation {
    ValueRepresentation::Enumeration(
        format
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

fn derive_number(attributes: &PropertyAttributes) -> ValueRepresentation {
    let integer = attributes.datatype == Datatype::Integer;
    let (min, max) = parse_range(&attributes.format);
    let step = match (min, max) {
        (Some(min), Some(max)) => numeric_step(min, max, integer),
        _ => None,
    };
    if attributes.unit.contains('%') && attributes.settable {
        ValueRepresentation::Percentage {
            min,
            max,
            step,
            integer,
        }
    } else {
        ValueRepresentation::Number {
            min,
            max,
            step,
            unit: attributes.unit.clone(),
            integer,
        }
    }
}

/// Parses a `min:max` format, both bounds are optional.
pub fn parse_range(format: &str) -> (Option<f64>, Option<f64>) {
    let format = format.trim();
    if format.is_empty() {
        return (None, None);
    }
    let Some((min, max)) = format.split_once(':') else {
        log::warn!("Numeric format [{}] is not of the form min:max", format);
        return (None, None);
    };
    let bound = |bound: &str| {
        let bound = bound.trim();
        if bound.is_empty() {
            return None;
        }
        match bound.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(value),
            _ => {
                log::warn!("Ignoring invalid bound [{}] in format [{}]", bound, format);
                None
            }
        }
    };
    (bound(min), bound(max))
}

/// A hundredth of the range; whole numbers of at least 1 for integers.
pub fn numeric_step(min: f64, max: f64, integer: bool) -> Option<f64> {
    let step = (max - min).abs() / 100.0;
    if integer {
        Some(step.round().max(1.0))
    } else if step > 0.0 {
        Some(step)
    } else {
        None
    }
}

fn parse_number(payload: &str, integer: bool) -> Result<PropertyValue, ValueError> {
    let payload = payload.trim();
    if integer {
        payload
            .parse::<i64>()
            .map(PropertyValue::Integer)
            .map_err(|_| ValueError::NotANumber(payload.to_owned()))
    } else {
        match payload.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(PropertyValue::Float(value)),
            _ => Err(ValueError::NotANumber(payload.to_owned())),
        }
    }
}

fn format_number(
    value: &PropertyValue,
    min: Option<f64>,
    max: Option<f64>,
    integer: bool,
) -> Option<Result<String, ValueError>> {
    let out_of_range = |min: Option<String>, max: Option<String>| ValueError::OutOfRange {
        value: value.to_string(),
        min,
        max,
    };
    let (number, payload) = match *value {
        PropertyValue::Integer(number) => (number as f64, number.to_string()),
        PropertyValue::Float(number) => {
            if !number.is_finite() {
                return Some(Err(ValueError::NotANumber(value.to_string())));
            }
            if !integer {
                (number, number.to_string())
            } else if number.fract() != 0.0 {
                return None;
            } else if number < i64::MIN as f64 || number >= i64::MAX as f64 {
                // i64::MAX as f64 is 2^63, which no longer fits
                return Some(Err(out_of_range(
                    Some(i64::MIN.to_string()),
                    Some(i64::MAX.to_string()),
                )));
            } else {
                (number, (number as i64).to_string())
            }
        }
        _ => return None,
    };
    if min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max) {
        return Some(Err(out_of_range(
            min.map(|v| v.to_string()),
            max.map(|v| v.to_string()),
        )));
    }
    Some(Ok(payload))
}

fn parse_datetime(payload: &str) -> Result<DateTime<FixedOffset>, ValueError> {
    let payload = payload.trim();
    if let Ok(value) = DateTime::parse_from_rfc3339(payload) {
        return Ok(value);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(payload, fmt).ok())
        .map(|naive| naive.and_utc().fixed_offset())
        .ok_or_else(|| ValueError::InvalidDateTime(payload.to_owned()))
}
