//! Type-preserving value encoding.
//!
//! Built on `serde_json`. Polymorphism is handled by requiring the
//! caller to declare a closed variant set tagged with
//! `#[serde(tag = "...")]` rather than by any form of runtime type
//! erasure.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::CacheResult;

/// Encode `value` into its wire representation.
pub fn encode<T: Serialize>(value: &T) -> CacheResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a wire representation back into `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CacheResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Point {
        x: f64,
        y: f64,
        label: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(tag = "kind")]
    enum Shape {
        Circle { radius: f64 },
        Rectangle { width: f64, height: f64 },
    }

    #[test]
    fn round_trips_primitives() {
        assert_eq!(decode::<i64>(&encode(&42i64).unwrap()).unwrap(), 42);
        assert_eq!(decode::<bool>(&encode(&true).unwrap()).unwrap(), true);
        assert_eq!(
            decode::<String>(&encode(&"hello".to_string()).unwrap()).unwrap(),
            "hello"
        );
    }

    #[test]
    fn round_trips_floats_bit_exact() {
        let value = std::f64::consts::PI;
        let decoded: f64 = decode(&encode(&value).unwrap()).unwrap();
        assert_eq!(decoded.to_bits(), value.to_bits());
    }

    #[test]
    fn round_trips_struct_with_optional_field_omitted() {
        let point = Point {
            x: 1.5,
            y: -2.5,
            label: None,
        };
        let decoded: Point = decode(&encode(&point).unwrap()).unwrap();
        assert_eq!(decoded, point);
    }

    #[test]
    fn round_trips_struct_with_optional_field_present() {
        let point = Point {
            x: 1.5,
            y: -2.5,
            label: Some("origin".to_string()),
        };
        let decoded: Point = decode(&encode(&point).unwrap()).unwrap();
        assert_eq!(decoded, point);
    }

    #[test]
    fn round_trips_polymorphic_variant_set_preserving_concrete_variant() {
        let circle = Shape::Circle { radius: 2.0 };
        let decoded: Shape = decode(&encode(&circle).unwrap()).unwrap();
        assert_eq!(decoded, circle);
        assert!(matches!(decoded, Shape::Circle { .. }));

        let rect = Shape::Rectangle {
            width: 3.0,
            height: 4.0,
        };
        let decoded: Shape = decode(&encode(&rect).unwrap()).unwrap();
        assert_eq!(decoded, rect);
        assert!(matches!(decoded, Shape::Rectangle { .. }));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        assert!(decode::<i64>(b"not json").is_err());
    }
}
