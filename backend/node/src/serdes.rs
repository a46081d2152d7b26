//! Wire-format serde helpers. Big integers cross the wire as decimal strings
//! and Ed25519 scalars/points as hex of their canonical 32-byte little-endian
//! encodings; both are fixed by interoperability with existing deployments.

/// Decimal-string representation for `BigInt` fields.
pub mod dec {
    use curv::arithmetic::Converter;
    use curv::BigInt;
    use serde::{ de, Deserialize, Deserializer, Serializer };

    pub fn serialize<S: Serializer>(v: &BigInt, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigInt, D::Error> {
        let raw = String::deserialize(d)?;
        BigInt::from_str_radix(&raw, 10).map_err(|_| {
            de::Error::custom(format!("not a decimal integer: {raw}"))
        })
    }
}

/// Decimal-string representation for `Vec<BigInt>` fields.
pub mod dec_vec {
    use curv::arithmetic::Converter;
    use curv::BigInt;
    use serde::{ de, Deserialize, Deserializer, Serializer };

    pub fn serialize<S: Serializer>(v: &[BigInt], s: S) -> Result<S::Ok, S::Error> {
        let strings: Vec<String> = v.iter().map(|b| b.to_str_radix(10)).collect();
        serde::Serialize::serialize(&strings, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<BigInt>, D::Error> {
        let strings = Vec::<String>::deserialize(d)?;
        strings
            .into_iter()
            .map(|raw| {
                BigInt::from_str_radix(&raw, 10).map_err(|_| {
                    de::Error::custom(format!("not a decimal integer: {raw}"))
                })
            })
            .collect()
    }
}

/// 32-byte little-endian scalar encoding, hex wrapped, for Ed25519.
pub mod ed_scalar {
    use curv::arithmetic::Converter;
    use curv::elliptic::curves::{ Ed25519, Scalar };
    use curv::BigInt;
    use serde::{ de, Deserialize, Deserializer, Serializer };

    pub fn to_le_bytes(v: &Scalar<Ed25519>) -> [u8; 32] {
        let be = v.to_bigint().to_bytes();
        let mut out = [0u8; 32];
        for (i, byte) in be.iter().rev().enumerate().take(32) {
            out[i] = *byte;
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Scalar<Ed25519>> {
        if bytes.len() != 32 {
            return None;
        }
        let be: Vec<u8> = bytes.iter().rev().cloned().collect();
        Some(Scalar::from_bigint(&BigInt::from_bytes(&be)))
    }

    pub fn serialize<S: Serializer>(v: &Scalar<Ed25519>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(to_le_bytes(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Scalar<Ed25519>, D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = hex::decode(&raw).map_err(de::Error::custom)?;
        from_le_bytes(&bytes).ok_or_else(|| de::Error::custom("not a 32-byte scalar"))
    }
}

/// Canonical 32-byte compressed-Edwards point encoding, hex wrapped.
pub mod ed_point {
    use curv::elliptic::curves::{ Ed25519, Point };
    use serde::{ de, Deserialize, Deserializer, Serializer };

    pub fn serialize<S: Serializer>(v: &Point<Ed25519>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(&*v.to_bytes(true)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Point<Ed25519>, D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = hex::decode(&raw).map_err(de::Error::custom)?;
        Point::from_bytes(&bytes).map_err(|_| de::Error::custom("not an Edwards point"))
    }
}

#[cfg(test)]
mod tests {
    use curv::arithmetic::Converter;
    use curv::elliptic::curves::{ Ed25519, Scalar };
    use curv::BigInt;
    use serde::{ Deserialize, Serialize };

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wire {
        #[serde(with = "super::dec")]
        n: BigInt,
        #[serde(with = "super::ed_scalar")]
        s: Scalar<Ed25519>,
    }

    #[test]
    fn decimal_and_le_scalar_roundtrip() {
        let wire = Wire {
            n: BigInt::from_str_radix("123456789012345678901234567890", 10).unwrap(),
            s: Scalar::random(),
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("123456789012345678901234567890"));
        let back: Wire = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wire);
    }

    #[test]
    fn scalar_le_encoding_is_32_bytes() {
        let one = Scalar::<Ed25519>::from_bigint(&BigInt::from(1));
        let bytes = super::ed_scalar::to_le_bytes(&one);
        assert_eq!(bytes[0], 1);
        assert!(bytes[1..].iter().all(|b| *b == 0));
    }
}
