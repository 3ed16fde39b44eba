//! Shared serialization helpers.

/// Token amounts as decimal strings.
///
/// Wei-scale amounts overflow JavaScript numbers and many JSON tools, so they
/// are written as strings. Reading accepts either a string or a JSON integer
/// (integers only up to `u64::MAX`; larger values must be strings).
pub mod u128_decimal {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u128, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&value.to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D>(d: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(d)? {
            Repr::Number(n) => Ok(u128::from(n)),
            Repr::Text(text) => text
                .trim()
                .replace('_', "")
                .parse::<u128>()
                .map_err(|e| de::Error::custom(format!("invalid amount {:?}: {}", text, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Holder {
        #[serde(with = "super::u128_decimal")]
        amount: u128,
    }

    #[test]
    fn test_amount_written_as_string() {
        let h = Holder {
            amount: 100_000 * 10u128.pow(18),
        };
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, r#"{"amount":"100000000000000000000000"}"#);
    }

    #[test]
    fn test_amount_accepts_string_or_number() {
        let from_str: Holder = serde_json::from_str(r#"{"amount":"1_000"}"#).unwrap();
        let from_num: Holder = serde_json::from_str(r#"{"amount":1000}"#).unwrap();
        assert_eq!(from_str, from_num);
        assert!(serde_json::from_str::<Holder>(r#"{"amount":"-5"}"#).is_err());
    }
}
