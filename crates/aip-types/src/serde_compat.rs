//! Serde helpers shared by the wire and payload types.

/// Serialize `Vec<u8>` as a standard base64 string.
///
/// Envelope payloads are opaque bytes carried inside JSON frames; encoding
/// them as a JSON array of numbers would roughly quadruple their size.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Deserialize a string-or-number field into a `String`.
///
/// Tool arguments arrive as a JSON string in well-behaved clients, but some
/// callers send the object inline. Both forms are accepted and normalised to
/// the raw JSON text.
pub fn string_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}
