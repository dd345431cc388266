use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Object resource metadata, both as declared by the caller before an upload
/// and as returned by the server once the object is finalized.
///
/// The JSON API encodes `size` as a decimal string; it is coerced to `u64`
/// here. The raw response document is kept alongside the typed fields so
/// callers can reach fields this struct does not model.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metageneration: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_option_u64_from_string",
        serialize_with = "serialize_option_u64_as_string"
    )]
    pub size: Option<u64>,
    /// Declared total length of the upload, when the caller knows it up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32c: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, rename = "metadata", skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<BTreeMap<String, String>>,
    #[serde(skip)]
    pub raw: Value,
}

impl ObjectMetadata {
    pub fn from_value(value: Value) -> Self {
        let mut metadata: ObjectMetadata = serde_json::from_value(value.clone()).unwrap_or_default();
        metadata.raw = value;
        metadata
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size
    }
}

fn deserialize_option_u64_from_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_u64()),
        Some(Value::String(text)) => Ok(text.parse::<u64>().ok()),
        Some(_) => Ok(None),
    }
}

fn serialize_option_u64_as_string<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(number) => serializer.serialize_str(&number.to_string()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_encoded_size() {
        let metadata = ObjectMetadata::from_value(json!({
            "bucket": "photos",
            "name": "vacation.jpg",
            "size": "3145728",
            "contentType": "image/jpeg"
        }));
        assert_eq!(metadata.size_bytes(), Some(3_145_728));
        assert_eq!(metadata.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(metadata.raw()["bucket"], "photos");
    }

    #[test]
    fn tolerates_numeric_size() {
        let metadata = ObjectMetadata::from_value(json!({ "size": 42 }));
        assert_eq!(metadata.size_bytes(), Some(42));
    }
}
