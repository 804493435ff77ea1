//! The payload-format shim: `PayloadCodec` abstracts the REST resource
//! adapter over JSON and YAML bodies, the way `resource-json.cc`/
//! `resource-yaml.cc` specialize `RESTTraits<T>` for each format.
//!
//! Both codecs share `PayloadValue` (a `serde_json::Value`) as their
//! common in-memory representation; the YAML codec only differs in how
//! it serializes/deserializes across the wire.

use serde_json::{json, Value};

use crate::error::{ServerError, ServerResult};
use crate::http::ResponseMsg;

pub type PayloadValue = Value;

pub trait PayloadCodec: Send + Sync {
    fn content_type_str(&self) -> &'static str;
    fn parse_request_body(&self, bytes: &[u8]) -> ServerResult<PayloadValue>;
    fn set_response_content(&self, response: &mut ResponseMsg, value: &PayloadValue);
    fn method_not_allowed(&self) -> PayloadValue;
    fn errors(&self, messages: &[String]) -> PayloadValue {
        json!({ "errors": messages })
    }
}

pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn content_type_str(&self) -> &'static str {
        "application/json"
    }

    fn parse_request_body(&self, bytes: &[u8]) -> ServerResult<PayloadValue> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| ServerError::request(format!("bad JSON body: {e}")))
    }

    fn set_response_content(&self, response: &mut ResponseMsg, value: &PayloadValue) {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        response.headers.set("content-type", self.content_type_str());
        response.content = Some(Box::new(crate::http::InMemoryContent::from_bytes(body)));
    }

    fn method_not_allowed(&self) -> PayloadValue {
        json!({ "errors": ["Method not allowed"] })
    }
}

pub struct YamlCodec;

impl PayloadCodec for YamlCodec {
    fn content_type_str(&self) -> &'static str {
        "application/x-yaml"
    }

    fn parse_request_body(&self, bytes: &[u8]) -> ServerResult<PayloadValue> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes)
            .map_err(|e| ServerError::request(format!("bad YAML body: {e}")))?;
        serde_json::to_value(yaml)
            .map_err(|e| ServerError::request(format!("unrepresentable YAML body: {e}")))
    }

    fn set_response_content(&self, response: &mut ResponseMsg, value: &PayloadValue) {
        let body = serde_yaml::to_string(value).unwrap_or_else(|_| "null\n".to_string());
        response.headers.set("content-type", self.content_type_str());
        response.content = Some(Box::new(crate::http::InMemoryContent::from_bytes(
            body.into_bytes(),
        )));
    }

    fn method_not_allowed(&self) -> PayloadValue {
        json!({ "errors": ["Method not allowed"] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips_object() {
        let codec = JsonCodec;
        let value = codec.parse_request_body(br#"{"name":"w"}"#).unwrap();
        assert_eq!(value["name"], "w");

        let mut resp = ResponseMsg::new(crate::http::HttpStatus::Ok);
        codec.set_response_content(&mut resp, &value);
        assert_eq!(resp.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn yaml_codec_round_trips_object() {
        let codec = YamlCodec;
        let value = codec.parse_request_body(b"name: w\n").unwrap();
        assert_eq!(value["name"], "w");

        let mut resp = ResponseMsg::new(crate::http::HttpStatus::Ok);
        codec.set_response_content(&mut resp, &value);
        assert_eq!(resp.headers.get("content-type"), Some("application/x-yaml"));
    }

    #[test]
    fn empty_body_parses_as_null() {
        assert_eq!(JsonCodec.parse_request_body(b"").unwrap(), Value::Null);
        assert_eq!(YamlCodec.parse_request_body(b"").unwrap(), Value::Null);
    }
}
