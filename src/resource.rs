//! The REST resource adapter: method dispatch over a `PayloadCodec`,
//! matching `SpecializedResource<T>` in
//! `examples/original_source/server-cpp/include/sync-http-srv/resource.hh`.
//!
//! `RestResource` carries the value-level business logic (one method per
//! HTTP verb, returning `None` for anything it doesn't implement);
//! `ResourceEndpoint<R, C>` is the `Endpoint` that wires a resource to a
//! concrete wire format `C: PayloadCodec`, handles the OPTIONS/CORS
//! preflight short-circuit, and — mirroring `RESTTraits<T>::method_not_
//! allowed` in the original — falls back to the codec's own
//! method-not-allowed body whenever a resource declines a verb.

use std::net::TcpStream;

use crate::http::{HttpStatus, Method, RequestMsg, ResponseMsg};
use crate::payload::{PayloadCodec, PayloadValue};
use crate::route::UrlParams;
use crate::server::{Endpoint, HandleFlags};

/// Copies a request's body into an owned buffer. Shared by
/// `ResourceEndpoint` (to hand the parsed value to a resource) and by
/// resources that also need the raw bytes themselves (the process
/// resource, capturing a spawning request).
pub fn extract_body(request: &RequestMsg) -> Vec<u8> {
    request
        .content
        .as_ref()
        .map(|c| {
            let mut buf = vec![0u8; c.size()];
            c.copy_to(&mut buf, 0);
            buf
        })
        .unwrap_or_default()
}

/// Value-level REST logic for one resource. Every method receives the
/// request, parsed body, and route params; `Some(value)` is serialized
/// as the response body, `None` falls back to the codec's
/// method-not-allowed body (and a 405 status).
pub trait RestResource: Send + Sync {
    fn get(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        _response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<PayloadValue> {
        None
    }

    fn post(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        _response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<PayloadValue> {
        None
    }

    fn put(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        _response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<PayloadValue> {
        None
    }

    fn patch(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        _response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<PayloadValue> {
        None
    }

    fn delete(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        _response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<PayloadValue> {
        None
    }

    fn unknown_method(
        &self,
        _request: &RequestMsg,
        _params: &UrlParams,
        _value: &PayloadValue,
        _response: &mut ResponseMsg,
        _flags: &mut HandleFlags,
    ) -> Option<PayloadValue> {
        None
    }
}

pub struct ResourceEndpoint<R, C> {
    resource: R,
    codec: C,
}

impl<R, C> ResourceEndpoint<R, C> {
    pub fn new(resource: R, codec: C) -> Self {
        Self { resource, codec }
    }
}

impl<R: RestResource, C: PayloadCodec> Endpoint for ResourceEndpoint<R, C> {
    fn handle(
        &self,
        request: &RequestMsg,
        _client: &TcpStream,
        params: &UrlParams,
    ) -> (HandleFlags, Option<ResponseMsg>) {
        if request.method == Method::Options {
            let mut response = ResponseMsg::new(HttpStatus::NoContent);
            if let Some(m) = request.headers.get("access-control-request-method") {
                response.headers.set("access-control-allow-methods", m.to_string());
            }
            if let Some(h) = request.headers.get("access-control-request-headers") {
                response.headers.set("access-control-allow-headers", h.to_string());
            }
            return (HandleFlags::empty(), Some(response));
        }

        let body = extract_body(request);
        let value = match self.codec.parse_request_body(&body) {
            Ok(v) => v,
            Err(e) => {
                return (
                    HandleFlags::empty(),
                    Some(ResponseMsg::from_server_error(&e)),
                )
            }
        };

        let mut response = ResponseMsg::new(HttpStatus::Ok);
        let mut flags = HandleFlags::empty();
        let result = match request.method {
            Method::Get => self.resource.get(request, params, &value, &mut response, &mut flags),
            Method::Post => self.resource.post(request, params, &value, &mut response, &mut flags),
            Method::Put => self.resource.put(request, params, &value, &mut response, &mut flags),
            Method::Patch => self.resource.patch(request, params, &value, &mut response, &mut flags),
            Method::Delete => self.resource.delete(request, params, &value, &mut response, &mut flags),
            _ => self
                .resource
                .unknown_method(request, params, &value, &mut response, &mut flags),
        };

        let result = result.unwrap_or_else(|| {
            response.status = HttpStatus::MethodNotAllowed;
            self.codec.method_not_allowed()
        });

        if response.content.is_none() {
            self.codec.set_response_content(&mut response, &result);
        }

        (flags, Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpVersion;
    use crate::payload::JsonCodec;
    use crate::uri::Uri;
    use serde_json::json;

    struct PingResource;

    impl RestResource for PingResource {
        fn get(
            &self,
            _request: &RequestMsg,
            _params: &UrlParams,
            _value: &PayloadValue,
            _response: &mut ResponseMsg,
            _flags: &mut HandleFlags,
        ) -> Option<PayloadValue> {
            Some(json!({ "pong": true }))
        }
    }

    fn dummy_request(method: Method) -> RequestMsg {
        RequestMsg {
            version: HttpVersion::Http11,
            headers: crate::http::Headers::new(),
            content: None,
            method,
            raw_target: "/ping".to_string(),
            uri: Uri::parse("/ping").unwrap(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    #[test]
    fn get_is_dispatched_and_serialized_by_codec() {
        let endpoint = ResourceEndpoint::new(PingResource, JsonCodec);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();

        let (flags, response) =
            endpoint.handle(&dummy_request(Method::Get), &client, &UrlParams::new());
        assert!(flags.is_empty());
        let response = response.unwrap();
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn unmapped_verb_is_method_not_allowed() {
        let endpoint = ResourceEndpoint::new(PingResource, JsonCodec);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();

        let (_, response) =
            endpoint.handle(&dummy_request(Method::Put), &client, &UrlParams::new());
        let response = response.unwrap();
        assert_eq!(response.status.code(), 405);
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn options_short_circuits_without_touching_resource() {
        let endpoint = ResourceEndpoint::new(PingResource, JsonCodec);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();

        let (_, response) =
            endpoint.handle(&dummy_request(Method::Options), &client, &UrlParams::new());
        assert_eq!(response.unwrap().status.code(), 204);
    }
}
