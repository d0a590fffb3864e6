//! SOAP invocation and layered response decoding
//!
//! A response goes through four stages, each usable on its own:
//! HTTP status ([`invoke`]), envelope and fault ([`action_response`]),
//! output extraction ([`outputs`]) and entity-unescape plus nested parse
//! ([`decode_value`]). The last stage only runs for values that contain an
//! escaped or literal opening angle bracket.

use crate::error::{HeosError, Result};
use crate::upnp::{Action, Service};
use quick_xml::escape::{escape, unescape};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use xmltree::{Element, XMLNode};

const ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Decoded output argument
#[derive(Debug, Clone, PartialEq)]
pub enum SoapValue {
    /// Plain value
    Text(String),
    /// Value that held an XML document
    Xml(Element),
    /// `DIDL-Lite` document, reduced to its items
    Items(Vec<Element>),
}

impl SoapValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SoapValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_xml(&self) -> Option<&Element> {
        match self {
            SoapValue::Xml(element) => Some(element),
            _ => None,
        }
    }

    pub fn as_items(&self) -> Option<&[Element]> {
        match self {
            SoapValue::Items(items) => Some(items),
            _ => None,
        }
    }
}

/// Output argument name to decoded value
pub type SoapResult = BTreeMap<String, SoapValue>;

/// Call `action` on `service`
///
/// Every declared input must be present in `args` or the call fails with
/// `MissingArgument` before any request is made.
pub async fn invoke(
    http: &reqwest::Client,
    service: &Service,
    action: &Action,
    args: &Map<String, Value>,
) -> Result<SoapResult> {
    validate(action, args)?;
    let body = envelope(&service.service_type, action, args);

    tracing::debug!("SOAP {}#{} -> {}", service.service_type, action.name, service.control_url);
    let response = http
        .post(service.control_url.clone())
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("SOAPACTION", format!("\"{}#{}\"", service.service_type, action.name))
        .body(body)
        .send()
        .await?;

    let status = response.status().as_u16();
    let text = response.text().await?;

    if status != 200 {
        // Faults usually come back as 500 with a SOAP body
        if let Ok(envelope) = Element::parse(text.as_bytes()) {
            if let Err(fault @ HeosError::SoapFault { .. }) = action_response(&envelope, &action.name) {
                return Err(fault);
            }
        }
        return Err(HeosError::HttpStatus { status, body: text });
    }

    let envelope = Element::parse(text.as_bytes())?;
    outputs(action_response(&envelope, &action.name)?, action)
}

/// Check that every declared input argument is supplied
pub fn validate(action: &Action, args: &Map<String, Value>) -> Result<()> {
    match action.inputs.iter().find(|arg| !args.contains_key(&arg.name)) {
        Some(missing) => Err(HeosError::MissingArgument {
            action: action.name.clone(),
            argument: missing.name.clone(),
        }),
        None => Ok(()),
    }
}

/// SOAP 1.1 request envelope with the declared inputs in declaration order
pub fn envelope(service_type: &str, action: &Action, args: &Map<String, Value>) -> String {
    let mut arguments = String::new();
    for arg in &action.inputs {
        let Some(value) = args.get(&arg.name) else {
            continue;
        };
        arguments.push_str(&format!(
            "<{name}>{value}</{name}>",
            name = arg.name,
            value = escape(&argument_text(value))
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="{envelope}" s:encodingStyle="{encoding}"><s:Body><u:{action} xmlns:u="{service_type}">{arguments}</u:{action}></s:Body></s:Envelope>"#,
        envelope = ENVELOPE_NS,
        encoding = ENCODING_STYLE,
        action = action.name,
        service_type = service_type,
        arguments = arguments
    )
}

fn argument_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Find `{action}Response` in an envelope, turning a fault into an error
pub fn action_response<'a>(envelope: &'a Element, action: &str) -> Result<&'a Element> {
    let body = envelope
        .get_child("Body")
        .ok_or_else(|| HeosError::InvalidResponse("Missing SOAP Body".to_string()))?;

    if let Some(fault) = body.get_child("Fault") {
        let error = fault
            .get_child("detail")
            .and_then(|d| d.get_child("UPnPError"));
        let code = error
            .and_then(|e| e.get_child("errorCode"))
            .and_then(|c| c.get_text())
            .and_then(|t| t.trim().parse::<u16>().ok())
            .unwrap_or(500);
        let description = error
            .and_then(|e| e.get_child("errorDescription"))
            .or_else(|| fault.get_child("faultstring"))
            .and_then(|d| d.get_text())
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        return Err(HeosError::SoapFault { code, description });
    }

    let name = format!("{}Response", action);
    body.get_child(name.as_str())
        .ok_or_else(|| HeosError::InvalidResponse(format!("Missing {}", name)))
}

/// Extract and decode every declared output argument
pub fn outputs(response: &Element, action: &Action) -> Result<SoapResult> {
    let mut result = BTreeMap::new();
    for arg in &action.outputs {
        let Some(element) = response.get_child(arg.name.as_str()) else {
            tracing::debug!("{} response lacks {}", action.name, arg.name);
            continue;
        };
        let raw = element.get_text().unwrap_or_default();
        result.insert(arg.name.clone(), decode_value(&raw)?);
    }
    Ok(result)
}

/// Unescape and parse a value that carries a nested XML document
pub fn decode_value(raw: &str) -> Result<SoapValue> {
    let text = if raw.contains("&lt;") {
        unescape(raw)
            .map_err(|e| HeosError::Xml(e.to_string()))?
            .into_owned()
    } else {
        raw.to_string()
    };

    if !text.trim_start().starts_with('<') {
        return Ok(SoapValue::Text(text));
    }

    match Element::parse(text.as_bytes()) {
        Ok(document) => Ok(unwrap_document(document)),
        Err(e) => {
            tracing::debug!("Value looks like XML but does not parse: {}", e);
            Ok(SoapValue::Text(text))
        }
    }
}

/// Strip the wrappers of state events and content directory listings
fn unwrap_document(document: Element) -> SoapValue {
    let name = document.name.clone();
    match name.as_str() {
        "Event" => {
            let instance = document.get_child("InstanceID").cloned();
            SoapValue::Xml(instance.unwrap_or(document))
        }
        "DIDL-Lite" => SoapValue::Items(
            document
                .children
                .into_iter()
                .filter_map(|node| match node {
                    XMLNode::Element(e) if e.name == "item" => Some(e),
                    _ => None,
                })
                .collect(),
        ),
        _ => SoapValue::Xml(document),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::{Argument, Direction};
    use serde_json::json;

    fn argument(name: &str, direction: Direction) -> Argument {
        Argument {
            name: name.to_string(),
            direction,
            related_state_variable: String::new(),
            data_type: Some("string".to_string()),
            allowed_values: Vec::new(),
        }
    }

    fn action() -> Action {
        Action {
            name: "GetVolume".to_string(),
            inputs: vec![
                argument("InstanceID", Direction::In),
                argument("Channel", Direction::In),
            ],
            outputs: vec![argument("CurrentVolume", Direction::Out)],
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_validate_reports_first_missing_input() {
        let err = validate(&action(), &args(json!({"InstanceID": 0}))).unwrap_err();
        match err {
            HeosError::MissingArgument { action, argument } => {
                assert_eq!(action, "GetVolume");
                assert_eq!(argument, "Channel");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(validate(&action(), &args(json!({"InstanceID": 0, "Channel": null}))).is_ok());
    }

    #[test]
    fn test_envelope_serializes_arguments() {
        let body = envelope(
            "urn:schemas-upnp-org:service:RenderingControl:1",
            &action(),
            &args(json!({"Channel": "Master & more", "InstanceID": 0, "Extra": "x"})),
        );

        assert!(body.contains(r#"<u:GetVolume xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">"#));
        assert!(body.contains("<InstanceID>0</InstanceID><Channel>Master &amp; more</Channel>"));
        assert!(!body.contains("Extra"));

        let nulls = envelope("urn:x", &action(), &args(json!({"InstanceID": null, "Channel": "Master"})));
        assert!(nulls.contains("<InstanceID></InstanceID>"));
    }

    #[test]
    fn test_action_response_and_outputs() {
        let xml = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
      <CurrentVolume>42</CurrentVolume>
    </u:GetVolumeResponse>
  </s:Body>
</s:Envelope>"#;
        let envelope = Element::parse(xml.as_bytes()).unwrap();
        let response = action_response(&envelope, "GetVolume").unwrap();
        let result = outputs(response, &action()).unwrap();

        assert_eq!(result["CurrentVolume"], SoapValue::Text("42".to_string()));
    }

    #[test]
    fn test_fault_becomes_error() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>402</errorCode>
          <errorDescription>Invalid Args</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let envelope = Element::parse(xml.as_bytes()).unwrap();
        match action_response(&envelope, "GetVolume").unwrap_err() {
            HeosError::SoapFault { code, description } => {
                assert_eq!(code, 402);
                assert_eq!(description, "Invalid Args");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_plain_text() {
        assert_eq!(decode_value("PLAYING").unwrap(), SoapValue::Text("PLAYING".to_string()));
        assert_eq!(decode_value("<3 love").unwrap(), SoapValue::Text("<3 love".to_string()));
    }

    #[test]
    fn test_decode_escaped_event() {
        let raw = r#"&lt;Event xmlns="urn:schemas-upnp-org:metadata-1-0/AVT/"&gt;&lt;InstanceID val="0"&gt;&lt;TransportState val="PLAYING"/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;"#;

        let instance = match decode_value(raw).unwrap() {
            SoapValue::Xml(e) => e,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(instance.name, "InstanceID");
        assert!(instance.get_child("TransportState").is_some());
    }

    #[test]
    fn test_decode_escaped_didl() {
        let raw = r#"&lt;DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" xmlns:dc="http://purl.org/dc/elements/1.1/"&gt;&lt;item id="1"&gt;&lt;dc:title&gt;Blue in Green&lt;/dc:title&gt;&lt;/item&gt;&lt;item id="2"&gt;&lt;dc:title&gt;So What&lt;/dc:title&gt;&lt;/item&gt;&lt;/DIDL-Lite&gt;"#;

        let value = decode_value(raw).unwrap();
        let items = value.as_items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].get_child("title").and_then(|t| t.get_text()).as_deref(),
            Some("So What")
        );
    }
}
