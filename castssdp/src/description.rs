//! Device description documents: HTTP fetch and XML parse.

use std::io::Read;
use std::time::Duration;

use quick_xml::{Error as XmlError, Reader, events::Event};
use thiserror::Error;
use tracing::debug;
use ureq::Agent;

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] ureq::Error),

    #[error("Failed to read HTTP body: {0}")]
    HttpIo(#[from] std::io::Error),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Missing required device element: {0}")]
    MissingField(&'static str),
}

/// One `<service>` entry of a description document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribedService {
    pub service_type: String,
    pub control_url: Option<String>,
    pub event_sub_url: Option<String>,
}

/// Parsed device description document.
#[derive(Debug, Default)]
pub struct DeviceDescription {
    pub friendly_name: String,
    pub model_name: String,
    pub model_number: String,
    pub model_description: String,
    pub manufacturer: String,
    pub application_url: Option<String>,
    pub services: Vec<DescribedService>,
    /// Raw response headers of the fetch, one `Name: value` per line.
    pub response_headers: String,
}

impl DeviceDescription {
    /// Fetch and parse the description document at `location`.
    pub fn fetch(location: &str, timeout: Duration) -> Result<Self, DescriptionError> {
        debug!("Fetching description document at {}", location);

        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        let agent: Agent = config.into();

        let response = agent.get(location).call()?;
        let (parts, body) = response.into_parts();

        let mut response_headers = String::new();
        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                response_headers.push_str(name.as_str());
                response_headers.push_str(": ");
                response_headers.push_str(value);
                response_headers.push('\n');
            }
        }
        let application_url = parts
            .headers
            .get("Application-URL")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut xml = String::new();
        body.into_reader().read_to_string(&mut xml)?;

        let mut parsed = Self::parse(&xml)?;
        parsed.response_headers = response_headers;
        if parsed.application_url.is_none() {
            parsed.application_url = application_url;
        }
        Ok(parsed)
    }

    /// Parse a description document from its XML text.
    pub fn parse(xml: &str) -> Result<Self, DescriptionError> {
        let mut reader = Reader::from_reader(xml.as_bytes());
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut parsed = DeviceDescription::default();

        let mut in_device = false;
        let mut in_service = false;
        let mut current_tag: Option<String> = None;
        let mut current_service = DescribedService::default();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match name.as_str() {
                        "device" => {
                            in_device = true;
                            current_tag = None;
                        }
                        "service" => {
                            if in_device {
                                in_service = true;
                                current_tag = None;
                                current_service = DescribedService::default();
                            }
                        }
                        _ => {
                            if in_device {
                                current_tag = Some(name);
                            }
                        }
                    }
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match name.as_str() {
                        "device" => {
                            in_device = false;
                        }
                        "service" => {
                            if in_device && in_service {
                                if !current_service.service_type.is_empty() {
                                    parsed.services.push(std::mem::take(&mut current_service));
                                }
                                in_service = false;
                            }
                        }
                        _ => {}
                    }
                    current_tag = None;
                }
                Event::Text(e) => {
                    if in_device {
                        if let Some(tag) = &current_tag {
                            let text = e.decode().map_err(XmlError::Encoding)?.into_owned();

                            match tag.as_str() {
                                "friendlyName" => {
                                    parsed.friendly_name = text;
                                }
                                "modelName" => {
                                    parsed.model_name = text;
                                }
                                "modelNumber" => {
                                    parsed.model_number = text;
                                }
                                "modelDescription" => {
                                    parsed.model_description = text;
                                }
                                "manufacturer" => {
                                    parsed.manufacturer = text;
                                }
                                "appUrl" | "applicationURL" => {
                                    parsed.application_url = Some(text);
                                }
                                "serviceType" if in_service => {
                                    current_service.service_type = text;
                                }
                                "controlURL" if in_service => {
                                    current_service.control_url = Some(text);
                                }
                                "eventSubURL" if in_service => {
                                    current_service.event_sub_url = Some(text);
                                }
                                _ => {}
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }

            buf.clear();
        }

        if parsed.friendly_name.is_empty() {
            return Err(DescriptionError::MissingField("friendlyName"));
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room TV</friendlyName>
    <manufacturer>LG Electronics</manufacturer>
    <modelDescription>webOS TV</modelDescription>
    <modelName>OLED55</modelName>
    <modelNumber>55EA9800</modelNumber>
    <serviceList>
      <service>
        <serviceType>urn:lge-com:service:webos-second-screen:1</serviceType>
        <controlURL>/control</controlURL>
        <eventSubURL>/events</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <controlURL>/av/control</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn parses_device_fields_and_services() {
        let parsed = DeviceDescription::parse(DESCRIPTION_XML).unwrap();
        assert_eq!(parsed.friendly_name, "Living Room TV");
        assert_eq!(parsed.model_name, "OLED55");
        assert_eq!(parsed.model_number, "55EA9800");
        assert_eq!(parsed.model_description, "webOS TV");
        assert_eq!(parsed.manufacturer, "LG Electronics");
        assert_eq!(parsed.services.len(), 2);
        assert_eq!(
            parsed.services[0].service_type,
            "urn:lge-com:service:webos-second-screen:1"
        );
        assert_eq!(parsed.services[0].control_url.as_deref(), Some("/control"));
        assert_eq!(parsed.services[1].event_sub_url, None);
    }

    #[test]
    fn missing_friendly_name_is_an_error() {
        let xml = r#"<root><device><modelName>X</modelName></device></root>"#;
        match DeviceDescription::parse(xml) {
            Err(DescriptionError::MissingField("friendlyName")) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(DeviceDescription::parse("<root><device></mismatch></root>").is_err());
    }
}
