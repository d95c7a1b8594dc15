//! Pairing descriptor parsing
//!
//! `tether://pair?host=<ip>&port=<int>&token=<secret>&name=<label>`

use reqwest::Url;
use thiserror::Error;

use super::types::Device;
use crate::protocol::DEFAULT_PORT;

/// URL scheme of pairing descriptors
pub const PAIR_SCHEME: &str = "tether";

#[derive(Debug, Error, PartialEq)]
pub enum PairingError {
    #[error("Invalid pairing URL: {0}")]
    InvalidUrl(String),

    #[error("Expected tether://pair?... URL, got: {0}")]
    WrongScheme(String),

    #[error("Missing host or token in pairing URL")]
    MissingField,

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Parse a pairing descriptor into a [`Device`].
pub fn parse_pair_url(raw: &str) -> Result<Device, PairingError> {
    let raw = raw.trim();
    let url = Url::parse(raw).map_err(|e| PairingError::InvalidUrl(e.to_string()))?;

    if url.scheme() != PAIR_SCHEME || url.host_str() != Some("pair") {
        return Err(PairingError::WrongScheme(raw.to_string()));
    }

    let mut host = None;
    let mut port = None;
    let mut token = None;
    let mut name = None;
    for (key, value) in url.query_pairs() {
        let value = value.into_owned();
        match key.as_ref() {
            "host" => host = Some(value),
            "port" => port = Some(value),
            "token" => token = Some(value),
            "name" => name = Some(value),
            _ => {}
        }
    }

    let host = host.filter(|h| !h.is_empty()).ok_or(PairingError::MissingField)?;
    let token = token.filter(|t| !t.is_empty()).ok_or(PairingError::MissingField)?;

    let port = match port.filter(|p| !p.is_empty()) {
        Some(p) => p.parse::<u16>().map_err(|_| PairingError::InvalidPort(p))?,
        None => DEFAULT_PORT,
    };

    let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| host.clone());

    Ok(Device {
        name,
        host,
        port,
        token,
    })
}

/// Render the descriptor for a device (inverse of [`parse_pair_url`]).
pub fn pair_url(device: &Device) -> Result<String, PairingError> {
    let mut url = Url::parse(&format!("{}://pair", PAIR_SCHEME))
        .map_err(|e| PairingError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("host", &device.host)
        .append_pair("port", &device.port.to_string())
        .append_pair("token", &device.token)
        .append_pair("name", &device.name);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let dev = parse_pair_url("tether://pair?host=10.0.0.5&token=abc123&name=Pixel").unwrap();
        assert_eq!(dev, Device::new("Pixel", "10.0.0.5", 8765, "abc123"));
    }

    #[test]
    fn test_name_defaults_to_host() {
        let dev = parse_pair_url("tether://pair?host=100.64.0.7&port=9000&token=t").unwrap();
        assert_eq!(dev.name, "100.64.0.7");
        assert_eq!(dev.port, 9000);
    }

    #[test]
    fn test_percent_encoded_name() {
        let dev = parse_pair_url("tether://pair?host=h&token=t&name=My%20Phone").unwrap();
        assert_eq!(dev.name, "My Phone");
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            parse_pair_url("tether://pair?host=10.0.0.5"),
            Err(PairingError::MissingField)
        );
        assert_eq!(
            parse_pair_url("tether://pair?token=abc"),
            Err(PairingError::MissingField)
        );
    }

    #[test]
    fn test_rejects_bad_scheme_and_port() {
        assert!(matches!(
            parse_pair_url("https://pair?host=h&token=t"),
            Err(PairingError::WrongScheme(_))
        ));
        assert!(matches!(
            parse_pair_url("tether://unpair?host=h&token=t"),
            Err(PairingError::WrongScheme(_))
        ));
        assert_eq!(
            parse_pair_url("tether://pair?host=h&token=t&port=http"),
            Err(PairingError::InvalidPort("http".into()))
        );
        assert!(matches!(
            parse_pair_url("not a url"),
            Err(PairingError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_pair_url_inverse() {
        let dev = Device::new("My Phone", "10.0.0.5", 8765, "a+b/c");
        assert_eq!(parse_pair_url(&pair_url(&dev).unwrap()).unwrap(), dev);
    }
}
