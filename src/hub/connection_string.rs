//! `Key=Value;Key=Value` connection strings as used by IoT Hub, Event Hubs,
//! Service Bus and Storage.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionString {
    // Lower-cased key -> (original key, value)
    parts: BTreeMap<String, (String, String)>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Self {
        let parts = raw
            .split(';')
            .filter_map(|segment| {
                let segment = segment.trim();
                let (key, value) = segment.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((
                    key.to_ascii_lowercase(),
                    (key.to_string(), value.trim().to_string()),
                ))
            })
            .collect();
        Self { parts }
    }

    /// Case-insensitive lookup; empty values count as missing
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parts
            .get(&key.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Namespace or account name from an `Endpoint=sb://<ns>.servicebus...` entry
    pub fn endpoint_namespace(&self) -> Option<String> {
        self.get("Endpoint").and_then(host_label)
    }
}

/// First DNS label of a URL's host (`sb://ns.servicebus.windows.net/` -> `ns`)
pub fn host_label(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let host = parsed.host_str()?;
    host.split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(|label| label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hub_connection_string() {
        let cs = ConnectionString::parse(
            "HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=abc+def==",
        );
        assert_eq!(cs.get("hostname"), Some("myhub.azure-devices.net"));
        assert_eq!(cs.get("SharedAccessKeyName"), Some("iothubowner"));
        // Base64 padding survives the split on '='
        assert_eq!(cs.get("SharedAccessKey"), Some("abc+def=="));
    }

    #[test]
    fn test_empty_values_are_missing() {
        let cs = ConnectionString::parse("Endpoint=;EntityPath=hub1;;");
        assert_eq!(cs.get("Endpoint"), None);
        assert_eq!(cs.get("EntityPath"), Some("hub1"));
    }

    #[test]
    fn test_endpoint_namespace() {
        let cs = ConnectionString::parse(
            "Endpoint=sb://contoso-ns.servicebus.windows.net:5671/;SharedAccessKeyName=send;SharedAccessKey=****;EntityPath=telemetry",
        );
        assert_eq!(cs.endpoint_namespace().as_deref(), Some("contoso-ns"));
    }

    #[test]
    fn test_host_label() {
        assert_eq!(
            host_label("https://acct.documents.azure.com:443/").as_deref(),
            Some("acct")
        );
        assert_eq!(host_label("not a url"), None);
    }
}
