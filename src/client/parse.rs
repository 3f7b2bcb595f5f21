//! Parsers for PAN-OS management API responses.
//!
//! Every parser tolerates partially-missing fields: an absent sub-metric
//! becomes `None` rather than failing the whole call.

use super::ClientError;
use regex::Regex;
use std::sync::OnceLock;

/// Management-plane CPU breakdown from `show system resources`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MgmtCpuReading {
    pub cpu_user: Option<f64>,
    pub cpu_system: Option<f64>,
    pub cpu_idle: Option<f64>,
    /// user + system
    pub mgmt_cpu: Option<f64>,
}

/// Throughput and packet rate from `show session info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReading {
    pub throughput_mbps: Option<f64>,
    pub pps: Option<f64>,
}

/// Hardware and version metadata from `show system info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityReading {
    pub model: Option<String>,
    pub family: Option<String>,
    pub platform_family: Option<String>,
    pub serial: Option<String>,
    pub hostname: Option<String>,
    pub sw_version: Option<String>,
}

impl IdentityReading {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.family.is_none()
            && self.platform_family.is_none()
            && self.serial.is_none()
            && self.hostname.is_none()
            && self.sw_version.is_none()
    }
}

/// Check the API response envelope and surface error responses.
///
/// PAN-OS wraps every response in `<response status="..." code="...">`;
/// code 403 means the API key expired or was never valid.
pub fn check_response_status(xml: &str) -> Result<(), ClientError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| ClientError::Parse(format!("malformed response: {}", e)))?;
    let root = doc.root_element();

    if root.attribute("status") == Some("error") {
        let code = root.attribute("code").unwrap_or("");
        let msg = root
            .descendants()
            .filter(|n| n.has_tag_name("msg") || n.has_tag_name("line"))
            .filter_map(|n| n.text())
            .collect::<Vec<_>>()
            .join("; ");
        if code == "403" || msg.contains("Invalid credentials") {
            return Err(ClientError::AuthExpired);
        }
        return Err(ClientError::Api(format!("code={} {}", code, msg)));
    }
    Ok(())
}

/// Extract the API key from a keygen response.
pub fn parse_keygen(xml: &str) -> Result<String, ClientError> {
    check_response_status(xml)?;
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| ClientError::Parse(format!("malformed keygen response: {}", e)))?;

    doc.descendants()
        .find(|n| n.has_tag_name("key"))
        .and_then(|n| n.text())
        .map(|s| s.to_string())
        .ok_or_else(|| ClientError::Parse("key not found in keygen response".to_string()))
}

fn cpu_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)%?Cpu\(s\)[^0-9]*([0-9.]+)\s*us[, ]+\s*([0-9.]+)\s*sy[, ]+.*?([0-9.]+)\s*id")
            .unwrap()
    })
}

/// Management CPU from the `top` CDATA inside `show system resources`.
///
/// The payload is free text, so this is the one regex-driven parser.
pub fn parse_mgmt_cpu(xml: &str) -> MgmtCpuReading {
    let raw = match roxmltree::Document::parse(xml) {
        Ok(doc) => doc
            .descendants()
            .find(|n| n.has_tag_name("result"))
            .and_then(|n| n.text())
            .map(|s| s.to_string())
            .unwrap_or_else(|| collect_all_text(&doc)),
        Err(_) => xml.to_string(),
    };

    let text = raw.replace(['\r', '\n'], " ");
    let mut out = MgmtCpuReading::default();
    if let Some(caps) = cpu_line_regex().captures(&text) {
        let usr: Option<f64> = caps[1].parse().ok();
        let sys: Option<f64> = caps[2].parse().ok();
        let idle: Option<f64> = caps[3].parse().ok();
        out.cpu_user = usr;
        out.cpu_system = sys;
        out.cpu_idle = idle;
        if let (Some(u), Some(s)) = (usr, sys) {
            out.mgmt_cpu = Some(u + s);
        }
    }
    out
}

fn collect_all_text(doc: &roxmltree::Document) -> String {
    doc.root()
        .descendants()
        .filter_map(|n| n.text())
        .collect::<Vec<_>>()
        .join("")
}

/// Numbers out of a comma-separated value list; non-numeric entries skipped.
fn numbers_from_csv(text: &str) -> Vec<f64> {
    text.split(',')
        .filter_map(|x| {
            let xs = x.trim();
            if xs.is_empty() {
                return None;
            }
            xs.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
        })
        .collect()
}

/// Per-core data-plane CPU load from the resource monitor.
///
/// Walks every data processor's `minute/cpu-load-maximum` entries and takes
/// the newest sample per core (value arrays are newest first). Arrays in
/// true-fractional form (all values in 0..=1 with decimals) are scaled to
/// percent.
pub fn parse_dp_core_loads(xml: &str) -> Vec<f64> {
    let doc = match roxmltree::Document::parse(xml) {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };

    let mut per_core_latest = Vec::new();
    for max_node in doc.descendants().filter(|n| n.has_tag_name("cpu-load-maximum")) {
        // Only the per-minute series carries live per-core data.
        if !has_ancestor(max_node, "minute") {
            continue;
        }
        for value in max_node
            .descendants()
            .filter(|n| n.has_tag_name("value"))
            .filter_map(|n| n.text())
        {
            let arr = numbers_from_csv(value);
            if arr.is_empty() {
                continue;
            }
            let mut newest = arr[0];
            let has_decimals = arr.iter().any(|v| *v > 0.0 && v.fract() != 0.0);
            let max = arr.iter().cloned().fold(f64::MIN, f64::max);
            if has_decimals && max <= 1.0 {
                newest *= 100.0;
            }
            per_core_latest.push(newest);
        }
    }
    per_core_latest
}

fn has_ancestor(node: roxmltree::Node, tag: &str) -> bool {
    node.ancestors().any(|a| a.has_tag_name(tag))
}

/// Live packet buffer utilization percent from the resource monitor.
///
/// Averages the newest "packet buffer (maximum)" value across data
/// processor groups. Returns `None` when no group reports one.
pub fn parse_packet_buffer(xml: &str) -> Option<f64> {
    let doc = roxmltree::Document::parse(xml).ok()?;

    let mut latest_vals = Vec::new();
    for entry in doc
        .descendants()
        .filter(|n| n.has_tag_name("resource-utilization"))
        .flat_map(|n| n.children().filter(|c| c.has_tag_name("entry")))
    {
        let name = entry
            .children()
            .find(|c| c.has_tag_name("name"))
            .and_then(|c| c.text())
            .unwrap_or("")
            .to_lowercase();
        if !name.contains("packet buffer (maximum)") {
            continue;
        }
        if let Some(value) = entry
            .children()
            .find(|c| c.has_tag_name("value"))
            .and_then(|c| c.text())
        {
            let arr = numbers_from_csv(value);
            if let Some(first) = arr.first() {
                latest_vals.push(*first);
            }
        }
    }

    if latest_vals.is_empty() {
        None
    } else {
        Some(latest_vals.iter().sum::<f64>() / latest_vals.len() as f64)
    }
}

/// Throughput (kbps -> Mbps) and packet rate from `show session info`.
pub fn parse_session_info(xml: &str) -> SessionReading {
    let mut out = SessionReading::default();
    let doc = match roxmltree::Document::parse(xml) {
        Ok(d) => d,
        Err(_) => return out,
    };

    out.throughput_mbps = find_text(&doc, "kbps")
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|kbps| kbps / 1000.0);
    out.pps = find_text(&doc, "pps").and_then(|s| s.trim().parse::<f64>().ok());
    out
}

/// Hardware identity from `show system info`.
pub fn parse_system_info(xml: &str) -> IdentityReading {
    let doc = match roxmltree::Document::parse(xml) {
        Ok(d) => d,
        Err(_) => return IdentityReading::default(),
    };

    IdentityReading {
        model: find_text(&doc, "model"),
        family: find_text(&doc, "family"),
        platform_family: find_text(&doc, "platform-family"),
        serial: find_text(&doc, "serial"),
        hostname: find_text(&doc, "hostname"),
        sw_version: find_text(&doc, "sw-version"),
    }
}

fn find_text(doc: &roxmltree::Document, tag: &str) -> Option<String> {
    doc.descendants()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keygen() {
        let xml = r#"<response status="success"><result><key>LUFRPT1abc==</key></result></response>"#;
        assert_eq!(parse_keygen(xml).unwrap(), "LUFRPT1abc==");
    }

    #[test]
    fn test_parse_keygen_missing_key() {
        let xml = r#"<response status="success"><result></result></response>"#;
        assert!(matches!(parse_keygen(xml), Err(ClientError::Parse(_))));
    }

    #[test]
    fn test_auth_error_code_maps_to_expired() {
        let xml = r#"<response status="error" code="403"><result><msg>Invalid credentials.</msg></result></response>"#;
        assert!(matches!(check_response_status(xml), Err(ClientError::AuthExpired)));
    }

    #[test]
    fn test_other_api_error() {
        let xml = r#"<response status="error" code="400"><result><msg>bad command</msg></result></response>"#;
        assert!(matches!(check_response_status(xml), Err(ClientError::Api(_))));
    }

    #[test]
    fn test_parse_mgmt_cpu_from_top() {
        let xml = r#"<response status="success"><result><![CDATA[
top - 12:00:01 up 3 days
%Cpu(s):  7.2 us,  3.1 sy,  0.0 ni, 88.9 id,  0.5 wa
MiB Mem : 16000 total
]]></result></response>"#;
        let cpu = parse_mgmt_cpu(xml);
        assert_eq!(cpu.cpu_user, Some(7.2));
        assert_eq!(cpu.cpu_system, Some(3.1));
        assert_eq!(cpu.cpu_idle, Some(88.9));
        assert!((cpu.mgmt_cpu.unwrap() - 10.3).abs() < 1e-9);
    }

    #[test]
    fn test_parse_mgmt_cpu_pattern_missing() {
        let xml = r#"<response><result>nothing useful here</result></response>"#;
        let cpu = parse_mgmt_cpu(xml);
        assert_eq!(cpu.mgmt_cpu, None);
    }

    const RM_XML: &str = r#"<response status="success"><result><resource-monitor>
      <data-processors><dp0><minute>
        <cpu-load-maximum>
          <entry><coreid>0</coreid><value>34,30,28</value></entry>
          <entry><coreid>1</coreid><value>61,55,40</value></entry>
        </cpu-load-maximum>
        <resource-utilization>
          <entry><name>packet buffer (maximum)</name><value>12,9,7</value></entry>
          <entry><name>session (average)</name><value>3,3,3</value></entry>
        </resource-utilization>
      </minute></dp0></data-processors>
    </resource-monitor></result></response>"#;

    #[test]
    fn test_parse_dp_core_loads() {
        let cores = parse_dp_core_loads(RM_XML);
        assert_eq!(cores, vec![34.0, 61.0]);
    }

    #[test]
    fn test_parse_dp_core_loads_fractional_normalized() {
        let xml = r#"<r><data-processors><dp0><minute><cpu-load-maximum>
            <entry><value>0.85,0.5,0.25</value></entry>
        </cpu-load-maximum></minute></dp0></data-processors></r>"#;
        let cores = parse_dp_core_loads(xml);
        assert_eq!(cores, vec![85.0]);
    }

    #[test]
    fn test_parse_packet_buffer() {
        assert_eq!(parse_packet_buffer(RM_XML), Some(12.0));
    }

    #[test]
    fn test_parse_packet_buffer_absent() {
        let xml = r#"<r><resource-utilization>
            <entry><name>session (average)</name><value>3</value></entry>
        </resource-utilization></r>"#;
        assert_eq!(parse_packet_buffer(xml), None);
    }

    #[test]
    fn test_parse_session_info() {
        let xml = r#"<response status="success"><result>
            <kbps>250000</kbps><pps>41000</pps><num-active>1234</num-active>
        </result></response>"#;
        let s = parse_session_info(xml);
        assert_eq!(s.throughput_mbps, Some(250.0));
        assert_eq!(s.pps, Some(41000.0));
    }

    #[test]
    fn test_parse_session_info_partial() {
        let xml = r#"<response><result><kbps>1000</kbps></result></response>"#;
        let s = parse_session_info(xml);
        assert_eq!(s.throughput_mbps, Some(1.0));
        assert_eq!(s.pps, None);
    }

    #[test]
    fn test_parse_system_info() {
        let xml = r#"<response status="success"><result><system>
            <hostname>dc-fw-01</hostname>
            <model>PA-3430</model>
            <family>3000</family>
            <platform-family>pa-3400-series</platform-family>
            <serial>001234567890</serial>
            <sw-version>11.0.3</sw-version>
        </system></result></response>"#;
        let id = parse_system_info(xml);
        assert_eq!(id.model.as_deref(), Some("PA-3430"));
        assert_eq!(id.hostname.as_deref(), Some("dc-fw-01"));
        assert_eq!(id.sw_version.as_deref(), Some("11.0.3"));
        assert!(!id.is_empty());
    }

    #[test]
    fn test_numbers_from_csv_skips_garbage() {
        assert_eq!(numbers_from_csv("10, x, 20.5,,"), vec![10.0, 20.5]);
    }
}
