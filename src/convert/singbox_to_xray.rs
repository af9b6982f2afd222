use serde_json::{json, Map, Value};

use super::{
    as_object, join, objects, port_value, rename_fields, string_items, ConfigConverter,
    Conversion, Direction, Warnings, ACCOUNT_FIELDS, CLIENT_FIELDS,
};
use crate::error::{Error, Result};
use crate::types::CoreType;

pub struct SingBoxToXray;

impl ConfigConverter for SingBoxToXray {
    fn source(&self) -> CoreType {
        CoreType::SingBox
    }

    fn target(&self) -> CoreType {
        CoreType::Xray
    }

    fn convert(&self, document: &Value) -> Result<Conversion> {
        let root = document
            .as_object()
            .ok_or_else(|| Error::invalid_input("sing-box config must be a JSON object"))?;

        let mut warnings = Warnings::new(CoreType::Xray);
        let mut out = Map::new();

        for (key, value) in root {
            match key.as_str() {
                "log" => {
                    if let Some(log) = convert_log(value, &mut warnings) {
                        out.insert("log".to_string(), log);
                    }
                }
                "inbounds" => {
                    let inbounds = objects(value, "inbounds", &mut warnings)
                        .into_iter()
                        .filter_map(|(path, inbound)| convert_inbound(&path, inbound, &mut warnings))
                        .collect();
                    out.insert("inbounds".to_string(), Value::Array(inbounds));
                }
                "outbounds" => {
                    let outbounds = objects(value, "outbounds", &mut warnings)
                        .into_iter()
                        .filter_map(|(path, outbound)| {
                            convert_outbound(&path, outbound, &mut warnings)
                        })
                        .collect();
                    out.insert("outbounds".to_string(), Value::Array(outbounds));
                }
                "route" => {
                    if let Some(routing) = convert_route(value, &mut warnings) {
                        out.insert("routing".to_string(), routing);
                    }
                }
                other => warnings.dropped(other),
            }
        }

        Ok(Conversion {
            document: Value::Object(out),
            warnings: warnings.into_vec(),
        })
    }
}

fn convert_log(value: &Value, warnings: &mut Warnings) -> Option<Value> {
    let log = as_object(value, "log", warnings)?;
    let mut level = None;
    let mut disabled = false;

    for (key, value) in log {
        match (key.as_str(), value) {
            ("disabled", Value::Bool(flag)) => disabled = *flag,
            ("level", Value::String(name)) => {
                level = Some(match name.as_str() {
                    "warn" => "warning",
                    "trace" => {
                        warnings.note("log.level", "trace mapped to debug");
                        "debug"
                    }
                    "fatal" | "panic" => {
                        warnings.note("log.level", format!("{} mapped to error", name));
                        "error"
                    }
                    other => other,
                });
            }
            (other, _) => warnings.dropped(&join("log", other)),
        }
    }

    let mut out = Map::new();
    if disabled {
        out.insert("loglevel".to_string(), json!("none"));
    } else if let Some(level) = level {
        out.insert("loglevel".to_string(), json!(level));
    }
    Some(Value::Object(out))
}

fn inbound_protocol(kind: &str) -> Option<&'static str> {
    match kind {
        "direct" => Some("dokodemo-door"),
        "vmess" => Some("vmess"),
        "vless" => Some("vless"),
        "trojan" => Some("trojan"),
        "shadowsocks" => Some("shadowsocks"),
        "socks" => Some("socks"),
        "http" => Some("http"),
        _ => None,
    }
}

fn convert_inbound(
    path: &str,
    inbound: &Map<String, Value>,
    warnings: &mut Warnings,
) -> Option<Value> {
    let Some(kind) = inbound.get("type").and_then(Value::as_str) else {
        warnings.note(path, "missing type, inbound dropped");
        return None;
    };
    let Some(protocol) = inbound_protocol(kind) else {
        warnings.note(
            path,
            format!("type '{}' has no xray equivalent, inbound dropped", kind),
        );
        return None;
    };

    let mut out = Map::new();
    let mut settings = Map::new();
    let mut stream = Map::new();
    out.insert("protocol".to_string(), json!(protocol));

    for (key, value) in inbound {
        let field = join(path, key);
        match (kind, key.as_str()) {
            (_, "type") => {}
            (_, "tag") | (_, "listen") => {
                out.insert(key.clone(), value.clone());
            }
            (_, "listen_port") => match port_value(value) {
                Some(port) => {
                    out.insert("port".to_string(), json!(port));
                }
                None => warnings.note(&field, "expected a port, dropped"),
            },
            ("socks" | "http", "users") => {
                let accounts = objects(value, &field, warnings)
                    .into_iter()
                    .map(|(user_path, user)| {
                        rename_fields(&user_path, user, ACCOUNT_FIELDS, Direction::ToXray, warnings)
                    })
                    .collect();
                settings.insert("accounts".to_string(), Value::Array(accounts));
                if kind == "socks" {
                    settings.insert("auth".to_string(), json!("password"));
                }
            }
            (_, "users") => {
                let clients = objects(value, &field, warnings)
                    .into_iter()
                    .map(|(user_path, user)| {
                        rename_fields(&user_path, user, CLIENT_FIELDS, Direction::ToXray, warnings)
                    })
                    .collect();
                settings.insert("clients".to_string(), Value::Array(clients));
            }
            ("shadowsocks", "method") | ("shadowsocks", "password") => {
                settings.insert(key.clone(), value.clone());
            }
            ("shadowsocks" | "direct", "network") => {
                settings.insert("network".to_string(), value.clone());
            }
            ("direct", "override_address") => {
                settings.insert("address".to_string(), value.clone());
            }
            ("direct", "override_port") => {
                settings.insert("port".to_string(), value.clone());
            }
            (_, "tls") => convert_tls(&field, value, &mut stream, warnings),
            (_, "transport") => convert_transport(&field, value, &mut stream, warnings),
            (_, "sniff") => {
                out.insert("sniffing".to_string(), json!({ "enabled": value }));
            }
            _ => warnings.dropped(&field),
        }
    }

    if kind == "vless" {
        settings.insert("decryption".to_string(), json!("none"));
    }
    out.insert("settings".to_string(), Value::Object(settings));
    if !stream.is_empty() {
        out.insert("streamSettings".to_string(), Value::Object(stream));
    }
    Some(Value::Object(out))
}

fn convert_tls(path: &str, value: &Value, stream: &mut Map<String, Value>, warnings: &mut Warnings) {
    let Some(tls) = as_object(value, path, warnings) else {
        return;
    };
    if tls.get("enabled").and_then(Value::as_bool) != Some(true) {
        return;
    }

    let mut settings = Map::new();
    let mut certificate = Map::new();
    for (key, value) in tls {
        match key.as_str() {
            "enabled" => {}
            "server_name" => {
                settings.insert("serverName".to_string(), value.clone());
            }
            "alpn" => {
                settings.insert("alpn".to_string(), value.clone());
            }
            "certificate_path" => {
                certificate.insert("certificateFile".to_string(), value.clone());
            }
            "key_path" => {
                certificate.insert("keyFile".to_string(), value.clone());
            }
            other => warnings.dropped(&join(path, other)),
        }
    }
    if !certificate.is_empty() {
        settings.insert(
            "certificates".to_string(),
            Value::Array(vec![Value::Object(certificate)]),
        );
    }

    stream.insert("security".to_string(), json!("tls"));
    stream.insert("tlsSettings".to_string(), Value::Object(settings));
}

fn convert_transport(
    path: &str,
    value: &Value,
    stream: &mut Map<String, Value>,
    warnings: &mut Warnings,
) {
    let Some(transport) = as_object(value, path, warnings) else {
        return;
    };
    match transport.get("type").and_then(Value::as_str) {
        Some("ws") => {}
        other => {
            warnings.note(
                path,
                format!(
                    "transport '{}' has no xray equivalent, dropped",
                    other.unwrap_or("unknown")
                ),
            );
            return;
        }
    }

    let mut ws = Map::new();
    for (key, value) in transport {
        match key.as_str() {
            "type" => {}
            "path" => {
                ws.insert("path".to_string(), value.clone());
            }
            other => warnings.dropped(&join(path, other)),
        }
    }
    stream.insert("network".to_string(), json!("ws"));
    stream.insert("wsSettings".to_string(), Value::Object(ws));
}

fn convert_outbound(
    path: &str,
    outbound: &Map<String, Value>,
    warnings: &mut Warnings,
) -> Option<Value> {
    let protocol = match outbound.get("type").and_then(Value::as_str) {
        Some("direct") => "freedom",
        Some("block") => "blackhole",
        Some(other) => {
            warnings.note(
                path,
                format!("type '{}' has no xray equivalent, outbound dropped", other),
            );
            return None;
        }
        None => {
            warnings.note(path, "missing type, outbound dropped");
            return None;
        }
    };

    let mut out = Map::new();
    out.insert("protocol".to_string(), json!(protocol));
    for (key, value) in outbound {
        match key.as_str() {
            "type" => {}
            "tag" => {
                out.insert("tag".to_string(), value.clone());
            }
            other => warnings.dropped(&join(path, other)),
        }
    }
    Some(Value::Object(out))
}

fn convert_route(value: &Value, warnings: &mut Warnings) -> Option<Value> {
    let route = as_object(value, "route", warnings)?;
    let mut out = Map::new();
    for (key, value) in route {
        match key.as_str() {
            "rules" => {
                let rules = objects(value, "route.rules", warnings)
                    .into_iter()
                    .map(|(path, rule)| convert_rule(&path, rule, warnings))
                    .collect();
                out.insert("rules".to_string(), Value::Array(rules));
            }
            other => warnings.dropped(&join("route", other)),
        }
    }
    Some(Value::Object(out))
}

fn domain_prefix(key: &str) -> Option<&'static str> {
    match key {
        "domain" => Some("full:"),
        "domain_suffix" => Some("domain:"),
        "domain_keyword" => Some(""),
        "domain_regex" => Some("regexp:"),
        "geosite" => Some("geosite:"),
        _ => None,
    }
}

fn convert_rule(path: &str, rule: &Map<String, Value>, warnings: &mut Warnings) -> Value {
    let mut out = Map::new();
    let mut domains = Vec::new();
    let mut ips = Vec::new();
    let mut ports = Vec::new();
    out.insert("type".to_string(), json!("field"));

    for (key, value) in rule {
        let field = join(path, key);
        if let Some(prefix) = domain_prefix(key) {
            match string_items(value) {
                Some(entries) => {
                    domains.extend(entries.into_iter().map(|e| json!(format!("{}{}", prefix, e))))
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            }
            continue;
        }

        match key.as_str() {
            "geoip" | "ip_cidr" => match string_items(value) {
                Some(entries) => {
                    let prefix = if key == "geoip" { "geoip:" } else { "" };
                    ips.extend(entries.into_iter().map(|e| json!(format!("{}{}", prefix, e))));
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            },
            "port" => {
                let items: Vec<&Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                for item in items {
                    match port_value(item) {
                        Some(port) => ports.push(port.to_string()),
                        None => warnings.note(&field, format!("invalid port {}, dropped", item)),
                    }
                }
            }
            "port_range" => match string_items(value) {
                Some(ranges) => {
                    for range in ranges {
                        match range.split_once(':') {
                            Some((start, end)) if !start.is_empty() && !end.is_empty() => {
                                ports.push(format!("{}-{}", start, end))
                            }
                            _ => warnings.note(
                                &field,
                                format!("open port range '{}' has no xray equivalent, dropped", range),
                            ),
                        }
                    }
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            },
            "network" => match string_items(value) {
                Some(networks) => {
                    out.insert("network".to_string(), json!(networks.join(",")));
                }
                None => warnings.note(&field, "expected a string, dropped"),
            },
            "inbound" => match string_items(value) {
                Some(tags) => {
                    out.insert("inboundTag".to_string(), json!(tags));
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            },
            "outbound" => {
                out.insert("outboundTag".to_string(), value.clone());
            }
            _ => warnings.dropped(&field),
        }
    }

    if !domains.is_empty() {
        out.insert("domain".to_string(), Value::Array(domains));
    }
    if !ips.is_empty() {
        out.insert("ip".to_string(), Value::Array(ips));
    }
    if !ports.is_empty() {
        out.insert("port".to_string(), json!(ports.join(",")));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::XrayToSingBox;

    fn sample() -> Value {
        json!({
            "log": {"level": "warn", "timestamp": true},
            "inbounds": [
                {
                    "type": "vless",
                    "tag": "vless-in",
                    "listen": "::",
                    "listen_port": 443,
                    "users": [{"uuid": "5783a3e7-e373-51cd-8642-c83782b807c5", "flow": "xtls-rprx-vision", "name": "alice"}],
                    "tls": {
                        "enabled": true,
                        "server_name": "example.com",
                        "certificate_path": "/etc/ssl/cert.pem",
                        "key_path": "/etc/ssl/key.pem",
                        "reality": {"enabled": false}
                    }
                },
                {
                    "type": "socks",
                    "listen_port": 1080,
                    "users": [{"username": "bob", "password": "hunter2"}]
                },
                {"type": "tun", "tag": "tun-in"}
            ],
            "outbounds": [
                {"type": "direct", "tag": "direct"},
                {"type": "block", "tag": "block"},
                {"type": "dns", "tag": "dns-out"}
            ],
            "route": {
                "rules": [
                    {
                        "domain_suffix": ["example.org"],
                        "geoip": ["cn"],
                        "ip_cidr": ["192.168.0.0/16"],
                        "port": [53, 853],
                        "port_range": ["1000:2000", ":3000"],
                        "outbound": "direct"
                    }
                ],
                "final": "direct"
            },
            "experimental": {"cache_file": {"enabled": true}}
        })
    }

    #[test]
    fn test_converts_inbounds() {
        let doc = SingBoxToXray.convert(&sample()).unwrap().document;

        let vless = &doc["inbounds"][0];
        assert_eq!(vless["protocol"], "vless");
        assert_eq!(vless["port"], 443);
        assert_eq!(vless["settings"]["decryption"], "none");
        assert_eq!(vless["settings"]["clients"][0]["id"], "5783a3e7-e373-51cd-8642-c83782b807c5");
        assert_eq!(vless["settings"]["clients"][0]["email"], "alice");
        assert_eq!(vless["streamSettings"]["security"], "tls");
        assert_eq!(vless["streamSettings"]["tlsSettings"]["serverName"], "example.com");
        assert_eq!(
            vless["streamSettings"]["tlsSettings"]["certificates"][0]["keyFile"],
            "/etc/ssl/key.pem"
        );

        let socks = &doc["inbounds"][1];
        assert_eq!(socks["settings"]["accounts"][0], json!({"user": "bob", "pass": "hunter2"}));
        assert_eq!(socks["settings"]["auth"], "password");

        assert_eq!(doc["inbounds"].as_array().unwrap().len(), 2);
        assert_eq!(doc["log"], json!({"loglevel": "warning"}));
    }

    #[test]
    fn test_converts_routes() {
        let conversion = SingBoxToXray.convert(&sample()).unwrap();
        let rule = &conversion.document["routing"]["rules"][0];
        assert_eq!(rule["type"], "field");
        assert_eq!(rule["domain"], json!(["domain:example.org"]));
        assert_eq!(rule["ip"], json!(["geoip:cn", "192.168.0.0/16"]));
        assert_eq!(rule["port"], "53,853,1000-2000");
        assert_eq!(rule["outboundTag"], "direct");

        let warnings = conversion.warnings;
        let has = |needle: &str| warnings.iter().any(|w| w.contains(needle));
        assert!(has("':3000'"));
        assert!(has("route.final"));
        assert!(has("inbounds[0].tls.reality"));
        assert!(has("inbounds[2]: type 'tun'"));
        assert!(has("outbounds[2]: type 'dns'"));
        assert!(has("experimental: no xray equivalent"));
        assert!(has("log.timestamp"));
    }

    #[test]
    fn test_mapped_subset_survives_round_trip() {
        let xray = json!({
            "inbounds": [{
                "tag": "in",
                "port": 443,
                "protocol": "trojan",
                "settings": {"clients": [{"password": "p", "email": "e"}]},
                "streamSettings": {"network": "ws", "wsSettings": {"path": "/t"}}
            }],
            "outbounds": [{"protocol": "freedom", "tag": "direct"}]
        });
        let singbox = XrayToSingBox.convert(&xray).unwrap();
        assert!(singbox.warnings.is_empty());
        let back = SingBoxToXray.convert(&singbox.document).unwrap();
        assert!(back.warnings.is_empty());
        assert_eq!(back.document, xray);
    }

    #[test]
    fn test_disabled_log_wins_over_level() {
        let doc = SingBoxToXray
            .convert(&json!({"log": {"disabled": true, "level": "info"}}))
            .unwrap()
            .document;
        assert_eq!(doc["log"], json!({"loglevel": "none"}));
    }
}
