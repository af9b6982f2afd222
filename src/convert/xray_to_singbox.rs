use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::{
    as_object, join, objects, port_value, rename_fields, string_items, ConfigConverter,
    Conversion, Direction, Warnings, ACCOUNT_FIELDS, CLIENT_FIELDS,
};
use crate::error::{Error, Result};
use crate::types::CoreType;

pub struct XrayToSingBox;

impl ConfigConverter for XrayToSingBox {
    fn source(&self) -> CoreType {
        CoreType::Xray
    }

    fn target(&self) -> CoreType {
        CoreType::SingBox
    }

    fn convert(&self, document: &Value) -> Result<Conversion> {
        let root = document
            .as_object()
            .ok_or_else(|| Error::invalid_input("xray config must be a JSON object"))?;

        let mut warnings = Warnings::new(CoreType::SingBox);
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
                "routing" => {
                    if let Some(route) = convert_routing(value, &mut warnings) {
                        out.insert("route".to_string(), route);
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
    let mut out = Map::new();
    for (key, value) in log {
        match (key.as_str(), value.as_str()) {
            ("loglevel", Some("none")) => {
                out.insert("disabled".to_string(), Value::Bool(true));
            }
            ("loglevel", Some(level)) => {
                let level = if level == "warning" { "warn" } else { level };
                out.insert("level".to_string(), json!(level));
            }
            ("loglevel", None) => warnings.note("log.loglevel", "expected a string, dropped"),
            (other, _) => warnings.dropped(&join("log", other)),
        }
    }
    Some(Value::Object(out))
}

fn inbound_type(protocol: &str) -> Option<&'static str> {
    match protocol {
        "dokodemo-door" => Some("direct"),
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
    let Some(protocol) = inbound.get("protocol").and_then(Value::as_str) else {
        warnings.note(path, "missing protocol, inbound dropped");
        return None;
    };
    let Some(kind) = inbound_type(protocol) else {
        warnings.note(
            path,
            format!("protocol '{}' has no sing-box equivalent, inbound dropped", protocol),
        );
        return None;
    };

    let mut out = Map::new();
    out.insert("type".to_string(), json!(kind));

    for (key, value) in inbound {
        let field = join(path, key);
        match key.as_str() {
            "protocol" => {}
            "tag" | "listen" => {
                out.insert(key.clone(), value.clone());
            }
            "port" => match port_value(value) {
                Some(port) => {
                    out.insert("listen_port".to_string(), json!(port));
                }
                None => warnings.note(&field, "only single numeric ports are supported, dropped"),
            },
            "settings" => convert_settings(protocol, &field, value, &mut out, warnings),
            "streamSettings" => convert_stream(&field, value, &mut out, warnings),
            "sniffing" => convert_sniffing(&field, value, &mut out, warnings),
            _ => warnings.dropped(&field),
        }
    }
    Some(Value::Object(out))
}

fn convert_settings(
    protocol: &str,
    path: &str,
    value: &Value,
    out: &mut Map<String, Value>,
    warnings: &mut Warnings,
) {
    let Some(settings) = as_object(value, path, warnings) else {
        return;
    };

    for (key, value) in settings {
        let field = join(path, key);
        match (protocol, key.as_str()) {
            (_, "clients") => {
                let users = objects(value, &field, warnings)
                    .into_iter()
                    .map(|(client_path, client)| {
                        rename_fields(&client_path, client, CLIENT_FIELDS, Direction::ToSingBox, warnings)
                    })
                    .collect();
                out.insert("users".to_string(), Value::Array(users));
            }
            ("socks" | "http", "accounts") => {
                let users = objects(value, &field, warnings)
                    .into_iter()
                    .map(|(account_path, account)| {
                        rename_fields(
                            &account_path,
                            account,
                            ACCOUNT_FIELDS,
                            Direction::ToSingBox,
                            warnings,
                        )
                    })
                    .collect();
                out.insert("users".to_string(), Value::Array(users));
            }
            ("vless", "decryption") => {
                if value.as_str() != Some("none") {
                    warnings.note(&field, format!("decryption {} is not supported, dropped", value));
                }
            }
            // sing-box asks for a password exactly when users are listed
            ("socks", "auth") => {
                let has_accounts = settings
                    .get("accounts")
                    .and_then(Value::as_array)
                    .is_some_and(|accounts| !accounts.is_empty());
                let implied = if has_accounts { "password" } else { "noauth" };
                if value.as_str() != Some(implied) {
                    warnings.note(
                        &field,
                        format!("auth {} does not match the configured accounts, dropped", value),
                    );
                }
            }
            ("shadowsocks", "method") | ("shadowsocks", "password") => {
                out.insert(key.clone(), value.clone());
            }
            ("shadowsocks" | "dokodemo-door", "network") => match value.as_str() {
                Some("tcp") | Some("udp") => {
                    out.insert("network".to_string(), value.clone());
                }
                Some("tcp,udp") | Some("udp,tcp") => {}
                _ => warnings.note(&field, format!("unsupported network {}, dropped", value)),
            },
            ("dokodemo-door", "address") => {
                out.insert("override_address".to_string(), value.clone());
            }
            ("dokodemo-door", "port") => match port_value(value) {
                Some(port) => {
                    out.insert("override_port".to_string(), json!(port));
                }
                None => warnings.note(&field, "expected a port, dropped"),
            },
            _ => warnings.dropped(&field),
        }
    }
}

fn convert_stream(
    path: &str,
    value: &Value,
    out: &mut Map<String, Value>,
    warnings: &mut Warnings,
) {
    let Some(stream) = as_object(value, path, warnings) else {
        return;
    };
    let network = stream
        .get("network")
        .and_then(Value::as_str)
        .unwrap_or("tcp");
    let security = stream
        .get("security")
        .and_then(Value::as_str)
        .unwrap_or("none");

    let mut transport: Option<Map<String, Value>> = None;
    let mut tls: Option<Map<String, Value>> = None;

    for (key, value) in stream {
        let field = join(path, key);
        match key.as_str() {
            "network" => match network {
                "tcp" | "raw" => {}
                "ws" => {
                    transport
                        .get_or_insert_with(Map::new)
                        .insert("type".to_string(), json!("ws"));
                }
                other => warnings.note(
                    &field,
                    format!("transport '{}' has no sing-box equivalent, dropped", other),
                ),
            },
            "wsSettings" if network == "ws" => {
                let Some(ws) = as_object(value, &field, warnings) else {
                    continue;
                };
                let transport = transport.get_or_insert_with(Map::new);
                for (ws_key, ws_value) in ws {
                    match ws_key.as_str() {
                        "path" => {
                            transport.insert("path".to_string(), ws_value.clone());
                        }
                        other => warnings.dropped(&join(&field, other)),
                    }
                }
            }
            "security" => match security {
                "none" => {}
                "tls" => {
                    tls.get_or_insert_with(Map::new)
                        .insert("enabled".to_string(), Value::Bool(true));
                }
                other => warnings.note(
                    &field,
                    format!("security '{}' has no sing-box equivalent, dropped", other),
                ),
            },
            "tlsSettings" if security == "tls" => {
                convert_tls(&field, value, tls.get_or_insert_with(Map::new), warnings)
            }
            _ => warnings.dropped(&field),
        }
    }

    if let Some(transport) = transport {
        out.insert("transport".to_string(), Value::Object(transport));
    }
    if let Some(tls) = tls {
        out.insert("tls".to_string(), Value::Object(tls));
    }
}

fn convert_tls(path: &str, value: &Value, tls: &mut Map<String, Value>, warnings: &mut Warnings) {
    let Some(settings) = as_object(value, path, warnings) else {
        return;
    };
    for (key, value) in settings {
        let field = join(path, key);
        match key.as_str() {
            "serverName" => {
                tls.insert("server_name".to_string(), value.clone());
            }
            "alpn" => {
                tls.insert("alpn".to_string(), value.clone());
            }
            "certificates" => {
                let certificates = objects(value, &field, warnings);
                if certificates.len() > 1 {
                    warnings.note(&field, "only the first certificate is carried over");
                }
                if let Some((cert_path, certificate)) = certificates.into_iter().next() {
                    for (cert_key, cert_value) in certificate {
                        match cert_key.as_str() {
                            "certificateFile" => {
                                tls.insert("certificate_path".to_string(), cert_value.clone());
                            }
                            "keyFile" => {
                                tls.insert("key_path".to_string(), cert_value.clone());
                            }
                            other => warnings.dropped(&join(&cert_path, other)),
                        }
                    }
                }
            }
            _ => warnings.dropped(&field),
        }
    }
}

fn convert_sniffing(
    path: &str,
    value: &Value,
    out: &mut Map<String, Value>,
    warnings: &mut Warnings,
) {
    let Some(sniffing) = as_object(value, path, warnings) else {
        return;
    };
    for (key, value) in sniffing {
        match key.as_str() {
            "enabled" => {
                out.insert("sniff".to_string(), value.clone());
            }
            other => warnings.dropped(&join(path, other)),
        }
    }
}

fn convert_outbound(
    path: &str,
    outbound: &Map<String, Value>,
    warnings: &mut Warnings,
) -> Option<Value> {
    let kind = match outbound.get("protocol").and_then(Value::as_str) {
        Some("freedom") => "direct",
        Some("blackhole") => "block",
        Some(other) => {
            warnings.note(
                path,
                format!("protocol '{}' has no sing-box equivalent, outbound dropped", other),
            );
            return None;
        }
        None => {
            warnings.note(path, "missing protocol, outbound dropped");
            return None;
        }
    };

    let mut out = Map::new();
    out.insert("type".to_string(), json!(kind));
    for (key, value) in outbound {
        match key.as_str() {
            "protocol" => {}
            "tag" => {
                out.insert("tag".to_string(), value.clone());
            }
            "settings" if value.as_object().map_or(true, Map::is_empty) => {}
            other => warnings.dropped(&join(path, other)),
        }
    }
    Some(Value::Object(out))
}

fn convert_routing(value: &Value, warnings: &mut Warnings) -> Option<Value> {
    let routing = as_object(value, "routing", warnings)?;
    let mut out = Map::new();
    for (key, value) in routing {
        match key.as_str() {
            "rules" => {
                let rules = objects(value, "routing.rules", warnings)
                    .into_iter()
                    .map(|(path, rule)| convert_rule(&path, rule, warnings))
                    .collect();
                out.insert("rules".to_string(), Value::Array(rules));
            }
            other => warnings.dropped(&join("routing", other)),
        }
    }
    Some(Value::Object(out))
}

fn domain_bucket(entry: &str) -> Option<(&'static str, &str)> {
    const PREFIXES: [(&str, &str); 5] = [
        ("full:", "domain"),
        ("domain:", "domain_suffix"),
        ("geosite:", "geosite"),
        ("regexp:", "domain_regex"),
        ("keyword:", "domain_keyword"),
    ];
    for (prefix, bucket) in PREFIXES {
        if let Some(rest) = entry.strip_prefix(prefix) {
            return Some((bucket, rest));
        }
    }
    if entry.contains(':') {
        // ext: and other file-based matchers
        return None;
    }
    // A bare xray domain is a substring match
    Some(("domain_keyword", entry))
}

fn convert_rule(path: &str, rule: &Map<String, Value>, warnings: &mut Warnings) -> Value {
    let mut lists: BTreeMap<&'static str, Vec<Value>> = BTreeMap::new();
    let mut out = Map::new();

    for (key, value) in rule {
        let field = join(path, key);
        match key.as_str() {
            "type" => {
                if value.as_str() != Some("field") {
                    warnings.note(&field, format!("rule type {} treated as field", value));
                }
            }
            "domain" | "domains" => match string_items(value) {
                Some(entries) => {
                    for entry in entries {
                        match domain_bucket(entry) {
                            Some((bucket, domain)) => {
                                lists.entry(bucket).or_default().push(json!(domain))
                            }
                            None => warnings.note(
                                &field,
                                format!("matcher '{}' has no sing-box equivalent, dropped", entry),
                            ),
                        }
                    }
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            },
            "ip" => match string_items(value) {
                Some(entries) => {
                    for entry in entries {
                        match entry.strip_prefix("geoip:") {
                            Some(code) => lists.entry("geoip").or_default().push(json!(code)),
                            None => lists.entry("ip_cidr").or_default().push(json!(entry)),
                        }
                    }
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            },
            "port" => split_ports(&field, value, &mut lists, warnings),
            "network" => match value.as_str() {
                Some("tcp") | Some("udp") => {
                    out.insert("network".to_string(), value.clone());
                }
                Some("tcp,udp") | Some("udp,tcp") => {}
                _ => warnings.note(&field, format!("unsupported network {}, dropped", value)),
            },
            "inboundTag" => match string_items(value) {
                Some(tags) => {
                    out.insert("inbound".to_string(), json!(tags));
                }
                None => warnings.note(&field, "expected a list of strings, dropped"),
            },
            "outboundTag" => {
                out.insert("outbound".to_string(), value.clone());
            }
            _ => warnings.dropped(&field),
        }
    }

    for (bucket, values) in lists {
        out.insert(bucket.to_string(), Value::Array(values));
    }
    Value::Object(out)
}

/// xray ports are `53`, `"53,443"` or `"1000-2000"` lists.
fn split_ports(
    path: &str,
    value: &Value,
    lists: &mut BTreeMap<&'static str, Vec<Value>>,
    warnings: &mut Warnings,
) {
    let spec = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => {
            warnings.note(path, "expected a port list, dropped");
            return;
        }
    };

    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => match (start.trim().parse::<u16>(), end.trim().parse::<u16>()) {
                (Ok(start), Ok(end)) if start <= end => lists
                    .entry("port_range")
                    .or_default()
                    .push(json!(format!("{}:{}", start, end))),
                _ => warnings.note(path, format!("invalid port range '{}', dropped", part)),
            },
            None => match part.parse::<u16>() {
                Ok(port) => lists.entry("port").or_default().push(json!(port)),
                Err(_) => warnings.note(path, format!("invalid port '{}', dropped", part)),
            },
        }
    }
}
