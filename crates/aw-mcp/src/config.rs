use std::collections::BTreeMap;

use aw_error::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{ServerConfig, ServerId, Transport};

/// Parses the MCP server configuration grammar out of the
/// opaque JSON string stored on `World.mcpConfig`. Accepts either `servers`
/// or `mcpServers` as the top-level key (synonyms); unknown fields on each
/// entry are ignored, but a structurally invalid entry rejects the whole
/// config with `ConfigParseError`.
pub fn parse_mcp_config(raw: &str) -> Result<Vec<ServerConfig>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::ConfigParseError(format!("invalid JSON: {e}")))?;

    let servers_obj = value
        .get("servers")
        .or_else(|| value.get("mcpServers"))
        .ok_or_else(|| {
            Error::ConfigParseError("missing 'servers' or 'mcpServers' key".to_string())
        })?
        .as_object()
        .ok_or_else(|| Error::ConfigParseError("'servers' must be an object".to_string()))?;

    let mut out = Vec::with_capacity(servers_obj.len());
    for (name, entry) in servers_obj {
        out.push(parse_server_entry(name, entry)?);
    }
    Ok(out)
}

fn parse_server_entry(name: &str, entry: &Value) -> Result<ServerConfig> {
    let obj = entry
        .as_object()
        .ok_or_else(|| Error::ConfigParseError(format!("server '{name}' must be an object")))?;

    // Legacy alias shape: { "type": "http"|"sse"|"streamable-http", "url": str, "headers"?: {} }
    if let Some(legacy_type) = obj.get("type").and_then(Value::as_str) {
        let url = obj
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::ConfigParseError(format!("server '{name}' legacy entry missing 'url'"))
            })?
            .to_string();
        let headers = parse_str_map(obj.get("headers"))?;
        let transport = match legacy_type {
            "sse" => Transport::Sse { url, headers },
            "streamable-http" | "http" => Transport::StreamableHttp { url, headers },
            other => {
                return Err(Error::ConfigParseError(format!(
                    "server '{name}' has unknown legacy type '{other}'"
                )));
            }
        };
        return Ok(ServerConfig {
            name: name.to_string(),
            transport,
        });
    }

    if let Some(command) = obj.get("command").and_then(Value::as_str) {
        let args = match obj.get("args") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::ConfigParseError(format!(
                            "server '{name}' has non-string entry in 'args'"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(Error::ConfigParseError(format!(
                    "server '{name}' 'args' must be an array"
                )));
            }
            None => Vec::new(),
        };
        let env = parse_str_map(obj.get("env"))?;
        return Ok(ServerConfig {
            name: name.to_string(),
            transport: Transport::Stdio {
                command: command.to_string(),
                args,
                env,
            },
        });
    }

    if let Some(url) = obj.get("url").and_then(Value::as_str) {
        let headers = parse_str_map(obj.get("headers"))?;
        let transport = match obj.get("transport").and_then(Value::as_str) {
            Some("sse") => Transport::Sse {
                url: url.to_string(),
                headers,
            },
            Some("streamable-http") | Some("http") | None => Transport::StreamableHttp {
                url: url.to_string(),
                headers,
            },
            Some("stdio") => {
                return Err(Error::ConfigParseError(format!(
                    "server '{name}' declares transport 'stdio' but supplies a 'url'"
                )));
            }
            Some(other) => {
                return Err(Error::ConfigParseError(format!(
                    "server '{name}' has unknown transport '{other}'"
                )));
            }
        };
        return Ok(ServerConfig {
            name: name.to_string(),
            transport,
        });
    }

    Err(Error::ConfigParseError(format!(
        "server '{name}' has neither 'command' nor 'url'"
    )))
}

fn parse_str_map(value: Option<&Value>) -> Result<BTreeMap<String, String>> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };
    let obj = value
        .as_object()
        .ok_or_else(|| Error::ConfigParseError("expected an object of string values".to_string()))?;
    obj.iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|s| (k.clone(), s.to_string()))
                .ok_or_else(|| Error::ConfigParseError(format!("value for '{k}' must be a string")))
        })
        .collect()
}

/// Computes the stable server identity: `SHA256` of a canonical
/// (key-sorted) rendering of the config, independent of the original JSON
/// field order.
pub fn server_id(config: &ServerConfig) -> ServerId {
    let canon = canonical_repr(config);
    let mut hasher = Sha256::new();
    hasher.update(canon.as_bytes());
    ServerId(format!("{:x}", hasher.finalize()))
}

fn canonical_repr(config: &ServerConfig) -> String {
    // BTreeMap gives deterministic key order regardless of insertion order,
    // independent of whatever `serde_json` feature flags happen to be on.
    let mut fields: BTreeMap<&'static str, String> = BTreeMap::new();
    fields.insert("name", config.name.clone());
    match &config.transport {
        Transport::Stdio { command, args, env } => {
            fields.insert("transport", "stdio".to_string());
            fields.insert("command", command.clone());
            fields.insert("args", args.join("\u{1}"));
            fields.insert("env", map_repr(env));
        }
        Transport::Sse { url, headers } => {
            fields.insert("transport", "sse".to_string());
            fields.insert("url", url.clone());
            fields.insert("headers", map_repr(headers));
        }
        Transport::StreamableHttp { url, headers } => {
            fields.insert("transport", "streamable-http".to_string());
            fields.insert("url", url.clone());
            fields.insert("headers", map_repr(headers));
        }
    }
    fields
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\u{0}")
}

fn map_repr(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}\u{2}{v}"))
        .collect::<Vec<_>>()
        .join("\u{1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_servers_and_mcp_servers_synonyms() {
        let a = parse_mcp_config(r#"{"servers":{"git":{"command":"git-mcp"}}}"#).unwrap();
        let b = parse_mcp_config(r#"{"mcpServers":{"git":{"command":"git-mcp"}}}"#).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn legacy_http_alias_normalizes_to_streamable_http() {
        let cfgs = parse_mcp_config(
            r#"{"servers":{"remote":{"type":"http","url":"https://example.com/mcp"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            cfgs[0].transport,
            Transport::StreamableHttp { .. }
        ));
    }

    #[test]
    fn invalid_entry_rejects_whole_config() {
        let err = parse_mcp_config(r#"{"servers":{"bad":{"nope":true}}}"#).unwrap_err();
        assert!(matches!(err, Error::ConfigParseError(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let cfgs = parse_mcp_config(
            r#"{"servers":{"git":{"command":"git-mcp","unused":42}}}"#,
        )
        .unwrap();
        assert_eq!(cfgs.len(), 1);
    }

    #[test]
    fn equal_normalized_configs_hash_equal() {
        let a = parse_mcp_config(r#"{"servers":{"git":{"command":"git-mcp","args":["x"]}}}"#)
            .unwrap();
        let b = parse_mcp_config(r#"{"servers":{"git":{"args":["x"],"command":"git-mcp"}}}"#)
            .unwrap();
        assert_eq!(server_id(&a[0]), server_id(&b[0]));
    }
}
