use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::ConfigAction;
use crate::config::AppConfig;

pub fn run(action: &ConfigAction, config_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => cmd_show(config_path),
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

/// Prints the effective settings (file + environment) with secrets masked.
fn cmd_show(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        eprintln!("No config at {}, showing defaults", config_path.display());
    }
    let config = AppConfig::resolve(config_path)?;
    let json = serde_json::to_value(&config)?;
    println!("{}", serde_json::to_string_pretty(&mask_secrets(&json))?);
    Ok(())
}

fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut m = serde_json::Map::new();
            for (k, v) in map {
                if is_secret_key(k) {
                    if let Value::String(s) = v {
                        m.insert(k.clone(), Value::String(mask_str(s)));
                    } else {
                        m.insert(k.clone(), v.clone());
                    }
                } else {
                    m.insert(k.clone(), mask_secrets(v));
                }
            }
            Value::Object(m)
        }
        Value::Array(a) => Value::Array(a.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

fn is_secret_key(key: &str) -> bool {
    let u = key.to_uppercase();
    u.contains("KEY") || u.contains("SECRET") || u.contains("TOKEN")
}

fn mask_str(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        String::new()
    } else if chars.len() <= 8 {
        "***".to_string()
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}
