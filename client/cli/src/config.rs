use serde::Deserialize;
use std::{env, path::PathBuf};

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server_url: Option<String>,
}

#[derive(Debug)]
pub struct CliConfig {
    pub server_url: String,
}

fn resolve_config_path() -> PathBuf {
    if let Ok(path) = env::var("PROMPTFLOW_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config.toml")
}

/// Config file first, then `PROMPTFLOW_URL` on top.
pub fn load_config() -> Result<CliConfig, String> {
    let path = resolve_config_path();
    let file_config = if path.exists() {
        let content =
            std::fs::read_to_string(&path).map_err(|err| format!("read config: {err}"))?;
        parse_file_config(&content)?
    } else {
        FileConfig::default()
    };
    Ok(merge(file_config, env::var("PROMPTFLOW_URL").ok()))
}

fn parse_file_config(content: &str) -> Result<FileConfig, String> {
    toml::from_str::<FileConfig>(content).map_err(|err| format!("parse config: {err}"))
}

fn merge(file_config: FileConfig, env_url: Option<String>) -> CliConfig {
    let server_url = env_url
        .filter(|value| !value.trim().is_empty())
        .or(file_config.server_url)
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    CliConfig {
        server_url: server_url.trim_end_matches('/').to_string(),
    }
}
