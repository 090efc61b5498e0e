fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_targets_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ftpsync")
        .join("targets.json")
}

fn default_stats_db() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ftpsync")
        .join("stats.sqlite")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .map(|value| parse_u64_or(&value, default))
        .unwrap_or(default)
}

/// Zero is a valid setting; only unparsable input falls back.
fn parse_u64_or(value: &str, default: u64) -> u64 {
    value.trim().parse().unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A missing targets file means no targets rather than an error.
async fn load_targets(path: &Path) -> anyhow::Result<Vec<TargetConfig>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "targets file not found");
            return Ok(Vec::new());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read targets file {path:?}"));
        }
    };
    let home = dirs::home_dir();
    parse_targets(&raw, home.as_deref())
        .with_context(|| format!("failed to parse targets file {path:?}"))
}

fn parse_targets(raw: &str, home: Option<&Path>) -> anyhow::Result<Vec<TargetConfig>> {
    let file: TargetsFile = serde_json::from_str(raw)?;
    let mut targets = file.targets;
    if let Some(home) = home {
        for target in &mut targets {
            if let Some(value) = target.local_root.to_str() {
                target.local_root = expand_with_home(value, home);
            }
        }
    }
    Ok(targets)
}
