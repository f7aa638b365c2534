async fn fetch_account_with_retry(client: &WorklogClient) -> anyhow::Result<AccountInfo> {
    match client.get_account().await {
        Ok(account) => Ok(account),
        Err(err) if matches!(err.classification(), Some(ApiErrorClass::Auth)) => {
            Err(anyhow::Error::new(err).context("remote store rejected WORKLOG_TOKEN"))
        }
        Err(err) if err.is_retryable() => {
            let delay = err.retry_after_secs().unwrap_or(2);
            eprintln!("[worklogd] account fetch failed ({err}), retrying in {delay}s");
            tokio::time::sleep(Duration::from_secs(delay)).await;
            Ok(client.get_account().await?)
        }
        Err(err) => Err(err.into()),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_db_path(account: &str) -> anyhow::Result<PathBuf> {
    let mut path = dirs::data_dir().context("XDG data directory is unavailable")?;
    path.push("worklog");
    path.push("sync");
    path.push(format!("{}.db", sanitize_account(account)));
    Ok(path)
}

// Account ids come from the remote store; keep the filename tame anyway.
fn sanitize_account(account: &str) -> String {
    let cleaned: String = account
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        DEFAULT_ACCOUNT.to_string()
    } else {
        cleaned
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_u64_value(std::env::var(name).ok(), default)
}

fn parse_u64_value(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
