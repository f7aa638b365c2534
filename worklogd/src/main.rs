use worklogd::daemon::{DaemonConfig, DaemonRuntime};
use worklogd::sync::engine::MAX_ATTEMPTS;
use worklogd::sync::store::QueueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Status => {
            let config = DaemonConfig::from_env()?;
            let store = QueueStore::open(&config.db_path).await?;
            let counts = store.status_counts(MAX_ATTEMPTS).await?;
            let (last_sync_at, last_error) = store.get_last_sync().await?;
            println!("queued:          {}", counts.pending);
            println!("needs attention: {}", counts.exhausted);
            println!("rejected:        {}", counts.rejected);
            match last_sync_at {
                Some(at) => println!("last clean sync: {at}"),
                None => println!("last clean sync: never"),
            }
            if let Some(error) = last_error {
                println!("last error:      {error}");
            }
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: worklogd [--status]");
            println!("  --status   Print queue counts and last sync, then exit");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
