use crate::client::{ClientTimings, PrizrakClient};
use crate::config::Config;
use crate::control::{ClientIdentity, ControlClient};
use crate::model::{DeviceCommand, DeviceId};
use crate::passport::PassportClient;
use crate::security::{Vault, ENCRYPTED_AT_REST};
use crate::server::BroadcastSink;
use crate::transport::SocketEndpoint;
use anyhow::{anyhow, bail, Context};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

const PASSWORD_ENV: &str = "PRIZRAK_PASSWORD";

pub async fn run() -> anyhow::Result<()> {
    let command = std::env::args().nth(1);

    // Must work before a valid config exists.
    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load().context("failed to load config")?;

    match command.as_deref() {
        Some("vault-set") => handle_vault_set(&config),
        Some("vault-get") => handle_vault_get(&config),
        Some("vault-list") => handle_vault_list(&config),
        Some("vault-remove") => handle_vault_remove(&config),
        Some("command") => handle_command(&config).await,
        Some(other) if !other.starts_with('-') => bail!("unknown command: {other}"),
        _ => run_service(&config).await,
    }
}

async fn run_service(config: &Config) -> anyhow::Result<()> {
    let updates = BroadcastSink::new();
    let password = load_password(config)?;
    let client = Arc::new(build_client(config, password, Arc::new(updates.clone()))?);
    client.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = if config.server.enabled {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
        let token = config
            .server
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| {
                let token = generate_token(32);
                tracing::info!(%token, "generated local api token");
                token
            });
        let client = client.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = crate::server::start(addr, token, client, updates, shutdown_rx).await {
                tracing::error!(error = %err, "local api stopped");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown: ctrl-c");

    let _ = shutdown_tx.send(true);
    client.stop().await;
    if let Some(task) = server_task {
        let _ = task.await;
    }
    Ok(())
}

async fn handle_command(config: &Config) -> anyhow::Result<()> {
    let mut args = std::env::args().skip(2);
    let usage = "usage: command <device_id> <command>";
    let device_id: DeviceId = args
        .next()
        .ok_or_else(|| anyhow!("missing device_id ({usage})"))?
        .parse()
        .context("device_id must be an integer")?;
    let command: DeviceCommand = args
        .next()
        .ok_or_else(|| anyhow!("missing command ({usage})"))?
        .parse()?;

    let password = load_password(config)?;
    let client = build_client(config, password, Arc::new(|_: &crate::model::DeviceUpdate| {}))?;
    client.start();

    let timings = client.timings().clone();
    let outcome = if client.wait_until_ready(timings.ready_timeout).await {
        client
            .send_command(device_id, command, timings.command_timeout)
            .await
            .map_err(anyhow::Error::from)
    } else {
        Err(anyhow!(
            "device list not received within {}s",
            timings.ready_timeout.as_secs()
        ))
    };
    client.stop().await;

    let result = outcome.with_context(|| format!("{command} for device {device_id} failed"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "device_id": device_id,
            "command": command,
            "result": result,
        }))?
    );
    Ok(())
}

fn build_client(
    config: &Config,
    password: String,
    sink: Arc<dyn crate::dispatch::DeviceStateSink>,
) -> anyhow::Result<PrizrakClient> {
    let timings = ClientTimings::from(&config.client);

    let passport = PassportClient::builder(
        config.service.base_url.as_str(),
        config.account.login.as_str(),
        password,
    )
    .language_code(config.account.language_code.as_str())
    .timeout(timings.http_timeout)
    .build()?;

    let identity = ClientIdentity {
        app_name: config.service.app_name.clone(),
        app_version: config.service.app_version.clone(),
        app_host: String::new(),
        lang: config.service.lang.clone(),
    };
    let control = ControlClient::builder(config.service.base_url.as_str(), identity)
        .timeout(timings.http_timeout)
        .delete_timeout(timings.delete_timeout)
        .build()?;

    let endpoint = SocketEndpoint {
        ws_url: config.service.ws_url.clone(),
        origin: config.service.origin.clone(),
    };

    Ok(PrizrakClient::new(passport, control, endpoint, timings, sink))
}

fn load_password(config: &Config) -> anyhow::Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    let vault = Vault::open(config.vault.path.as_deref())?;
    let password = vault.retrieve(&config.account.password_key).with_context(|| {
        format!(
            "no password: set {PASSWORD_ENV} or run `vault-set {} <password>`",
            config.account.password_key
        )
    })?;
    Ok(password.trim().to_string())
}

fn handle_vault_set(config: &Config) -> anyhow::Result<()> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or_else(|| anyhow!("missing key"))?;
    let value = args.next().ok_or_else(|| anyhow!("missing value"))?;

    let mut vault = Vault::open(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {} in {}", key, vault.path().display());
    if !ENCRYPTED_AT_REST {
        println!("Note: values are base64-encoded, not encrypted; the file is readable by its owner only.");
    }
    Ok(())
}

fn handle_vault_remove(config: &Config) -> anyhow::Result<()> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or_else(|| anyhow!("missing key"))?;

    let mut vault = Vault::open(config.vault.path.as_deref())?;
    if vault.remove(&key)? {
        println!("Removed vault key: {}", key);
    } else {
        println!("No vault key named {}", key);
    }
    Ok(())
}

fn handle_vault_get(config: &Config) -> anyhow::Result<()> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or_else(|| anyhow!("missing key"))?;

    let vault = Vault::open(config.vault.path.as_deref())?;
    let value = vault.retrieve(&key)?;

    println!("{}", value);
    Ok(())
}

fn handle_vault_list(config: &Config) -> anyhow::Result<()> {
    let vault = Vault::open(config.vault.path.as_deref())?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

fn handle_config_init() -> anyhow::Result<()> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
