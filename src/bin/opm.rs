//! `opm`: the operator CLI (spec.md §6/§10) — proxy-list maintenance and
//! request-bundle decoding, kept separate from the HTTP service so an
//! operator never needs the server running to maintain the proxy pool.

use std::io::Read;

use clap::{Parser, Subcommand};

use openparcel::config::Config;
use openparcel::model::ProxyProtocol;
use openparcel::proxy::ProxyManager;
use openparcel::proxy::providers::{self, ALL_PROVIDER_NAMES};
use openparcel::reqbundle;
use openparcel::store::ParcelStore;

#[derive(Parser)]
#[command(name = "opm", about = "OpenParcel operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Proxy-list maintenance (C4).
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Request-bundle codec (§18).
    Reqbundle {
        #[command(subcommand)]
        action: ReqbundleAction,
    },
}

#[derive(Subcommand)]
enum ProxyAction {
    /// Fetches from one or more providers (default: all), importing and
    /// testing every newly-discovered proxy.
    Fetch {
        /// Provider names (pubproxy, proxifly, openproxyspace,
        /// proxyscrapefree, webshare). Defaults to every provider.
        providers: Vec<String>,
    },
    /// Re-tests every currently active proxy, demoting the ones that no
    /// longer reach any carrier.
    Refresh,
    /// Imports a single proxy address directly, bypassing providers.
    Import {
        /// http, socks4 or socks5.
        protocol: String,
        /// `addr:port`, one per line.
        file: String,
    },
}

#[derive(Subcommand)]
enum ReqbundleAction {
    /// Decrypts a request bundle using the configured
    /// `request_bundle_key`. Reads from the argument, or stdin if omitted.
    Decode { ciphertext: Option<String> },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "opm=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("opm: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Proxy { action } => run_proxy(action).await,
        Command::Reqbundle { action } => run_reqbundle(action),
    }
}

async fn run_proxy(action: ProxyAction) -> anyhow::Result<()> {
    let config = Config::load_default()?;
    let store = ParcelStore::connect(&config.db_path).await?;
    let manager = ProxyManager::new(store);

    match action {
        ProxyAction::Fetch { providers: names } => {
            let names: Vec<String> = if names.is_empty() {
                ALL_PROVIDER_NAMES.iter().map(|s| s.to_string()).collect()
            } else {
                names
            };
            for name in &names {
                let Some(provider) = providers::by_name(name) else {
                    anyhow::bail!("unknown proxy provider: {name}");
                };
                let api_key = config.proxy_api_keys.get(provider.name()).map(String::as_str);
                let active = provider.run(&manager, api_key).await?;
                println!("{}: {active} active proxies", provider.name());
            }
            Ok(())
        }
        ProxyAction::Refresh => {
            manager.refresh_all().await?;
            let active = manager.list_active().await?.len();
            println!("refreshed proxy list: {active} active proxies");
            Ok(())
        }
        ProxyAction::Import { protocol, file } => {
            let protocol: ProxyProtocol = protocol
                .parse()
                .map_err(|()| anyhow::anyhow!("unrecognized protocol: {protocol}"))?;
            let contents = std::fs::read_to_string(&file)?;
            let mut imported = 0;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((addr, port)) = line.rsplit_once(':') else {
                    eprintln!("skipping malformed line: {line}");
                    continue;
                };
                let port: u16 = port.parse()?;
                manager.import(addr, port, protocol).await?;
                imported += 1;
            }
            println!("imported {imported} proxies from {file}");
            Ok(())
        }
    }
}

fn run_reqbundle(action: ReqbundleAction) -> anyhow::Result<()> {
    let ReqbundleAction::Decode { ciphertext } = action;
    let config = Config::load_default()?;
    let bundle = match ciphertext {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let plaintext = reqbundle::decrypt(&config.request_bundle_key, &bundle)?;
    println!("{plaintext}");
    Ok(())
}
