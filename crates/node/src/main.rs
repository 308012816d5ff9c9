use std::path::PathBuf;
use std::sync::Arc;

use emberd_consensus::constants::DEFAULT_MAX_BLOCK_DATA_BYTES;
use emberd_node::node::{Node, NodeSettings};
use emberd_node::shell;
use serde::Deserialize;

const DEFAULT_PORT: u16 = 3001;
const LISTEN_ADDRESS_ENV: &str = "BLOCKCHAIN_SERVER_LISTEN_ADDRESS";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(rename = "maxDataBytes")]
    max_data_bytes: Option<usize>,
    #[serde(rename = "listenAddress")]
    listen_address: Option<String>,
}

#[derive(Clone, Debug)]
struct Config {
    port: u16,
    conf_path: Option<PathBuf>,
    peers: Vec<String>,
    no_shell: bool,
}

fn usage() -> String {
    [
        "usage: emberd [options]",
        "  --port <port>       listen port (default 3001)",
        "  --conf <path>       JSON configuration file",
        "  --peer <host:port>  connect at startup (repeatable)",
        "  --no-shell          run without the interactive shell",
    ]
    .join("\n")
}

fn parse_args() -> Result<Config, String> {
    let mut port = DEFAULT_PORT;
    let mut conf_path: Option<PathBuf> = None;
    let mut peers: Vec<String> = Vec::new();
    let mut no_shell = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --port\n{}", usage()))?;
                port = value
                    .parse()
                    .map_err(|_| format!("invalid port '{value}'\n{}", usage()))?;
            }
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--peer" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --peer\n{}", usage()))?;
                peers.push(value);
            }
            "--no-shell" => {
                no_shell = true;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }
    Ok(Config {
        port,
        conf_path,
        peers,
        no_shell,
    })
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile, String> {
    let bytes = std::fs::read(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| format!("invalid configuration {}: {err}", path.display()))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = parse_args()?;
    let file = match &config.conf_path {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    // the environment wins over the configuration file
    let listen_address = std::env::var(LISTEN_ADDRESS_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .or(file.listen_address);

    let node = Node::start(NodeSettings {
        port: config.port,
        listen_address,
        max_data_bytes: file.max_data_bytes.unwrap_or(DEFAULT_MAX_BLOCK_DATA_BYTES),
        initial_peers: config.peers,
    })
    .await?;

    if config.no_shell {
        tokio::signal::ctrl_c()
            .await
            .map_err(|err| err.to_string())?;
    } else {
        shell::run(Arc::clone(&node)).await?;
    }
    node.shutdown();
    Ok(())
}
