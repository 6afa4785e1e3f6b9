//! vdb-node: run one replica
//!
//! `vdb-node [CONFIG]` loads the TOML config (writing the default template
//! first if the file is missing), opens the node on its TCP endpoint and
//! runs until killed.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use vdb::vdb_engine::CONFIG_FILE_NAME;
use vdb::{NodeConfig, VectorNode};

fn build_cli() -> Command {
    Command::new("vdb-node")
        .about("Run one replica of a replicated vector index")
        .arg(
            Arg::new("config")
                .help("Path to the node config (default: vdb.toml)")
                .default_value(CONFIG_FILE_NAME),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .help("Override data_dir from the config"),
        )
        .arg(
            Arg::new("init")
                .long("init")
                .help("Write the default config if missing, then exit")
                .action(ArgAction::SetTrue),
        )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = build_cli().get_matches();
    let path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    if let Err(e) = NodeConfig::write_default_if_missing(&path) {
        eprintln!("{}", e);
        process::exit(1);
    }
    if matches.get_flag("init") {
        println!("config at {}", path.display());
        return;
    }

    let mut config = match NodeConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(dir);
    }

    let node = match VectorNode::open_tcp(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "failed to start node");
            process::exit(1);
        }
    };
    tracing::info!(node_id = node.node_id(), "node running");

    loop {
        thread::sleep(Duration::from_secs(60));
        let members = node.list_members();
        tracing::debug!(
            leader = ?node.leader_id(),
            members = members.len(),
            entries = node.engine().len(),
            "status"
        );
    }
}
