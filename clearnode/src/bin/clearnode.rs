use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use clap::Parser;
use clearnode::{
    broker::Broker, cfg::Config, db::Db, notify::Notifier, rpc, settlement::LocalSettlement,
    sync::Synchronizer, time::unix_secs,
};
use custody::{CustodyConfig, adjudicator::Consensus, chain::LocalChain, crypto::SecretKey};
use parking_lot::Mutex;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(value_parser = SecretKey::from_hex)]
    secret_key: SecretKey,
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Set a panic hook that records the panic as a `tracing` event at the `ERROR` verbosity level.
    std::panic::set_hook(Box::new(|panic| {
        let message = match panic.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        match (panic.location(), backtrace) {
            (None, None) => {
                error!(thread_name, message);
            }
            (None, Some(backtrace)) => {
                error!(thread_name, message, %backtrace);
            }
            (Some(location), None) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                );
            }
            (Some(location), Some(backtrace)) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                    %backtrace,
                );
            }
        }
    }));

    let mut merged_config = toml::Table::new();
    for config_file in args.config_file {
        let config = fs::read_to_string(&config_file)?;
        let config: toml::Table = toml::from_str(&config)?;
        for key in config.keys() {
            if merged_config.contains_key(key) {
                return Err(anyhow!(
                    "configuration conflict: {config_file:?} contained a key {key:?} that was already included in an earlier file"
                ));
            }
        }
        merged_config.extend(config);
    }

    let config: Config = serde::Deserialize::deserialize(merged_config)?;
    if config.assets.is_empty() {
        warn!("no assets configured, every channel will be ignored");
    }
    let config = Arc::new(config);

    let db = Arc::new(Db::new(config.database_path.as_ref())?);

    // The settlement layer runs in process. Its clock starts now and only moves as blocks are mined.
    let mut chain = LocalChain::new(
        CustodyConfig {
            chain_id: config.chain.chain_id,
            address: config.chain.custody_address,
            min_challenge_period: config.chain.challenge_period,
            eip712: config.chain.eip712,
        },
        unix_secs(),
    );
    chain
        .custody_mut()
        .register_adjudicator(config.chain.adjudicator_address, Arc::new(Consensus));
    let settlement = Arc::new(LocalSettlement::new(
        Arc::new(Mutex::new(chain)),
        args.secret_key.address(),
    ));

    let notifier = Notifier::new(1024);
    let synchronizer = Synchronizer::new(
        db.clone(),
        settlement,
        config.clone(),
        args.secret_key.clone(),
        notifier.clone(),
    );
    let broker = Arc::new(Broker::new(db, config.clone(), args.secret_key, notifier));
    info!(broker = %broker.key().address(), chain_id = config.chain.chain_id, "starting clearnode");

    tokio::select! {
        () = synchronizer.run() => Ok(()),
        result = rpc::server::serve(broker, config.listen_address) => result,
        result = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(result?)
        }
    }
}
