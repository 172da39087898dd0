//! Moorage - CNI IPAM plugin
//!
//! Leases IPv4 addresses to containers from a subnet range, keeping the
//! lease table in a replicated key-value store shared by every host.

mod cli;
mod cni;
mod error;
mod helm;
mod manifest;
mod network;
mod store;

use cli::{Cli, Commands};
use cni::{AddResult, ErrorReply, IpamConfig, Verb, VersionReply};
use error::{Error, Result};
use helm::{Helm, Role};
use manifest::Settings;
use network::IpAllocator;
use store::{Dialer, LeaseStore, RedisDialer};

use serde::Serialize;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let mut cli = Cli::parse_args();
    init_logging(cli.verbose);

    let Some(command) = cli.command.take() else {
        // Replaced by the request's version once stdin is decoded
        let mut cni_version = cni::DEFAULT_VERSION.to_string();
        if let Err(e) = run_plugin(&cli, io::stdin().lock(), &mut cni_version) {
            // The runtime reads failures from stdout
            let reply = ErrorReply::new(&e, &cni_version);
            if let Ok(text) = serde_json::to_string(&reply) {
                println!("{}", text);
            }
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        return;
    };

    if let Err(e) = run(&cli, command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Log to stderr; stdout is reserved for plugin results
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("MOORAGE_LOG").unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    manifest::load(&cli.config)?.with_overrides(cli.store.clone(), cli.advertise.clone())
}

fn run(cli: &Cli, command: Commands) -> Result<()> {
    let settings = load_settings(cli)?;

    match command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }

        Commands::Leases { json } => {
            // Read-only, no election needed
            let local = dialer(&settings).dial(&settings.store.address)?;
            let leases = LeaseStore::new(local.clone(), local, settings.store.lease_key.as_str());
            let table = IpAllocator::new(leases).leases()?;

            if json {
                print_json(&table)?;
            } else if table.is_empty() {
                println!("No leases");
            } else {
                println!("{:<64} ADDRESS", "CONTAINER");
                for (id, addr) in table.iter() {
                    println!("{:<64} {}", id, addr);
                }
                println!("\n{} lease(s)", table.len());
            }
            Ok(())
        }

        Commands::Release { id } => {
            let (allocator, _helm) = connect(&settings)?;
            allocator.release(&id)?;
            println!("Released lease for {}", id);
            Ok(())
        }

        Commands::Pin { id, address } => {
            let (allocator, _helm) = connect(&settings)?;
            allocator.pin(&id, address)?;
            println!("Pinned {} to {}", address, id);
            Ok(())
        }

        Commands::Anchor => anchor(&settings),
    }
}

/// Handle one CNI request
///
/// `cni_version` is updated to the request's version as soon as it is known,
/// so failures are reported in the version the runtime asked for.
fn run_plugin(cli: &Cli, input: impl io::Read, cni_version: &mut String) -> Result<()> {
    let args = &cli.cni;
    let verb: Verb = args
        .verb
        .as_deref()
        .ok_or(Error::MissingEnv("CNI_COMMAND"))?
        .parse()?;
    debug!(verb = %verb, container = ?args.container_id, ifname = ?args.ifname, "plugin invoked");

    match verb {
        Verb::Version => print_json(&VersionReply::default()),
        Verb::Get | Verb::Check => Err(Error::NotImplemented(verb.to_string())),
        Verb::Add => {
            let config = IpamConfig::read_from(input)?;
            cni_version.clone_from(&config.cni_version);
            let id = container_id(args)?;
            let settings = load_settings(cli)?;
            debug!(network = %config.network, range = %config.subnet_range, "allocating");
            let (allocator, _helm) = connect(&settings)?;
            let (addr, subnet) = allocator.get_or_allocate(id, &config.subnet_range)?;
            print_json(&AddResult::new(&config, addr, subnet))
        }
        Verb::Del => {
            let id = container_id(args)?;
            let settings = load_settings(cli)?;
            let (allocator, _helm) = connect(&settings)?;
            allocator.release(id)
        }
    }
}

fn container_id(args: &cli::CniArgs) -> Result<&str> {
    args.container_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(Error::MissingEnv("CNI_CONTAINERID"))
}

fn dialer(settings: &Settings) -> RedisDialer {
    RedisDialer::new(settings.store.pool_size, settings.connect_timeout())
}

/// Elect a write target and build an allocator on top of it
///
/// The returned `Helm` must be kept alive while the allocator is in use.
fn connect(settings: &Settings) -> Result<(IpAllocator, Helm)> {
    let dialer = dialer(settings);
    let local = dialer.dial(&settings.store.address)?;
    let helm = Helm::take(Arc::clone(&local), &dialer, &settings.election_options())?;
    debug!(
        role = ?helm.role(),
        master_known = helm.is_master_known(),
        writer = helm.writer().address(),
        "write target settled"
    );
    let store = LeaseStore::new(local, helm.writer(), settings.store.lease_key.as_str());
    Ok((IpAllocator::new(store), helm))
}

/// Hold mastership until Ctrl+C
fn anchor(settings: &Settings) -> Result<()> {
    if settings.election.advertise.is_none() {
        return Err(Error::ConfigValidation(
            "anchor requires an advertise address (--advertise or election.advertise)".into(),
        ));
    }

    let (_allocator, mut helm) = connect(settings)?;
    match helm.role().clone() {
        Role::Leader(me) => {
            println!("Holding mastership as {}. Press Ctrl+C to stop.", me);
        }
        Role::Follower(master) => {
            warn!(master = %master, "mastership already held");
            println!("Master is {}; nothing to anchor", master);
            return Ok(());
        }
        Role::Unelected => return Ok(()),
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(tokio::signal::ctrl_c())?;

    println!("\nShutting down...");
    helm.shutdown();
    info!("master key left to expire");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const CONF: &str = r#"{"cniVersion": "1.0.0", "ipam": {"subnet_range": "10.0.1.0/24", "gateway": "10.0.1.1"}}"#;

    #[test]
    fn test_failure_reports_request_version() {
        // No container id, so the request fails before any store is dialed
        let cli = Cli::try_parse_from(["moorage", "--cni-command", "ADD", "--cni-containerid", ""]).unwrap();
        let mut cni_version = cni::DEFAULT_VERSION.to_string();

        let err = run_plugin(&cli, CONF.as_bytes(), &mut cni_version).unwrap_err();

        assert!(matches!(err, Error::MissingEnv("CNI_CONTAINERID")));
        assert_eq!(cni_version, "1.0.0");
    }

    #[test]
    fn test_unknown_verb_keeps_default_version() {
        let cli = Cli::try_parse_from(["moorage", "--cni-command", "GC"]).unwrap();
        let mut cni_version = cni::DEFAULT_VERSION.to_string();

        let err = run_plugin(&cli, CONF.as_bytes(), &mut cni_version).unwrap_err();

        assert_eq!(err.cni_code(), 4);
        assert_eq!(cni_version, cni::DEFAULT_VERSION);
    }
}
