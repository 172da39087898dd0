//! Command-line interface for Moorage
//!
//! Uses clap with derive for type-safe CLI parsing. Invoked without a
//! subcommand the binary behaves as a CNI plugin, reading its request from
//! the `CNI_*` environment variables.

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Moorage - CNI IPAM plugin backed by a replicated key-value store
#[derive(Parser)]
#[command(name = "moorage")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, env = "MOORAGE_CONFIG", default_value = "/etc/cni/moorage.toml")]
    pub config: PathBuf,

    /// Local key-value store address (overrides the settings file)
    #[arg(long, env = "MOORAGE_STORE")]
    pub store: Option<String>,

    /// Address to publish when claiming mastership (overrides the settings file)
    #[arg(long, env = "MOORAGE_ADVERTISE")]
    pub advertise: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(flatten)]
    pub cni: CniArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Request parameters set by the container runtime
#[derive(Args, Debug, Default)]
pub struct CniArgs {
    /// Raw verb; unknown values are reported as CNI errors, not usage errors
    #[arg(long = "cni-command", env = "CNI_COMMAND", hide = true)]
    pub verb: Option<String>,

    #[arg(long = "cni-containerid", env = "CNI_CONTAINERID", hide = true)]
    pub container_id: Option<String>,

    #[arg(long = "cni-ifname", env = "CNI_IFNAME", hide = true)]
    pub ifname: Option<String>,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// List current leases
    Leases {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Release the lease held by a container
    Release {
        /// Container ID
        id: String,
    },

    /// Record a lease for a container by hand
    Pin {
        /// Container ID
        id: String,

        /// Address to assign
        address: Ipv4Addr,
    },

    /// Claim mastership and keep the master key alive until interrupted
    Anchor,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "moorage", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_plugin_mode_has_no_subcommand() {
        let cli = Cli::try_parse_from(["moorage", "--cni-command", "ADD", "--cni-containerid", "abc"]).unwrap();

        assert!(cli.command.is_none());
        assert_eq!(cli.cni.verb.as_deref(), Some("ADD"));
        assert_eq!(cli.cni.container_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unknown_verb_is_not_a_usage_error() {
        let cli = Cli::try_parse_from(["moorage", "--cni-command", "STATUS"]).unwrap();
        assert_eq!(cli.cni.verb.as_deref(), Some("STATUS"));
    }

    #[test]
    fn test_pin_parses_address() {
        let cli = Cli::try_parse_from(["moorage", "pin", "abc", "10.0.0.7"]).unwrap();
        match cli.command {
            Some(Commands::Pin { id, address }) => {
                assert_eq!(id, "abc");
                assert_eq!(address, Ipv4Addr::new(10, 0, 0, 7));
            }
            _ => panic!("expected pin"),
        }

        assert!(Cli::try_parse_from(["moorage", "pin", "abc", "nope"]).is_err());
    }

    #[test]
    fn test_verbose_counts() {
        let cli = Cli::try_parse_from(["moorage", "-vv", "leases"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
