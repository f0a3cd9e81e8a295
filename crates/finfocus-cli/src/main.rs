mod config;
mod conformance_cmd;
mod cost_cmds;
mod plugin_cmds;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use finfocus_core::conformance::Verbosity;

use config::FinfocusConfig;
use conformance_cmd::{ConformanceArgs, EXIT_USAGE};
use cost_cmds::CostOutput;

#[derive(Parser)]
#[command(
    name = "finfocus",
    version,
    about = "Plugin host and conformance suite for infrastructure cost plugins"
)]
struct Cli {
    /// Plugin install root (overrides FINFOCUS_PLUGIN_DIR and the config file)
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plugin management and certification
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Query costs through the installed plugins
    Cost {
        #[command(subcommand)]
        command: CostCommands,
    },
    /// Print a shell completion script
    Completions {
        /// Target shell
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List installed plugins and discovery errors
    List,
    /// Start a plugin and print what it reports
    Inspect {
        /// Plugin name
        name: String,
        /// Also print dry-run field mappings for this resource type (e.g. aws:ec2:Instance)
        #[arg(long)]
        resource_type: Option<String>,
    },
    /// Run the conformance suite against a plugin binary
    Conformance(ConformanceArgs),
}

#[derive(Subcommand)]
enum CostCommands {
    /// Projected monthly cost of each resource
    Projected {
        /// JSON file holding an array of resource descriptors
        #[arg(long)]
        resources: PathBuf,
        #[arg(long, value_enum, default_value = "table")]
        output: CostOutput,
    },
    /// Actual spend of one resource over a window
    Actual {
        #[arg(long)]
        resource_id: String,
        /// Window start (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: String,
        /// Window end, exclusive
        #[arg(long)]
        to: String,
        #[arg(long, value_enum, default_value = "table")]
        output: CostOutput,
    },
}

/// Map a conformance verbosity to a default log filter.
fn verbosity_filter(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Quiet => "error",
        Verbosity::Normal => "warn",
        Verbosity::Verbose => "info",
        Verbosity::Debug => "debug",
    }
}

fn init_tracing(default_filter: &str) {
    // Logs go to stderr so JSON and JUnit on stdout stay parseable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "finfocus", &mut std::io::stdout());
        return Ok(());
    }

    let config = match FinfocusConfig::resolve(cli.plugin_dir.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(EXIT_USAGE);
        }
    };

    match cli.command {
        Commands::Plugin {
            command: PluginCommands::Conformance(args),
        } => {
            if std::env::var_os(config::LOG_LEVEL_ENV).is_some() {
                init_tracing(&config.log_level);
            } else {
                init_tracing(verbosity_filter(args.verbosity));
            }
            let code = conformance_cmd::run_conformance(args, &config).await;
            std::process::exit(code);
        }
        Commands::Plugin {
            command: PluginCommands::List,
        } => {
            init_tracing(&config.log_level);
            plugin_cmds::run_list(&config)?;
        }
        Commands::Plugin {
            command: PluginCommands::Inspect { name, resource_type },
        } => {
            init_tracing(&config.log_level);
            plugin_cmds::run_inspect(&config, &name, resource_type.as_deref()).await?;
        }
        Commands::Cost {
            command: CostCommands::Projected { resources, output },
        } => {
            init_tracing(&config.log_level);
            cost_cmds::run_projected(&config, &resources, output).await?;
        }
        Commands::Cost {
            command:
                CostCommands::Actual {
                    resource_id,
                    from,
                    to,
                    output,
                },
        } => {
            init_tracing(&config.log_level);
            cost_cmds::run_actual(&config, &resource_id, &from, &to, output).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_conformance_flags() {
        let cli = Cli::try_parse_from([
            "finfocus",
            "plugin",
            "conformance",
            "./finfocus-plugin-aws",
            "--mode",
            "stdio",
            "--category",
            "protocol",
            "--category",
            "error",
            "--timeout",
            "90s",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Plugin {
                command: PluginCommands::Conformance(args),
            } => {
                assert_eq!(args.path, PathBuf::from("./finfocus-plugin-aws"));
                assert_eq!(args.mode, finfocus_proto::CommMode::Stdio);
                assert_eq!(args.categories.len(), 2);
                assert_eq!(args.timeout, std::time::Duration::from_secs(90));
                assert_eq!(args.case_timeout, std::time::Duration::from_secs(30));
            }
            _ => panic!("expected plugin conformance"),
        }
    }

    #[test]
    fn parse_rejects_unknown_category() {
        let result = Cli::try_parse_from([
            "finfocus",
            "plugin",
            "conformance",
            "./p",
            "--category",
            "vibes",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn plugin_dir_is_global() {
        let cli =
            Cli::try_parse_from(["finfocus", "plugin", "list", "--plugin-dir", "/srv/plugins"])
                .expect("should parse");

        assert_eq!(cli.plugin_dir, Some(PathBuf::from("/srv/plugins")));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
