//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use subst_core::Build;
use subst_shared::{AppConfig, BuildConfig, Node, init_config, load_config, load_config_from};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// subst: substitute values into rendered manifests.
#[derive(Parser)]
#[command(
    name = "subst",
    version,
    about = "Resolve (( path )) substitutions in a manifest tree and print the result.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.subst/subst.toml).
    #[arg(long, global = true, env = "SUBST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Output format for the substitution mapping.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    Yaml,
    Json,
}

/// Flags overriding values from the config file.
#[derive(Args, Debug, Default)]
pub(crate) struct Overrides {
    /// Environment variables eligible as substitutions.
    #[arg(long, global = true, env = "SUBST_ENV_REGEX")]
    pub env_regex: Option<String>,

    /// Files treated as substitution files.
    #[arg(long, global = true, env = "SUBST_FILE_REGEX")]
    pub file_regex: Option<String>,

    /// Leave encrypted values untouched.
    #[arg(long, global = true, env = "SUBST_SKIP_DECRYPT")]
    pub skip_decrypt: bool,

    /// Never read keys from the cluster secret.
    #[arg(long, global = true, env = "SUBST_SKIP_SECRETS")]
    pub skip_secrets: bool,

    /// Name of the secret holding decryption keys.
    #[arg(long, global = true, env = "SUBST_SECRET_NAME")]
    pub secret_name: Option<String>,

    /// Namespace of the secret holding decryption keys.
    #[arg(long, global = true, env = "SUBST_SECRET_NAMESPACE")]
    pub secret_namespace: Option<String>,

    /// Cluster API endpoint.
    #[arg(long, global = true, env = "SUBST_KUBE_API")]
    pub kube_api: Option<String>,

    /// Kube-config file.
    #[arg(long, global = true, env = "SUBST_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Hex-encoded decryption key (repeatable).
    #[arg(
        long = "key",
        global = true,
        env = "SUBST_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub keys: Vec<String>,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(env_regex) = &self.env_regex {
            config.substitution.env_regex = env_regex.clone();
        }
        if let Some(file_regex) = &self.file_regex {
            config.substitution.file_regex = file_regex.clone();
        }
        if self.skip_decrypt {
            config.decryption.skip_decrypt = true;
        }
        if self.skip_secrets {
            config.secret.skip = true;
        }
        if let Some(name) = &self.secret_name {
            config.secret.name = Some(name.clone());
        }
        if let Some(namespace) = &self.secret_namespace {
            config.secret.namespace = Some(namespace.clone());
        }
        if let Some(kube_api) = &self.kube_api {
            config.secret.kube_api = Some(kube_api.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            config.secret.kubeconfig = Some(kubeconfig.clone());
        }
        config
            .decryption
            .keys
            .extend(self.keys.iter().filter(|k| !k.is_empty()).cloned());
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Substitute every manifest under PATH and print them as a YAML stream.
    Render {
        /// Root of the manifest tree.
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print the bootstrapped substitution mapping for PATH.
    Substitutions {
        /// Root of the manifest tree.
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output format.
        #[arg(short, long, default_value = "yaml")]
        output: OutputFormat,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "subst=info",
        1 => "subst=debug",
        _ => "subst=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Render { path } => cmd_render(&cli, path).await,
        Command::Substitutions { path, output } => cmd_substitutions(&cli, path, output).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&cli),
        },
    }
}

/// File config merged with flag overrides.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    cli.overrides.apply(&mut config);
    Ok(config)
}

fn build_config(cli: &Cli, root: &Path) -> Result<BuildConfig> {
    Ok(BuildConfig::new(root, &resolve_config(cli)?))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_render(cli: &Cli, path: &Path) -> Result<()> {
    let mut build = Build::new(build_config(cli, path)?)?;
    build.build_substitutions().await?;
    let report = build.build().await?;

    print!("{}", yaml_stream(build.manifests())?);

    info!(
        documents = build.documents().len(),
        applied = report.applied,
        dropped = report.dropped,
        "render complete"
    );
    Ok(())
}

async fn cmd_substitutions(cli: &Cli, path: &Path, output: &OutputFormat) -> Result<()> {
    let mut build = Build::new(build_config(cli, path)?)?;
    build.build_substitutions().await?;

    let substitutions = build
        .substitutions()
        .ok_or_else(|| eyre!("substitutions were not built"))?;
    let mapping = substitutions.mapping();

    match output {
        OutputFormat::Yaml => print!("{}", mapping.to_yaml_string()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(mapping)?),
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?.redacted();
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

/// Multi-document YAML stream, one `---` separated document per manifest.
fn yaml_stream(manifests: &[Node]) -> Result<String> {
    let mut out = String::new();
    for manifest in manifests {
        out.push_str("---\n");
        out.push_str(&manifest.to_yaml_string()?);
    }
    Ok(out)
}
