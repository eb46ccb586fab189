use clap::{Args, Parser, Subcommand};

use catalog_core::CatalogUuid;
use catalog_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "catalog-manage")]
#[command(about = "Enterprise catalog management commands")]
pub struct Cli {
    /// Postgres connection string. Without it the commands run against an empty in-memory catalog.
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Refresh content metadata for every catalog query in use, then backfill full course metadata
    UpdateContentMetadata(UpdateContentMetadataArgs),
    /// Apply pending schema migrations
    Migrate {
        /// Record initial migrations as applied when their tables already exist
        #[arg(long)]
        fake_initial: bool,
    },
    /// List migrations and whether each one is applied
    ShowMigrations,
}

#[derive(Debug, Clone, Args)]
pub struct UpdateContentMetadataArgs {
    /// Catalogs to refresh. Accepted but not applied: every query in use is refreshed.
    #[arg(long = "catalog-uuids", num_args = 1..)]
    pub catalog_uuids: Vec<CatalogUuid>,

    /// Exit non-zero when the jobs fail or time out
    #[arg(long)]
    pub strict: bool,

    #[arg(long, env = "DISCOVERY_API_URL")]
    pub discovery_api_url: Option<String>,

    #[arg(long, env = "DISCOVERY_API_TOKEN", hide_env_values = true)]
    pub discovery_api_token: Option<String>,

    /// Worker threads running refresh jobs
    #[arg(long, env = "REFRESH_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "REFRESH_MAX_WAIT_SECS", default_value_t = 1800)]
    pub max_wait_secs: u64,

    #[arg(long, env = "REFRESH_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// How long jobs still queued or running after the wait may keep going before the command exits
    #[arg(long, env = "REFRESH_DRAIN_SECS", default_value_t = 1800)]
    pub drain_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_defaults() {
        let cli = Cli::try_parse_from(["catalog-manage", "update-content-metadata"]).unwrap();
        let Command::UpdateContentMetadata(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.max_wait_secs, 1800);
        assert_eq!(args.poll_interval_secs, 10);
        assert_eq!(args.drain_secs, 1800);
        assert!(args.catalog_uuids.is_empty());
        assert!(!args.strict);
    }

    #[test]
    fn catalog_uuids_take_several_values() {
        let cli = Cli::try_parse_from([
            "catalog-manage",
            "update-content-metadata",
            "--catalog-uuids",
            "7d0f9f3c-4c5b-4a8e-9f35-1b7f0f0b6d11",
            "0a1b2c3d-0000-4000-8000-000000000001",
        ])
        .unwrap();
        let Command::UpdateContentMetadata(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.catalog_uuids.len(), 2);
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let err = Cli::try_parse_from(["catalog-manage", "update-content-metadata", "--catalog-uuids", "nope"]);
        assert!(err.is_err());
    }

    #[test]
    fn migrate_flags() {
        let cli = Cli::try_parse_from(["catalog-manage", "--log-format", "text", "migrate", "--fake-initial"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(cli.command, Command::Migrate { fake_initial: true }));
    }
}
