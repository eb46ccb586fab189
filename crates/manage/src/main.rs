use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use catalog_infra::schema::MigrateOptions;
use catalog_manage::RefreshOutcome;
use catalog_manage::cli::{Cli, Command};
use catalog_manage::commands::{Backend, migrate, update_content_metadata};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    catalog_observability::init_with(cli.log_format);

    let database_url = cli.database_url.as_deref();
    match &cli.command {
        Command::UpdateContentMetadata(args) => {
            let summary = update_content_metadata::execute(database_url, args)
                .await
                .context("update-content-metadata failed")?;
            if args.strict && summary.outcome != RefreshOutcome::Succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Migrate { fake_initial } => {
            let backend = Backend::connect(database_url).await?;
            let options = MigrateOptions {
                fake_initial: *fake_initial,
            };
            migrate::migrate(&backend, options).await.context("migrate failed")?;
        }
        Command::ShowMigrations => {
            let backend = Backend::connect(database_url).await?;
            let statuses = migrate::show_migrations(&backend)
                .await
                .context("show-migrations failed")?;
            print!("{}", migrate::render_status(&statuses));
        }
    }

    Ok(ExitCode::SUCCESS)
}
