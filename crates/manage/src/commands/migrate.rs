use tracing::info;

use catalog_infra::schema::{MIGRATIONS, MigrateOptions, MigrationAction, MigrationKey, MigrationStatus, Migrator};

use super::Backend;

/// Apply every pending migration and return what happened to each.
pub async fn migrate(backend: &Backend, options: MigrateOptions) -> anyhow::Result<Vec<(MigrationKey, MigrationAction)>> {
    let migrator = Migrator::new(backend.migrations.as_ref(), MIGRATIONS);
    let done = migrator.migrate(options).await?;
    if done.is_empty() {
        info!("no migrations to apply");
    }
    for (key, action) in &done {
        match action {
            MigrationAction::Applied => info!(migration = %key, "applied"),
            MigrationAction::Faked => info!(migration = %key, "faked"),
        }
    }
    Ok(done)
}

pub async fn show_migrations(backend: &Backend) -> anyhow::Result<Vec<MigrationStatus>> {
    Ok(Migrator::new(backend.migrations.as_ref(), MIGRATIONS).status().await?)
}

/// One `[X] app.name` line per migration, in plan order.
pub fn render_status(statuses: &[MigrationStatus]) -> String {
    let mut out = String::new();
    for status in statuses {
        let mark = if status.applied { 'X' } else { ' ' };
        out.push_str(&format!("[{}] {}\n", mark, status.key));
    }
    out
}
