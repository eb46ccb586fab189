#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::subscriber::DefaultGuard;

use catalog_core::{CatalogQueryId, EnterpriseUuid};
use catalog_domain::{CatalogQuery, EnterpriseCatalog};
use catalog_infra::jobs::{AsyncResult, Job, JobScheduler, SchedulerError};
use catalog_infra::repository::InMemoryCatalogRepository;

/// Log lines written while the returned guard is alive on this thread.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_target(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text().contains(needle)
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Scheduler that records what it is given and hands back a preset result.
pub struct RecordingScheduler {
    result: AsyncResult,
    pub chords: Mutex<Vec<(Vec<Job>, Job)>>,
}

impl RecordingScheduler {
    pub fn resolving_with(result: AsyncResult) -> Arc<Self> {
        Arc::new(Self {
            result,
            chords: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        let result = AsyncResult::pending();
        result.resolve_success();
        Self::resolving_with(result)
    }

    pub fn failing(error: &str) -> Arc<Self> {
        let result = AsyncResult::pending();
        result.resolve_failure(error);
        Self::resolving_with(result)
    }

    /// Never resolves.
    pub fn hanging() -> Arc<Self> {
        Self::resolving_with(AsyncResult::pending())
    }
}

impl JobScheduler for RecordingScheduler {
    fn submit(&self, _job: Job) -> Result<AsyncResult, SchedulerError> {
        Err(SchedulerError::State("only chords are expected".into()))
    }

    fn chord(&self, header: Vec<Job>, callback: Job) -> Result<AsyncResult, SchedulerError> {
        self.chords.lock().unwrap().push((header, callback));
        Ok(self.result.clone())
    }
}

pub fn filter(org: &str) -> Value {
    json!({"org": org, "content_type": ["course", "courserun"]})
}

/// Repository holding `used` queries referenced by catalogs and `unused` ones nobody references.
pub fn repository_with_queries(used: &[i64], unused: &[i64]) -> Arc<InMemoryCatalogRepository> {
    let repo = Arc::new(InMemoryCatalogRepository::new());
    for id in used.iter().chain(unused) {
        let query = CatalogQuery::new(CatalogQueryId::new(*id), filter(&format!("org{id}"))).unwrap();
        repo.insert_query(query);
    }
    for id in used {
        repo.insert_catalog(EnterpriseCatalog {
            uuid: Default::default(),
            title: format!("Catalog for query {id}"),
            enterprise_uuid: EnterpriseUuid::new(),
            catalog_query: Some(CatalogQueryId::new(*id)),
        });
    }
    repo
}
