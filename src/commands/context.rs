//! Wiring from config to the pipeline's collaborators.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, DatabaseEngine, ProjectConfig};
use crate::container::{ContainerCli, DatabaseDumper};
use crate::credentials::CredentialResolver;
use crate::db::{Database, MysqlDatabase, SqliteDatabase};
use crate::error::{Result, StaxError};
use crate::importer::{DumpLoader, Importer};
use crate::pull::{ApiProviderFactory, Collaborators, SshConnector};
use crate::rewrite::RewriteOptions;
use crate::snapshot::SnapshotStore;
use crate::transport::KnownHostsStore;
use crate::warnings::Warnings;

/// Everything a command needs for one project.
pub struct ProjectContext {
    pub config: Config,
    pub project: ProjectConfig,
    pub warnings: Warnings,
    pub cancel: CancellationToken,
    container: ContainerCli,
}

/// Database handles for the configured engine.
struct Engine {
    database: Arc<dyn Database>,
    loader: Arc<dyn DumpLoader>,
    dumper: Arc<dyn DatabaseDumper>,
    name: String,
}

impl ProjectContext {
    pub fn new(config: Config, project_id: Option<&str>, cancel: CancellationToken) -> Result<Self> {
        let project = config.project(project_id).map_err(StaxError::config)?.clone();
        let name = match project.database_engine() {
            DatabaseEngine::Mysql { name } => name,
            DatabaseEngine::Sqlite { .. } => "db".to_string(),
        };
        let container = ContainerCli::new(project.container_program(), project.container_dir(), name);
        Ok(Self {
            config,
            project,
            warnings: Warnings::new(),
            cancel,
            container,
        })
    }

    pub fn container(&self) -> &ContainerCli {
        &self.container
    }

    fn engine(&self) -> Result<Engine> {
        match self.project.database_engine() {
            DatabaseEngine::Mysql { name } => Ok(Engine {
                database: Arc::new(MysqlDatabase::new(self.container.clone(), self.cancel.clone())),
                loader: Arc::new(self.container.clone()),
                dumper: Arc::new(self.container.clone()),
                name,
            }),
            DatabaseEngine::Sqlite { path } => {
                let db = SqliteDatabase::open(&path).map_err(|e| {
                    StaxError::config(format!("cannot open {}: {}", path.display(), e))
                })?;
                Ok(Engine {
                    database: Arc::new(db.clone()),
                    loader: Arc::new(db.clone()),
                    dumper: Arc::new(db),
                    name: path.display().to_string(),
                })
            }
        }
    }

    pub fn database(&self) -> Result<Arc<dyn Database>> {
        Ok(self.engine()?.database)
    }

    fn importer_for(&self, engine: &Engine) -> Importer {
        Importer::new(engine.loader.clone(), self.warnings.clone())
            .with_hooks(Arc::new(self.container.clone()), self.project.hooks())
    }

    pub fn importer(&self) -> Result<Importer> {
        Ok(self.importer_for(&self.engine()?))
    }

    pub fn snapshots(&self) -> Result<SnapshotStore> {
        let engine = self.engine()?;
        Ok(SnapshotStore::new(
            self.config.snapshots_dir(),
            engine.dumper.clone(),
            self.importer_for(&engine),
            self.warnings.clone(),
        )
        .with_database(engine.name))
    }

    pub fn resolver(&self) -> CredentialResolver {
        CredentialResolver::standard(self.config.credentials_file())
    }

    /// Rewrite options seeded from the project config.
    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            table_prefix: self.project.table_prefix(),
            skip_tables: self.project.skip_tables(),
            ..Default::default()
        }
    }

    pub fn collaborators(&self) -> Result<Collaborators> {
        let engine = self.engine()?;
        let importer = self.importer_for(&engine);
        let snapshots = SnapshotStore::new(
            self.config.snapshots_dir(),
            engine.dumper.clone(),
            importer.clone(),
            self.warnings.clone(),
        )
        .with_database(engine.name.clone());
        Ok(Collaborators {
            resolver: self.resolver(),
            provider: Arc::new(ApiProviderFactory::new(self.config.api_base())),
            connector: Arc::new(SshConnector::new(KnownHostsStore::new(
                self.config.known_hosts_file(),
            ))),
            local: Arc::new(self.container.clone()),
            snapshots: Arc::new(snapshots),
            importer,
            database: engine.database,
        })
    }

    /// Target database name passed to the import tool.
    pub fn target_database(&self) -> Result<String> {
        Ok(self.engine()?.name)
    }
}
