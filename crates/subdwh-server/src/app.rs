//! Application wiring
//!
//! Builds every pipeline component from a [`Config`] with the production
//! collaborators: S3, Slack, Snowflake, the substreams auth endpoint and the
//! package binary.

use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::binary::{BinarySource, MessariCli, SubstreamsAuth};
use crate::config::{ClassificationSource, Config};
use crate::ledger::StatusLedger;
use crate::notify::{ChatClient, NotificationHistory, Notifier, RunHistory, SlackClient};
use crate::pipeline::{LoadJob, PackageDiscoveryScheduler, ProcessingJob, UploadScheduler};
use crate::runtime::{CronTrigger, Dispatcher, Jobs, Runtime};
use crate::state::{ObjectStateStore, StateStore};
use crate::storage::{ObjectStore, Storage};
use crate::tables::{RuleTableMapper, TableMappingConfig};
use crate::warehouse::{LoadStatements, SnowflakeClient};

pub struct App {
    pub config: Config,
    pub state: Arc<dyn StateStore>,
    pub discovery: Arc<PackageDiscoveryScheduler>,
    pub upload: Arc<UploadScheduler>,
    pub processing: Arc<ProcessingJob>,
    pub load: Arc<LoadJob>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let storage = Storage::new(&config.storage).await?;
        let packages: Arc<dyn ObjectStore> =
            Arc::new(storage.with_bucket(config.storage.package_bucket.clone()));
        let data: Arc<dyn ObjectStore> = Arc::new(storage);

        let state: Arc<dyn StateStore> = Arc::new(ObjectStateStore::new(
            data.clone(),
            config.pipeline.cursor_key.clone(),
        ));

        let chat: Arc<dyn ChatClient> = Arc::new(SlackClient::new(
            http.clone(),
            config.slack.api_url.clone(),
            config.slack.bot_token.clone(),
        ));
        let ledger = Arc::new(StatusLedger::new(
            data.clone(),
            config.pipeline.ledger_prefix.clone(),
        ));
        let notifier = Notifier::new(chat.clone(), config.slack.channel.clone())
            .with_ledger(ledger.clone());

        let history: Arc<dyn RunHistory> = match config.classification {
            ClassificationSource::Ledger => ledger,
            ClassificationSource::Slack => Arc::new(NotificationHistory::new(
                chat,
                config.slack.channel.clone(),
            )),
        };
        info!(source = ?config.classification, "Retry classification source selected");

        let binary = MessariCli::new(
            config.binary.path.clone(),
            Duration::from_secs(config.binary.process_timeout_secs),
        )
        .with_source(BinarySource {
            store: packages.clone(),
            key: config.binary.key.clone(),
        });
        let auth = SubstreamsAuth::new(
            http.clone(),
            config.binary.auth_uri.clone(),
            config.binary.api_key.clone(),
        );

        let mapping = TableMappingConfig::load(config.table_mapping_file.as_deref())?;
        let mapper = RuleTableMapper::new(&mapping, &config.pipeline.output_prefix)?;

        let warehouse = SnowflakeClient::new(http, config.warehouse.clone());
        let statements =
            LoadStatements::new(config.warehouse.stage.clone(), config.warehouse.file_format.clone());

        let discovery = PackageDiscoveryScheduler::new(
            packages.clone(),
            config.pipeline.package_prefix.clone(),
            config.pipeline.package_extension.clone(),
        );
        let upload = UploadScheduler::new(data, state.clone(), config.output_prefix_dir());

        let processing = ProcessingJob::new(
            packages,
            Arc::new(binary),
            Arc::new(auth),
            history,
            notifier.clone(),
            config.pipeline.work_dir.clone(),
        );
        let load = LoadJob::new(
            state.clone(),
            Arc::new(warehouse),
            Arc::new(mapper),
            statements,
            notifier,
        );

        Ok(Self {
            config,
            state,
            discovery: Arc::new(discovery),
            upload: Arc::new(upload),
            processing: Arc::new(processing),
            load: Arc::new(load),
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        let jobs = Jobs::new(self.processing.clone(), self.load.clone());
        Arc::new(Dispatcher::new(
            Arc::new(jobs),
            self.config.schedule.max_concurrent_runs,
        ))
    }

    /// Both schedules over a fresh dispatcher.
    pub fn runtime(&self) -> Result<Runtime> {
        let discovery = CronTrigger::parse("discovery", &self.config.schedule.discovery)?;
        let upload = CronTrigger::parse("upload", &self.config.schedule.upload)?;

        Ok(Runtime::new(self.dispatcher())
            .schedule(discovery, self.discovery.clone())
            .schedule(upload, self.upload.clone()))
    }
}
