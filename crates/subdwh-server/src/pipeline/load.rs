//! Table-grouped warehouse load
//!
//! Files are grouped by destination table and each group is loaded with one
//! CREATE + COPY pair. Only after both statements succeed are the group's
//! files marked uploaded, one metadata write per file. The store offers no
//! transaction across those writes, so:
//!
//! - a file already marked uploaded is left alone
//! - a failed transition is reported and repaired later, never reloaded
//! - re-running a file set is safe because COPY skips files it already loaded

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use subdwh_common::UploadState;
use tracing::{error, info, instrument, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::notify::Notifier;
use crate::state::StateStore;
use crate::tables::TableMapper;
use crate::warehouse::{LoadStatements, Warehouse, MAX_FILES_PER_COPY};

/// Files bound for one table, loaded in a single statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBatch {
    pub table_name: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<LoadBatch>,
    /// `(table, error)` for every group whose statements failed
    pub failed: Vec<(String, String)>,
    /// Files no table rule matched; left awaiting upload
    pub unmapped: Vec<String>,
    /// Metadata writes performed; files already uploaded are not counted
    pub transitioned: usize,
}

/// Split `file_keys` into per-table batches, ordered by table name
///
/// Input order is kept within a table and duplicate keys are dropped. A table
/// with more than [`MAX_FILES_PER_COPY`] files gets consecutive batches.
pub fn group_by_table(
    mapper: &dyn TableMapper,
    file_keys: &[String],
) -> (Vec<LoadBatch>, Vec<String>) {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut unmapped = Vec::new();
    let mut seen = HashSet::new();

    for key in file_keys {
        if !seen.insert(key.as_str()) {
            continue;
        }
        match mapper.table_for(key) {
            Some(table) => groups.entry(table).or_default().push(key.clone()),
            None => unmapped.push(key.clone()),
        }
    }

    let batches = groups
        .into_iter()
        .flat_map(|(table_name, files)| {
            files
                .chunks(MAX_FILES_PER_COPY)
                .map(|chunk| LoadBatch {
                    table_name: table_name.clone(),
                    files: chunk.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect();

    (batches, unmapped)
}

pub struct LoadJob {
    state: Arc<dyn StateStore>,
    warehouse: Arc<dyn Warehouse>,
    mapper: Arc<dyn TableMapper>,
    statements: LoadStatements,
    notifier: Notifier,
}

impl LoadJob {
    pub fn new(
        state: Arc<dyn StateStore>,
        warehouse: Arc<dyn Warehouse>,
        mapper: Arc<dyn TableMapper>,
        statements: LoadStatements,
        notifier: Notifier,
    ) -> Self {
        Self {
            state,
            warehouse,
            mapper,
            statements,
            notifier,
        }
    }

    /// Load `file_keys`; every group is attempted even when an earlier one fails.
    #[instrument(skip(self, file_keys), fields(files = file_keys.len()))]
    pub async fn run(&self, file_keys: &[String]) -> PipelineResult<LoadReport> {
        let (batches, unmapped) = group_by_table(self.mapper.as_ref(), file_keys);

        let mut report = LoadReport {
            unmapped,
            ..Default::default()
        };

        if !report.unmapped.is_empty() {
            warn!(count = report.unmapped.len(), "Files match no table rule");
            self.notifier
                .send_best_effort(
                    None,
                    &format!(
                        "No destination table for {} file(s), left awaiting upload: {}",
                        report.unmapped.len(),
                        report.unmapped.join(", ")
                    ),
                )
                .await;
        }

        let mut untransitioned = Vec::new();
        let mut created = HashSet::new();

        for batch in batches {
            if let Err(e) = self.load_batch(&batch, &mut created).await {
                error!(table = %batch.table_name, error = %e, "Table load failed");
                report.failed.push((batch.table_name.clone(), e.to_string()));
                continue;
            }

            for file in &batch.files {
                match self.state.set_state(file, UploadState::Uploaded).await {
                    Ok(true) => report.transitioned += 1,
                    Ok(false) => {},
                    Err(e) => {
                        warn!(file = %file, error = %e, "Loaded file could not be marked uploaded");
                        untransitioned.push(file.clone());
                    },
                }
            }

            info!(table = %batch.table_name, files = batch.files.len(), "Table loaded");
            report.loaded.push(batch);
        }

        if !untransitioned.is_empty() {
            self.notifier
                .send_best_effort(
                    None,
                    &format!(
                        "Loaded but not marked uploaded ({} file(s)); repair with `state mark-uploaded`: {}",
                        untransitioned.len(),
                        untransitioned.join(", ")
                    ),
                )
                .await;
        }

        if !report.failed.is_empty() {
            // Batches of one table are consecutive.
            let mut loaded_tables: Vec<String> =
                report.loaded.iter().map(|b| b.table_name.clone()).collect();
            loaded_tables.dedup();
            let err = PipelineError::PartialLoad {
                loaded_tables,
                failed: report.failed.clone(),
            };
            self.notifier.send_best_effort(None, &err.to_string()).await;
            return Err(err);
        }

        if !untransitioned.is_empty() {
            return Err(PipelineError::Transition {
                files: untransitioned,
            });
        }

        Ok(report)
    }

    /// CREATE runs once per table and run; `created` tracks tables already done.
    async fn load_batch(
        &self,
        batch: &LoadBatch,
        created: &mut HashSet<String>,
    ) -> PipelineResult<()> {
        let Some(template) = batch.files.first() else {
            return Ok(());
        };

        if !created.contains(&batch.table_name) {
            self.warehouse
                .execute(&self.statements.create_table(&batch.table_name, template))
                .await?;
            created.insert(batch.table_name.clone());
        }

        self.warehouse
            .execute(&self.statements.copy_into(&batch.table_name, &batch.files))
            .await
    }
}
