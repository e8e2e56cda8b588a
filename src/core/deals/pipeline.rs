//! Paginated deal fetch and chunked field tagging.
//!
//! Everything here is strictly sequential: one page, one chunk, one
//! sub-batch at a time. Cancellation is only observed between chunks.

use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{DealService, value_as_id};
use crate::core::config::DEFAULT_CHUNK_SIZE;
use crate::core::crm::CrmApi;
use crate::core::crm::batch::{MAX_BATCH_COMMANDS, command_key, deal_update_command};
use crate::core::error::{BatcherError, Result};

/// Items per page the portal returns from list methods.
pub const PROVIDER_PAGE_SIZE: usize = 50;

/// Failure reason for a deal id seen earlier in the same job.
const DUPLICATE_DEAL: &str = "duplicate deal id, already tagged";

/// Replaced with the 1-based group number in string templates.
pub const GROUP_PLACEHOLDER: &str = "{n}";

/// How each group's value is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValues {
    /// Group `g` gets `choice_ids[(g - 1) % len]`. A single id tags every group alike.
    Enumeration { choice_ids: Vec<String> },
    /// Group `g` gets the template with `{n}` replaced by `g`, or just `g`.
    Text { template: Option<String> },
}

impl TagValues {
    /// `None` when an enumeration has no choices to assign.
    pub fn value_for_group(&self, group: usize) -> Option<String> {
        match self {
            TagValues::Enumeration { choice_ids } => {
                if choice_ids.is_empty() {
                    return None;
                }
                Some(choice_ids[(group - 1) % choice_ids.len()].clone())
            }
            TagValues::Text { template } => Some(match template {
                Some(template) => template.replace(GROUP_PLACEHOLDER, &group.to_string()),
                None => group.to_string(),
            }),
        }
    }
}

impl fmt::Display for TagValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValues::Enumeration { choice_ids } if choice_ids.len() == 1 => {
                write!(f, "enumeration, single value {}", choice_ids[0])
            }
            TagValues::Enumeration { choice_ids } => {
                write!(f, "enumeration, cycling {} values", choice_ids.len())
            }
            TagValues::Text { template } => write!(
                f,
                "string, template '{}'",
                template.as_deref().unwrap_or(GROUP_PLACEHOLDER)
            ),
        }
    }
}

/// One job run's configuration. Built by a driver, consumed by [`DealService::run_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    pub filter: Map<String, Value>,
    pub field_name: String,
    pub values: TagValues,
    pub chunk_size: usize,
    /// `None` processes every matching deal.
    pub max_deals: Option<usize>,
    pub dry_run: bool,
}

impl JobParams {
    pub fn new(filter: Map<String, Value>, field_name: &str, values: TagValues) -> Self {
        Self {
            filter,
            field_name: field_name.to_string(),
            values,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_deals: None,
            dry_run: true,
        }
    }

    /// `CATEGORY_ID` + `STAGE_ID` filter used by every driver.
    pub fn stage_filter(category_id: &str, stage_id: &str) -> Map<String, Value> {
        let category = category_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(category_id));
        let mut filter = Map::new();
        filter.insert("CATEGORY_ID".to_string(), category);
        filter.insert("STAGE_ID".to_string(), Value::from(stage_id));
        filter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// 1-based.
    pub group_index: usize,
    pub total_groups: usize,
    /// Deals updated successfully so far (every deal, in a dry run).
    pub processed: usize,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

#[cfg(test)]
pub struct NoProgress;

#[cfg(test)]
impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub group: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub total: usize,
    pub groups: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped_groups: usize,
    pub failures: Vec<ItemFailure>,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl JobSummary {
    fn new(job_id: Uuid, total: usize, groups: usize, dry_run: bool) -> Self {
        Self {
            job_id,
            total,
            groups,
            processed: 0,
            failed: 0,
            skipped_groups: 0,
            failures: Vec::new(),
            dry_run,
            cancelled: false,
        }
    }
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deals in {} groups: processed={}, failed={}",
            self.total, self.groups, self.processed, self.failed
        )?;
        if self.skipped_groups > 0 {
            write!(f, ", skipped groups={}", self.skipped_groups)?;
        }
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Result of applying one value to one chunk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub succeeded: usize,
    /// `(id, reason)` per deal whose update was not confirmed.
    pub failures: Vec<(String, String)>,
}

impl<C: CrmApi> DealService<C> {
    /// Collect list results page by page until the portal runs out, the
    /// cursor stops, or `max` items are gathered. Any call failure aborts.
    pub async fn fetch_all_paginated(
        &self,
        filter: &Map<String, Value>,
        select: &[&str],
        order: &Value,
        max: Option<usize>,
    ) -> Result<Vec<Value>> {
        let limit = max.unwrap_or(usize::MAX);
        let mut items: Vec<Value> = Vec::new();
        let mut cursor: u64 = 0;
        let mut reported_total: Option<u64> = None;

        while items.len() < limit {
            let response = self
                .client
                .invoke(
                    "crm.deal.list",
                    json!({
                        "filter": filter,
                        "select": select,
                        "order": order,
                        "start": cursor,
                    }),
                )
                .await?;
            reported_total = response.total.or(reported_total);

            let page = match response.result {
                Value::Array(page) => page,
                Value::Null => Vec::new(),
                other => {
                    return Err(BatcherError::Remote(format!(
                        "crm.deal.list: expected a list result, got {}",
                        other
                    )));
                }
            };
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            items.extend(page);
            if items.len() >= limit {
                break;
            }

            match response.next {
                Some(next) if next > cursor => cursor = next,
                Some(next) => {
                    warn!("crm.deal.list cursor did not advance ({} -> {}), stopping", cursor, next);
                    break;
                }
                None => {
                    if page_len >= PROVIDER_PAGE_SIZE {
                        warn!(
                            "crm.deal.list returned a full page without `next` after {} deals; later pages may be missing",
                            items.len()
                        );
                    }
                    break;
                }
            }
        }

        if items.len() < limit
            && let Some(total) = reported_total
            && (items.len() as u64) < total
        {
            warn!(
                "Portal reported {} matching deals but pagination stopped at {}",
                total,
                items.len()
            );
        }

        items.truncate(limit);
        Ok(items)
    }

    /// Tag `items` group by group: contiguous chunks of `chunk_size`, chunk
    /// `g` receiving `values.value_for_group(g)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn tag_by_groups(
        &self,
        job_id: Uuid,
        items: &[Value],
        field_name: &str,
        values: &TagValues,
        chunk_size: usize,
        dry_run: bool,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<JobSummary> {
        if chunk_size == 0 {
            return Err(BatcherError::Validation(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let total_groups = items.len().div_ceil(chunk_size);
        let mut summary = JobSummary::new(job_id, items.len(), total_groups, dry_run);
        let mut seen: HashSet<String> = HashSet::with_capacity(items.len());

        for (offset, chunk) in items.chunks(chunk_size).enumerate() {
            let group = offset + 1;
            if cancel.is_cancelled() {
                warn!("[{}] Cancelled before group {}/{}", job_id, group, total_groups);
                summary.cancelled = true;
                break;
            }

            match values.value_for_group(group) {
                None => {
                    warn!(
                        "[{}] No enumeration values configured, skipping group {}/{}",
                        job_id, group, total_groups
                    );
                    summary.skipped_groups += 1;
                }
                Some(value) => {
                    let mut ids = Vec::with_capacity(chunk.len());
                    for (pos, deal) in chunk.iter().enumerate() {
                        match deal.get("ID").and_then(value_as_id) {
                            Some(id) if seen.insert(id.clone()) => ids.push(id),
                            Some(id) => {
                                warn!("[{}] Deal {} was listed twice, tagging it once", job_id, id);
                                summary.failures.push(ItemFailure {
                                    id,
                                    group,
                                    reason: DUPLICATE_DEAL.to_string(),
                                });
                            }
                            None => summary.failures.push(ItemFailure {
                                id: format!("#{}", offset * chunk_size + pos + 1),
                                group,
                                reason: "deal has no ID".to_string(),
                            }),
                        }
                    }

                    let outcome = self
                        .apply_field_value(field_name, &value, &ids, dry_run)
                        .await?;
                    summary.processed += outcome.succeeded;
                    summary
                        .failures
                        .extend(outcome.failures.into_iter().map(|(id, reason)| ItemFailure {
                            id,
                            group,
                            reason,
                        }));
                    info!(
                        "[{}] Group {}/{}: {}={} on {} deals",
                        job_id,
                        group,
                        total_groups,
                        field_name,
                        value,
                        ids.len()
                    );
                }
            }

            summary.failed = summary.failures.len();
            progress.on_progress(&ProgressEvent {
                group_index: group,
                total_groups,
                processed: summary.processed,
            });
        }

        summary.failed = summary.failures.len();
        Ok(summary)
    }

    /// Set `field_name = value` on every id, in sub-batches of at most
    /// [`MAX_BATCH_COMMANDS`]. A repeated id is sent once and the repeat is
    /// reported as a failure. Per-deal failures are returned, not raised;
    /// only auth/configuration errors abort.
    pub async fn apply_field_value(
        &self,
        field_name: &str,
        value: &str,
        ids: &[String],
        dry_run: bool,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        let mut seen = HashSet::with_capacity(ids.len());
        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if seen.insert(id.as_str()) {
                unique.push(id.clone());
            } else {
                outcome.failures.push((id.clone(), DUPLICATE_DEAL.to_string()));
            }
        }

        if dry_run {
            info!(
                "[dry run] would set {}={} on {} deals",
                field_name,
                value,
                unique.len()
            );
            outcome.succeeded = unique.len();
            return Ok(outcome);
        }

        for sub_batch in unique.chunks(MAX_BATCH_COMMANDS) {
            let commands: BTreeMap<String, String> = sub_batch
                .iter()
                .map(|id| (command_key(id), deal_update_command(id, field_name, value)))
                .collect();

            match self.client.invoke_batch(&commands).await {
                Ok(results) => {
                    for id in sub_batch {
                        match results.get(&command_key(id)) {
                            Some(item) if item.is_success() => outcome.succeeded += 1,
                            Some(item) => {
                                warn!("Deal {} not updated: {}", id, item.failure_reason());
                                outcome.failures.push((id.clone(), item.failure_reason()));
                            }
                            None => outcome
                                .failures
                                .push((id.clone(), "no result returned".to_string())),
                        }
                    }
                }
                Err(e) if e.is_fatal_for_job() => return Err(e),
                Err(e) => {
                    warn!("Batch of {} updates failed: {}", sub_batch.len(), e);
                    outcome
                        .failures
                        .extend(sub_batch.iter().map(|id| (id.clone(), e.to_string())));
                }
            }
        }
        Ok(outcome)
    }

    /// Fetch the deals matching `params.filter` and tag them. Fetch errors
    /// abort before anything is written.
    pub async fn run_job(
        &self,
        params: &JobParams,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<JobSummary> {
        let job_id = Uuid::new_v4();
        info!(
            "[{}] Starting job: field={}, values={}, chunk_size={}, max={:?}, dry_run={}",
            job_id,
            params.field_name,
            params.values,
            params.chunk_size,
            params.max_deals,
            params.dry_run
        );

        let deals = self
            .fetch_all_paginated(
                &params.filter,
                &["ID", "TITLE", params.field_name.as_str()],
                &json!({ "DATE_CREATE": "ASC", "ID": "ASC" }),
                params.max_deals,
            )
            .await?;
        info!("[{}] Fetched {} deals", job_id, deals.len());

        let summary = self
            .tag_by_groups(
                job_id,
                &deals,
                &params.field_name,
                &params.values,
                params.chunk_size,
                params.dry_run,
                progress,
                cancel,
            )
            .await?;
        info!("[{}] Finished: {}", job_id, summary);
        Ok(summary)
    }
}
