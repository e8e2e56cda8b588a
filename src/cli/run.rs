use anyhow::{Result, anyhow, bail};
use console::style;
use tokio_util::sync::CancellationToken;

use super::RunCommandArgs;
use crate::core::config::AppConfig;
use crate::core::crm::{CrmApi, CrmClient};
use crate::core::deals::{
    CustomField, DealService, FieldKind, JobParams, JobSummary, ProgressEvent, TagValues,
};
use crate::core::terminal::{self, GuideSection, print_info, print_success, print_warn};

/// Failures listed individually before the rest is summarised as a count.
const MAX_LISTED_FAILURES: usize = 20;

pub async fn run_command(config: &AppConfig, args: RunCommandArgs) -> Result<()> {
    let service = DealService::new(CrmClient::from_config(config).await?);

    let fields = service.get_deal_user_fields().await?;
    let field = fields
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(&args.field))
        .ok_or_else(|| {
            anyhow!(
                "{} is not a single-valued enumeration or string deal field",
                args.field
            )
        })?;
    let values = tag_values_for(field, &args)?;

    let mut params = JobParams::new(
        JobParams::stage_filter(&args.category, &args.stage),
        &field.name,
        values,
    );
    params.chunk_size = args.chunk_size.unwrap_or(config.chunk_size);
    params.max_deals = args.max;
    params.dry_run = !args.apply;

    print_info(&format!(
        "Tagging deals in category {} / stage {}: {} ({})",
        args.category, args.stage, field.name, params.values
    ));
    if params.dry_run {
        print_warn("Dry run: nothing will be written. Pass --apply to update deals.");
    }

    execute_job(&service, &params).await?;
    Ok(())
}

/// Turn `--values` / `--template` into the value plan for this field.
pub(crate) fn tag_values_for(field: &CustomField, args: &RunCommandArgs) -> Result<TagValues> {
    match &field.kind {
        FieldKind::Enumeration { choices } => {
            if args.template.is_some() {
                bail!("{} is an enumeration field; use --values", field.name);
            }
            let Some(ids) = args.values.as_ref().filter(|ids| !ids.is_empty()) else {
                let known: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                bail!(
                    "--values is required for {}. Choices: {}",
                    field.name,
                    known.join(", ")
                );
            };
            for id in ids {
                if !choices.iter().any(|c| &c.id == id) {
                    bail!("{} is not a choice id of {}", id, field.name);
                }
            }
            Ok(TagValues::Enumeration {
                choice_ids: ids.clone(),
            })
        }
        FieldKind::Text => {
            if args.values.is_some() {
                bail!("{} is a string field; use --template", field.name);
            }
            Ok(TagValues::Text {
                template: args.template.clone(),
            })
        }
    }
}

/// Run the job with console progress. Ctrl-C stops it before the next chunk.
pub(crate) async fn execute_job<C: CrmApi>(
    service: &DealService<C>,
    params: &JobParams,
) -> Result<JobSummary> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let progress = |event: &ProgressEvent| {
        terminal::print_progress(event.group_index, event.total_groups, event.processed);
    };
    let result = service.run_job(params, &progress, &cancel).await;
    watcher.abort();
    println!();

    let summary = result?;
    print_summary(&summary);
    Ok(summary)
}

pub(crate) fn print_summary(summary: &JobSummary) {
    let mut section = GuideSection::new("Job summary")
        .status("Job", &summary.job_id.to_string())
        .status("Deals", &summary.total.to_string())
        .status("Groups", &summary.groups.to_string())
        .status("Processed", &style(summary.processed).green().to_string())
        .status("Failed", &summary.failed.to_string());
    if summary.skipped_groups > 0 {
        section = section.status("Skipped groups", &summary.skipped_groups.to_string());
    }
    for failure in summary.failures.iter().take(MAX_LISTED_FAILURES) {
        section = section.text(&format!(
            "deal {} (group {}): {}",
            failure.id, failure.group, failure.reason
        ));
    }
    if summary.failures.len() > MAX_LISTED_FAILURES {
        section = section.text(&format!(
            "... and {} more",
            summary.failures.len() - MAX_LISTED_FAILURES
        ));
    }
    section.print();
    println!();

    if summary.cancelled {
        print_warn("Job was cancelled before all groups were processed.");
    } else if summary.dry_run {
        print_success("Dry run finished. Nothing was written.");
    } else if summary.failed == 0 {
        print_success("All deals updated.");
    } else {
        print_warn(&format!("{} deals could not be updated.", summary.failed));
    }
}
