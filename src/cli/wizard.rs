use anyhow::{Result, bail};
use console::style;
use inquire::{Confirm, Select, Text};

use super::{run, tokens};
use crate::core::config::AppConfig;
use crate::core::crm::CrmClient;
use crate::core::deals::{CustomField, DealService, FieldKind, JobParams, TagValues};
use crate::core::terminal::{self, GuideSection, print_info, print_step, print_warn};

const CYCLE_ALL: &str = "Cycle through all values (group 1 gets the first, group 2 the second, ...)";
const SINGLE_VALUE: &str = "Use one value for every group";

pub async fn run_wizard(config: &AppConfig) -> Result<()> {
    terminal::print_banner();

    let mut client = CrmClient::from_config(config).await?;
    if !client.is_configured().await {
        print_warn("No portal credentials are stored yet.");
        if !Confirm::new("Enter them now?").with_default(true).prompt()? {
            return Ok(());
        }
        tokens::prompt_and_save(config).await?;
        client = CrmClient::from_config(config).await?;
        if !client.is_configured().await {
            return Ok(());
        }
    }
    let service = DealService::new(client);

    // --- Step 1: category ---
    print_step("Loading deal categories...");
    let categories = service.get_categories().await?;
    let labels: Vec<String> = categories
        .iter()
        .map(|c| format!("{} - {}", c.id, c.name))
        .collect();
    let category = &categories[Select::new("Deal category:", labels)
        .with_help_message("Use arrow keys to navigate, Enter to select")
        .raw_prompt()?
        .index];

    // --- Step 2: stage ---
    let stages = service.get_stages(&category.id).await?;
    if stages.is_empty() {
        bail!("Category {} has no stages", category.name);
    }
    let labels: Vec<String> = stages
        .iter()
        .map(|s| format!("{} - {}", s.status_id, s.name))
        .collect();
    let stage = &stages[Select::new("Stage:", labels).raw_prompt()?.index];

    // --- Step 3: field ---
    let fields = service.get_deal_user_fields().await?;
    if fields.is_empty() {
        bail!("No single-valued enumeration or string deal fields were found");
    }
    let labels: Vec<String> = fields
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{}. {}", i + 1, f))
        .collect();
    let field = &fields[Select::new("Field to set:", labels)
        .with_page_size(15)
        .raw_prompt()?
        .index];

    // --- Step 4: values ---
    let values = prompt_values(field)?;

    // --- Step 5: limits ---
    let max_deals = prompt_optional_number("Maximum number of deals (Enter = all):")?;
    let chunk_size = loop {
        match prompt_optional_number(&format!("Deals per group (Enter = {}):", config.chunk_size))? {
            None => break config.chunk_size,
            Some(0) => print_warn("Group size must be greater than zero."),
            Some(n) => break n,
        }
    };
    let dry_run = Confirm::new("Dry run (log only, write nothing)?")
        .with_default(true)
        .prompt()?;

    let mut params = JobParams::new(
        JobParams::stage_filter(&category.id, &stage.status_id),
        &field.name,
        values,
    );
    params.max_deals = max_deals;
    params.chunk_size = chunk_size;
    params.dry_run = dry_run;

    GuideSection::new("About to run")
        .status("Category", &format!("{} ({})", category.name, category.id))
        .status("Stage", &format!("{} ({})", stage.name, stage.status_id))
        .status("Field", &field.to_string())
        .status("Values", &params.values.to_string())
        .status(
            "Max deals",
            &max_deals.map_or_else(|| "all".to_string(), |n| n.to_string()),
        )
        .status("Group size", &chunk_size.to_string())
        .status(
            "Mode",
            &if dry_run {
                style("dry run").yellow().to_string()
            } else {
                style("APPLY CHANGES").red().bold().to_string()
            },
        )
        .print();
    println!();

    if !Confirm::new("Start?").with_default(true).prompt()? {
        print_info("Nothing was run.");
        return Ok(());
    }

    run::execute_job(&service, &params).await?;
    Ok(())
}

fn prompt_values(field: &CustomField) -> Result<TagValues> {
    match &field.kind {
        FieldKind::Enumeration { choices } => {
            if choices.is_empty() {
                bail!("{} has no enumeration values to assign", field.name);
            }
            let mode = Select::new("How should values be assigned?", vec![CYCLE_ALL, SINGLE_VALUE])
                .prompt()?;
            let choice_ids = if mode == CYCLE_ALL {
                choices.iter().map(|c| c.id.clone()).collect()
            } else {
                let labels: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                let picked = Select::new("Value:", labels).raw_prompt()?.index;
                vec![choices[picked].id.clone()]
            };
            Ok(TagValues::Enumeration { choice_ids })
        }
        FieldKind::Text => {
            let template = Text::new("Value template:")
                .with_default("{n}")
                .with_help_message("{n} is replaced with the group number")
                .prompt()?;
            Ok(TagValues::Text {
                template: Some(template).filter(|t| !t.is_empty()),
            })
        }
    }
}

/// Re-prompts until the answer is empty or a non-negative integer.
fn prompt_optional_number(message: &str) -> Result<Option<usize>> {
    loop {
        let answer = Text::new(message).prompt()?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(None);
        }
        match answer.parse::<usize>() {
            Ok(n) => return Ok(Some(n)),
            Err(_) => print_warn(&format!("'{}' is not a whole number, try again.", answer)),
        }
    }
}
