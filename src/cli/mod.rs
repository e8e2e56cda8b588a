mod run;
mod serve;
mod tokens;
mod wizard;

use anyhow::{Context, Result, anyhow};
use console::style;

use crate::core::config::AppConfig;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Jobs")
        .command("wizard", "Interactive wizard (default when no command is given)")
        .command("run", "Tag deals non-interactively")
        .print();

    GuideSection::new("Credentials")
        .command("set-tokens", "Store portal host and tokens")
        .command("status", "Show stored credentials and settings")
        .print();

    GuideSection::new("Services")
        .command("serve", "Start the HTTP installer (and the chat bot if configured)")
        .command("bot", "Start only the chat bot")
        .print();

    GuideSection::new("deal-batcher run")
        .text("--category <id>        Deal category (funnel) id, 0 for the default one")
        .text("--stage <status>       Stage status id, e.g. NEW or C4:NEW")
        .text("--field <FIELD_NAME>   User field to set, e.g. UF_CRM_GROUP")
        .text("--values <a,b,..>      Enumeration choice ids, cycled per group")
        .text("--template <text>      String value; {n} becomes the group number")
        .text("--chunk-size <n>       Deals per group (default 150)")
        .text("--max <n>              Process at most n deals")
        .text("--apply                Write changes (dry run otherwise)")
        .print();

    GuideSection::new("deal-batcher set-tokens")
        .text("--domain <host> --access-token <token> [--refresh-token <token>] [--expires-in <secs>]")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("deal-batcher").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct RunCommandArgs {
    pub category: String,
    pub stage: String,
    pub field: String,
    pub values: Option<Vec<String>>,
    pub template: Option<String>,
    pub chunk_size: Option<usize>,
    pub max: Option<usize>,
    pub apply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct SetTokensArgs {
    pub domain: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

fn flag_value(args: &[String], i: usize) -> Result<String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| anyhow!("{} expects a value", args[i]))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} expects a number, got '{}'", flag, value))
}

pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> Result<RunCommandArgs> {
    let mut parsed = RunCommandArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--category" | "-c" => {
                parsed.category = flag_value(args, i)?;
                i += 2;
            }
            "--stage" | "-s" => {
                parsed.stage = flag_value(args, i)?;
                i += 2;
            }
            "--field" | "-f" => {
                parsed.field = flag_value(args, i)?;
                i += 2;
            }
            "--values" => {
                let values: Vec<String> = flag_value(args, i)?
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                parsed.values = Some(values);
                i += 2;
            }
            "--template" | "-t" => {
                parsed.template = Some(flag_value(args, i)?);
                i += 2;
            }
            "--chunk-size" => {
                let size: usize = parse_number("--chunk-size", &flag_value(args, i)?)?;
                if size == 0 {
                    return Err(anyhow!("--chunk-size must be greater than zero"));
                }
                parsed.chunk_size = Some(size);
                i += 2;
            }
            "--max" => {
                parsed.max = Some(parse_number("--max", &flag_value(args, i)?)?);
                i += 2;
            }
            "--apply" => {
                parsed.apply = true;
                i += 1;
            }
            "--dry-run" => {
                parsed.apply = false;
                i += 1;
            }
            other => return Err(anyhow!("Unknown option for run: {}", other)),
        }
    }

    for (flag, value) in [
        ("--category", &parsed.category),
        ("--stage", &parsed.stage),
        ("--field", &parsed.field),
    ] {
        if value.trim().is_empty() {
            return Err(anyhow!("{} is required", flag));
        }
    }
    if parsed.values.is_some() && parsed.template.is_some() {
        return Err(anyhow!("--values and --template cannot be combined"));
    }
    Ok(parsed)
}

pub(crate) fn parse_set_tokens_args(args: &[String], start: usize) -> Result<SetTokensArgs> {
    let mut parsed = SetTokensArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--domain" | "-d" => {
                parsed.domain = flag_value(args, i)?;
                i += 2;
            }
            "--access-token" => {
                parsed.access_token = flag_value(args, i)?;
                i += 2;
            }
            "--refresh-token" => {
                parsed.refresh_token = Some(flag_value(args, i)?).filter(|t| !t.trim().is_empty());
                i += 2;
            }
            "--expires-in" => {
                let secs: i64 = parse_number("--expires-in", &flag_value(args, i)?)?;
                if secs <= 0 {
                    return Err(anyhow!("--expires-in must be a positive number of seconds"));
                }
                parsed.expires_in = Some(secs);
                i += 2;
            }
            other => return Err(anyhow!("Unknown option for set-tokens: {}", other)),
        }
    }
    if parsed.domain.trim().is_empty() || parsed.access_token.trim().is_empty() {
        return Err(anyhow!("--domain and --access-token are required"));
    }
    Ok(parsed)
}

pub(crate) fn parse_server_flags(
    args: &[String],
    start: usize,
    mut host: String,
    mut port: u16,
) -> Result<(String, u16)> {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                host = flag_value(args, i)?;
                i += 2;
            }
            "--port" | "-p" => {
                port = parse_number("--port", &flag_value(args, i)?)?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok((host, port))
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("wizard");

    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let data_dir = NativePlatform::data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Cannot create data directory {}", data_dir.display()))?;
    NativePlatform::restrict_dir_permissions(&data_dir);

    let config = AppConfig::load(&data_dir).await?;
    let long_running = matches!(cmd, "serve" | "bot");
    logging::init(&config.logs_dir(), config.debug, !long_running);

    match cmd {
        "wizard" => {
            wizard::run_wizard(&config).await?;
            terminal::print_goodbye();
        }
        "run" => {
            let parsed = parse_run_command_args(&args, 2)?;
            run::run_command(&config, parsed).await?;
        }
        "set-tokens" => {
            let parsed = parse_set_tokens_args(&args, 2)?;
            tokens::run_set_tokens(&config, parsed).await?;
        }
        "status" => tokens::run_status(&config).await?,
        "serve" => {
            let (host, port) =
                parse_server_flags(&args, 2, config.server_host.clone(), config.server_port)?;
            serve::run_serve(config, host, port).await?;
        }
        "bot" => serve::run_bot(config).await?,
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_run_command_args, parse_server_flags, parse_set_tokens_args};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_run_command_args_reads_all_flags() {
        let args = argv(&[
            "deal-batcher", "run", "--category", "4", "--stage", "C4:NEW", "--field",
            "UF_CRM_GROUP", "--values", "11, 22", "--chunk-size", "100", "--max", "500", "--apply",
        ]);
        let parsed = parse_run_command_args(&args, 2).unwrap();
        assert_eq!(parsed.category, "4");
        assert_eq!(parsed.stage, "C4:NEW");
        assert_eq!(parsed.field, "UF_CRM_GROUP");
        assert_eq!(parsed.values, Some(vec!["11".to_string(), "22".to_string()]));
        assert_eq!(parsed.chunk_size, Some(100));
        assert_eq!(parsed.max, Some(500));
        assert!(parsed.apply);
    }

    #[test]
    fn run_defaults_to_dry_run() {
        let args = argv(&[
            "deal-batcher", "run", "-c", "0", "-s", "NEW", "-f", "UF_CRM_NOTE", "-t", "Batch {n}",
        ]);
        let parsed = parse_run_command_args(&args, 2).unwrap();
        assert!(!parsed.apply);
        assert_eq!(parsed.template.as_deref(), Some("Batch {n}"));
        assert_eq!(parsed.max, None);
    }

    #[test]
    fn run_requires_category_stage_and_field() {
        let args = argv(&["deal-batcher", "run", "--stage", "NEW", "--field", "UF_X"]);
        let err = parse_run_command_args(&args, 2).unwrap_err();
        assert!(err.to_string().contains("--category"));
    }

    #[test]
    fn run_rejects_bad_numbers_and_missing_values() {
        let base = ["deal-batcher", "run", "-c", "0", "-s", "NEW", "-f", "UF_X"];
        let mut with_max = base.to_vec();
        with_max.extend(["--max", "lots"]);
        assert!(parse_run_command_args(&argv(&with_max), 2).is_err());

        let mut zero_chunk = base.to_vec();
        zero_chunk.extend(["--chunk-size", "0"]);
        assert!(parse_run_command_args(&argv(&zero_chunk), 2).is_err());

        let mut dangling = base.to_vec();
        dangling.push("--values");
        assert!(parse_run_command_args(&argv(&dangling), 2).is_err());
    }

    #[test]
    fn parse_set_tokens_args_reads_optional_fields() {
        let args = argv(&[
            "deal-batcher", "set-tokens", "--domain", "portal.example.com", "--access-token",
            "abc", "--refresh-token", "def", "--expires-in", "3600",
        ]);
        let parsed = parse_set_tokens_args(&args, 2).unwrap();
        assert_eq!(parsed.domain, "portal.example.com");
        assert_eq!(parsed.access_token, "abc");
        assert_eq!(parsed.refresh_token.as_deref(), Some("def"));
        assert_eq!(parsed.expires_in, Some(3600));
    }

    #[test]
    fn set_tokens_rejects_non_positive_or_huge_expiry() {
        for expires_in in ["0", "-3600", "9223372036854775808"] {
            let args = argv(&[
                "deal-batcher", "set-tokens", "--domain", "portal.example.com", "--access-token",
                "abc", "--expires-in", expires_in,
            ]);
            assert!(parse_set_tokens_args(&args, 2).is_err(), "accepted {}", expires_in);
        }
    }

    #[test]
    fn set_tokens_requires_domain_and_access_token() {
        let args = argv(&["deal-batcher", "set-tokens", "--domain", "portal.example.com"]);
        assert!(parse_set_tokens_args(&args, 2).is_err());
    }

    #[test]
    fn parse_server_flags_overrides_host_and_port() {
        let args = argv(&["deal-batcher", "serve", "--host", "127.0.0.1", "--port", "8081"]);
        let (host, port) = parse_server_flags(&args, 2, "0.0.0.0".to_string(), 3000).unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8081);
    }
}
