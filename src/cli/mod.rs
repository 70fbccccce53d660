//! CLI command handling
//!
//! Runs CLI commands and formats their output.

use colored::Colorize;

use crate::build::{Build, BuildCatalog};
use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::context::RunContext;
use crate::log_parser::{CallstackMessage, LogParser};
use crate::testing;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Builds {
            path,
            project,
            max_depth,
            platform,
        } => {
            let catalog = BuildCatalog::new();
            let builds: Vec<Build> = catalog
                .get_builds_at_path(&project, &path, max_depth)
                .into_iter()
                .filter(|b| platform.map_or(true, |p| b.platform == p))
                .collect();

            if builds.is_empty() {
                println!("No builds of {} found under {}", project, path.display());
                return Ok(());
            }

            println!("Builds of {} under {}:", project, path.display());
            for build in &builds {
                println!("  {}", build.describe());
                println!("    {}", build.source_dir.display().to_string().dimmed());
            }
            Ok(())
        }

        Commands::Devices => {
            let context = RunContext::new(Config::load()?)?;
            let platforms: Vec<String> = context
                .registry
                .platforms()
                .iter()
                .map(|p| p.to_string())
                .collect();
            println!("Supported platforms: {}", platforms.join(", "));

            let status = context.pool.status().await;
            if status.is_empty() {
                println!("No devices configured");
                return Ok(());
            }

            println!("Devices:");
            for device in status {
                let state = match (&device.problem, device.reserved) {
                    (Some(problem), _) => format!("problem: {}", problem).red().to_string(),
                    (None, true) => "reserved".yellow().to_string(),
                    (None, false) => "available".green().to_string(),
                };
                println!("  {:<8} {:<32} {}", device.platform, device.name, state);
            }
            Ok(())
        }

        Commands::ParseLog {
            file,
            channel,
            callstacks,
        } => {
            let parser = LogParser::from_file(&file)?;
            print_log_summary(&parser, callstacks);

            if !channel.is_empty() {
                let channels: Vec<&str> = channel.iter().map(String::as_str).collect();
                println!();
                for line in parser.channel_lines(&channels) {
                    println!("{}", line.line);
                }
            }
            Ok(())
        }

        Commands::Run {
            scenario,
            verbose,
            log_dir: _,
        } => {
            let result = testing::run_scenario(&scenario, verbose).await?;
            if result.passed {
                Ok(())
            } else {
                Err(Error::TestAssertion(format!(
                    "{}: {} of {} test(s) passed{}",
                    result.name,
                    result.tests_passed,
                    result.tests_total,
                    result
                        .error
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                )))
            }
        }
    }
}

fn print_log_summary(parser: &LogParser, callstacks: bool) {
    let summary = parser.summary();

    println!("Lines: {}", summary.line_count);
    let build = &summary.build_info;
    if !build.build_name.is_empty() {
        println!("Build: {}", build.build_name);
    }
    if !build.branch.is_empty() {
        println!("Branch: {}", build.branch);
    }
    if build.changelist > 0 {
        println!("Changelist: {}", build.changelist);
    }
    if !build.configuration.is_empty() {
        println!("Configuration: {}", build.configuration);
    }
    let platform = &summary.platform_info;
    if !platform.os.is_empty() {
        println!("Platform: {} / {} / {}", platform.os, platform.cpu, platform.gpu);
    }

    println!("Warnings: {}", summary.warnings.len());
    println!("Errors: {}", summary.errors.len());
    println!("Ensures: {}", summary.ensures.len());
    println!("Requested exit: {}", summary.requested_exit);
    match summary.test_exit_code {
        Some(0) => println!("Test exit code: {}", "0".green()),
        Some(code) => println!("Test exit code: {}", code.to_string().red()),
        None => println!("Test exit code: none"),
    }

    if let Some(fatal) = &summary.fatal_error {
        println!("{} {}", "Fatal error:".red().bold(), fatal.message);
        if callstacks {
            print_callstack(fatal);
        }
    }

    if callstacks {
        for ensure in &summary.ensures {
            println!("{} {}", "Ensure:".yellow(), ensure.message);
            print_callstack(ensure);
        }
    }
}

fn print_callstack(trace: &CallstackMessage) {
    if trace.callstack.is_empty() {
        println!("    {}", "(no callstack)".dimmed());
        return;
    }
    for frame in &trace.callstack {
        println!("    {}", frame.dimmed());
    }
}
