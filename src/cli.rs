use clap::{crate_authors, crate_version, Arg, ArgAction, Command};

/// `<version> (<git sha>, built <timestamp> for <target triple>)`, embedded by
/// `build.rs` via `vergen`. Shown on `--version`; the short form from
/// `crate_version!()` is used everywhere else (subcommand `--help`, etc.).
fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("VERGEN_GIT_SHA"),
        ", built ",
        env!("VERGEN_BUILD_TIMESTAMP"),
        " for ",
        env!("VERGEN_CARGO_TARGET_TRIPLE"),
        ")",
    )
}

pub fn cli() -> Command {
    Command::new("etlcore")
        .author(crate_authors!())
        .version(crate_version!())
        .long_version(long_version())
        .about("Multi-tenant ETL platform: queue-coordinated extract/transform/embed pipeline for developer-productivity sources")
        .subcommand_required(true)
        .arg_required_else_help(true)

        .subcommand(Command::new("serve")
            .about("Run the orchestrator, all worker loops, and the Control API in one process")
            .arg(Arg::new("migrate")
                .long("migrate")
                .action(ArgAction::SetTrue)
                .help("Run pending database migrations before starting")
            )
        )

        .subcommand(Command::new("worker")
            .about("Run a single worker class in isolation (for scaling one stage independently)")
            .arg(Arg::new("kind")
                .required(true)
                .index(1)
                .value_parser(["extract", "transform", "embed"])
                .help("Which worker loop to run")
            )
        )

        .subcommand(Command::new("db")
            .about("Inspect the Job Registry and Raw Store from the command line")
            .arg(Arg::new("csv")
                .long("csv")
                .action(ArgAction::SetTrue)
                .help("Print machine-parseable CSV instead of an ascii table")
            )
            .subcommand_required(true)
            .subcommand(Command::new("jobs")
                .about("List jobs for a tenant")
                .arg(Arg::new("tenant_id").required(true).index(1))
            )
            .subcommand(Command::new("job")
                .about("Show one job's step plan and watermarks")
                .arg(Arg::new("tenant_id").required(true).index(1))
                .arg(Arg::new("job_id").required(true).index(2))
            )
            .subcommand(Command::new("integrations")
                .about("List configured integrations for a tenant")
                .arg(Arg::new("tenant_id").required(true).index(1))
            )
            .subcommand(Command::new("dead-letters")
                .about("List dead-lettered messages on a queue")
                .arg(Arg::new("queue")
                    .required(true)
                    .index(1)
                    .value_parser(["extract", "transform", "embed"])
                )
            )
            .subcommand(Command::new("custom-fields")
                .about("List discovered Jira custom fields for a project")
                .arg(Arg::new("tenant_id").required(true).index(1))
                .arg(Arg::new("project_external_id").required(true).index(2))
            )
        )
}
