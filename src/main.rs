use anyhow::Result;
use tracing_subscriber::EnvFilter;

use etlcore::cli;
use etlcore::commands;
use etlcore::config::Configuration;

#[tokio::main]
async fn main() -> Result<()> {
    human_panic::setup_panic!();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli::cli().get_matches();
    let config = Configuration::load_from_env()?;

    match matches.subcommand() {
        Some(("serve", sub)) => {
            let migrate = sub.get_flag("migrate");
            commands::serve::run(migrate, config).await
        }
        Some(("worker", sub)) => {
            let kind = sub.get_one::<String>("kind").expect("kind is required");
            commands::worker::run(kind, config).await
        }
        Some(("db", sub)) => {
            let csv = sub.get_flag("csv");
            let (subcommand, args) = sub.subcommand().expect("db requires a subcommand");

            // `dead-letters` has no tenant_id argument; its single positional
            // (`queue`) is passed through the same slot `db::run` reads the
            // tenant_id from, since that is the only selector it needs.
            let tenant_id_arg = if subcommand == "dead-letters" {
                args.get_one::<String>("queue").map(String::as_str)
            } else {
                args.get_one::<String>("tenant_id").map(String::as_str)
            };
            let extra: Vec<&str> = match subcommand {
                "job" => args.get_one::<String>("job_id").map(String::as_str).into_iter().collect(),
                "custom-fields" => args
                    .get_one::<String>("project_external_id")
                    .map(String::as_str)
                    .into_iter()
                    .collect(),
                _ => Vec::new(),
            };
            commands::db::run(subcommand, tenant_id_arg, &extra, csv, config).await
        }
        _ => unreachable!("clap requires a subcommand"),
    }
}
