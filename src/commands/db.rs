//! `etlcore db`: read-only inspection of the Job Registry, integrations, and
//! dead-lettered messages, printed as an ascii table or (with `--csv`) as
//! machine-parseable CSV depending on what the caller asked for.

use std::fmt::Display;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use itertools::Itertools;
use uuid::Uuid;

use crate::config::Configuration;
use crate::db::models::catalog::CustomFieldCatalogEntry;
use crate::db::models::integration::Integration;
use crate::db::models::job::EtlJob;
use crate::db::{self, DbConnectionConfig};
use crate::queue::memory::{MemoryBroker, VisibilityTimeouts};
use crate::queue::{QueueBroker, QueueName};
use crate::tenant::TenantId;

pub async fn run(subcommand: &str, tenant_id_arg: Option<&str>, extra: &[&str], csv: bool, config: Configuration) -> Result<()> {
    let conn_cfg = DbConnectionConfig::new(config.database_url().clone());
    let pool = db::build_pool(&conn_cfg)?;

    match subcommand {
        "jobs" => jobs(pool, parse_tenant(tenant_id_arg)?, csv).await,
        "job" => {
            let job_id = extra.first().ok_or_else(|| anyhow!("job requires a job_id argument"))?;
            job(pool, parse_tenant(tenant_id_arg)?, job_id.parse()?, csv).await
        }
        "integrations" => integrations(pool, parse_tenant(tenant_id_arg)?, csv).await,
        "dead-letters" => dead_letters(tenant_id_arg.unwrap_or("extract"), config, csv).await,
        "custom-fields" => {
            let project = extra.first().ok_or_else(|| anyhow!("custom-fields requires a project_external_id argument"))?;
            custom_fields(pool, parse_tenant(tenant_id_arg)?, project, csv).await
        }
        other => Err(anyhow!("unknown db subcommand: {}", other)),
    }
}

fn parse_tenant(arg: Option<&str>) -> Result<TenantId> {
    let raw = arg.ok_or_else(|| anyhow!("this subcommand requires a tenant_id argument"))?;
    Ok(TenantId::new(raw.parse::<Uuid>()?))
}

async fn jobs(pool: db::DbPool, tenant: TenantId, csv: bool) -> Result<()> {
    let jobs = db::with_conn(pool, move |conn| EtlJob::list_for_tenant(conn, tenant)).await?;
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.job_id.to_string(),
                j.job_name.clone(),
                j.overall_status.clone(),
                j.active.to_string(),
                j.next_run.to_rfc3339(),
                j.retry_count.to_string(),
            ]
        })
        .collect();
    display_data(mk_header(vec!["job_id", "name", "status", "active", "next_run", "retries"]), rows, csv)
}

async fn job(pool: db::DbPool, tenant: TenantId, job_id: Uuid, csv: bool) -> Result<()> {
    let job = db::with_conn(pool, move |conn| EtlJob::find(conn, tenant, job_id)).await?;
    let plan = job.step_plan()?;
    let watermarks = job.watermarks()?;

    let rows: Vec<Vec<String>> = plan
        .iter()
        .map(|step| {
            vec![
                step.name.0.clone(),
                step.order.to_string(),
                format!("{:?}", step.extraction),
                format!("{:?}", step.transform),
                format!("{:?}", step.embedding),
                watermarks.get(&step.name).map(|w| w.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    display_data(
        mk_header(vec!["step", "order", "extract", "transform", "embed", "watermark"]),
        rows,
        csv,
    )
}

async fn integrations(pool: db::DbPool, tenant: TenantId, csv: bool) -> Result<()> {
    let integrations = db::with_conn(pool, move |conn| Integration::list_for_tenant(conn, tenant)).await?;
    let rows: Vec<Vec<String>> = integrations
        .iter()
        .map(|i| vec![i.integration_id.to_string(), i.provider.clone(), i.active.to_string()])
        .collect();
    display_data(mk_header(vec!["integration_id", "provider", "active"]), rows, csv)
}

async fn dead_letters(queue_name: &str, config: Configuration, csv: bool) -> Result<()> {
    let queue: QueueName = queue_name.parse()?;
    // `db dead-letters` talks to a broker instance of its own; see the
    // worker-kind non-goal in the broker's deployment notes for why this
    // command cannot see another process's in-memory queues.
    let broker = Arc::new(MemoryBroker::new(
        VisibilityTimeouts {
            extract: config.visibility_timeout_extract(),
            transform: config.visibility_timeout_transform(),
            embed: config.visibility_timeout_embed(),
        },
        config.max_retries(),
    ));
    let envelopes = broker.dead_letters(queue).await?;
    let rows: Vec<Vec<String>> = envelopes
        .iter()
        .enumerate()
        .map(|(i, e)| vec![i.to_string(), e.tenant_id.to_string(), e.job_id.to_string(), e.step_name.clone(), e.attempt.to_string()])
        .collect();
    display_data(mk_header(vec!["index", "tenant_id", "job_id", "step", "attempts"]), rows, csv)
}

async fn custom_fields(pool: db::DbPool, tenant: TenantId, project_external_id: &str, csv: bool) -> Result<()> {
    let project = project_external_id.to_string();
    let entries = db::with_conn(pool, move |conn| CustomFieldCatalogEntry::list_for_project(conn, tenant, &project)).await?;
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| vec![e.source_field_id.clone(), e.display_name.clone(), e.active.to_string(), e.last_seen_at.to_rfc3339()])
        .collect();
    display_data(mk_header(vec!["source_field_id", "display_name", "active", "last_seen_at"]), rows, csv)
}

fn mk_header(names: Vec<&str>) -> Vec<ascii_table::Column> {
    names
        .into_iter()
        .map(|name| {
            let mut column = ascii_table::Column::default();
            column.header = name.into();
            column.align = ascii_table::Align::Left;
            column
        })
        .collect()
}

/// Print as an ascii table, or as CSV if asked, or one row per line if
/// stdout is not a tty (so piping into other tools stays sane).
fn display_data<D: Display>(headers: Vec<ascii_table::Column>, data: Vec<Vec<D>>, csv: bool) -> Result<()> {
    use std::io::Write;

    if csv {
        let mut wtr = ::csv::WriterBuilder::new().from_writer(vec![]);
        for record in data.into_iter() {
            let r: Vec<String> = record.into_iter().map(|e| e.to_string()).collect();
            wtr.write_record(&r)?;
        }

        let out = std::io::stdout();
        let mut lock = out.lock();
        let bytes = wtr.into_inner().map_err(|e| anyhow!("{}", e))?;
        let text = String::from_utf8(bytes)?;
        writeln!(lock, "{}", text)?;
        return Ok(());
    }

    if atty::is(atty::Stream::Stdout) {
        let mut ascii_table = ascii_table::AsciiTable::default();
        ascii_table.max_width = terminal_size::terminal_size().map(|tpl| tpl.0 .0 as usize).unwrap_or(80);
        headers.into_iter().enumerate().for_each(|(i, c)| {
            ascii_table.columns.insert(i, c);
        });
        ascii_table.print(data);
    } else {
        let out = std::io::stdout();
        let mut lock = out.lock();
        for row in data {
            writeln!(lock, "{}", row.iter().map(|d| d.to_string()).join(" "))?;
        }
    }
    Ok(())
}
