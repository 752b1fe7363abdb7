//! Ls command implementation

use crate::commands::shared::{CommandContext, GlobalArgs};
use anyhow::Result;
use sail_core::docker::Docker;
use sail_core::labels::{self, PROXY_URL};
use tracing::{debug, instrument};

/// Ls command arguments
#[derive(Debug, Clone)]
pub struct LsArgs {
    pub all: bool,
    pub globals: GlobalArgs,
}

/// One row of `sail ls`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRow {
    pub name: String,
    pub url: String,
    pub status: String,
}

/// Containers carrying the sail marker label
pub async fn list_environments(docker: &dyn Docker, all: bool) -> Result<Vec<EnvironmentRow>> {
    let mut rows = Vec::new();
    for listed in docker
        .list_containers(Some(&labels::marker_filter()), all)
        .await?
    {
        // List output has no labels.
        let Some(info) = docker.inspect_container(&listed.name).await? else {
            debug!("{} disappeared while listing", listed.name);
            continue;
        };
        rows.push(EnvironmentRow {
            url: info.labels.get(PROXY_URL).cloned().unwrap_or_default(),
            status: info.state.clone(),
            name: info.name,
        });
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rows)
}

/// Left-aligned `name  url  status` table with a header row
pub fn render(rows: &[EnvironmentRow]) -> String {
    let header = EnvironmentRow {
        name: "name".to_string(),
        url: "url".to_string(),
        status: "status".to_string(),
    };
    let all: Vec<&EnvironmentRow> = std::iter::once(&header).chain(rows).collect();
    let name_width = all.iter().map(|r| r.name.len()).max().unwrap_or(0);
    let url_width = all.iter().map(|r| r.url.len()).max().unwrap_or(0);

    let mut out = String::new();
    for row in all {
        out.push_str(&format!(
            "{:name_width$}  {:url_width$}  {}\n",
            row.name,
            row.url,
            row.status,
            name_width = name_width,
            url_width = url_width
        ));
    }
    out
}

/// Execute the ls command
#[instrument(skip(args))]
pub async fn execute_ls(args: LsArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;
    let rows = list_environments(&ctx.docker, args.all).await?;
    print!("{}", render(&rows));
    Ok(())
}
