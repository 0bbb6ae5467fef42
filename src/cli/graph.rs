use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use regex::Regex;
use rtm_engine::{
    EngineConfig, RequirementId, Table,
    domain::{CriticalPath, Cycle, DependencyGraph, GraphAnalysis},
};
use serde::Serialize;
use tracing::instrument;

use super::{OutputFormat, terminal::Colorize};

#[derive(Debug, Parser)]
#[command(about = "Show cycles, work order, critical path and ready work")]
pub struct Graph {
    /// The snapshot to analyse
    file: PathBuf,

    /// Only list ids matching this pattern
    #[arg(long, value_name = "REGEX")]
    filter: Option<Regex>,

    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Serialize)]
struct Summary {
    cycles: Vec<Cycle>,
    order: Option<Vec<RequirementId>>,
    critical_path: Option<CriticalPath>,
    ready: Vec<RequirementId>,
}

impl Graph {
    #[instrument(level = "debug", skip_all, fields(file = %self.file.display()))]
    pub fn run(self, config: &EngineConfig) -> anyhow::Result<()> {
        let summary = self.summarize(config)?;
        match self.output {
            OutputFormat::Table => print_table(&summary),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        }
        Ok(())
    }

    fn summarize(&self, config: &EngineConfig) -> anyhow::Result<Summary> {
        let table = Table::load(&self.file, config.id_delimiter)
            .with_context(|| format!("failed to read {}", self.file.display()))?;
        let records = table.records();

        let analysis = GraphAnalysis::run(records, &config.effort_column);
        let ready = DependencyGraph::build(records, &config.effort_column).ready();

        let keep = |ids: Vec<RequirementId>| -> Vec<RequirementId> {
            match &self.filter {
                Some(pattern) => ids
                    .into_iter()
                    .filter(|id| pattern.is_match(id.as_str()))
                    .collect(),
                None => ids,
            }
        };

        Ok(Summary {
            cycles: analysis.cycles,
            order: analysis.order.map(&keep),
            critical_path: analysis.critical_path,
            ready: keep(ready),
        })
    }
}

fn print_table(summary: &Summary) {
    if summary.cycles.is_empty() {
        println!("{}", "No cycles".success());
    } else {
        for cycle in &summary.cycles {
            println!("{}", format!("cycle {cycle}").failure());
        }
    }

    if let Some(order) = &summary.order {
        println!("\nOrder:");
        for (position, id) in order.iter().enumerate() {
            println!("  {:>3}. {id}", position + 1);
        }
    }

    if let Some(path) = &summary.critical_path {
        let ids: Vec<_> = path.ids.iter().map(RequirementId::as_str).collect();
        println!(
            "\nCritical path ({}): {}",
            path.total_effort,
            ids.join(" → ")
        );
    }

    if summary.ready.is_empty() {
        println!("\n{}", "Nothing ready".dim());
    } else {
        println!("\nReady:");
        for id in &summary.ready {
            println!("  {}", id.to_string().warning());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = "\
req_id,category,subcategory,requirement_text,status,priority,phase,dependencies,blocks
REQ-A-001,A,,first,COMPLETE,HIGH,1,,REQ-A-002
REQ-A-002,A,,second,MISSING,HIGH,1,REQ-A-001,REQ-B-001
REQ-B-001,B,,third,MISSING,LOW,2,REQ-A-002,
";

    fn graph(dir: &tempfile::TempDir, filter: Option<&str>) -> Graph {
        let file = dir.path().join("rtm.csv");
        std::fs::write(&file, SNAPSHOT).unwrap();
        Graph {
            file,
            filter: filter.map(|pattern| Regex::new(pattern).unwrap()),
            output: OutputFormat::Table,
        }
    }

    fn ids(ids: &[&str]) -> Vec<RequirementId> {
        ids.iter().map(|id| id.parse().unwrap()).collect()
    }

    #[test]
    fn chain_has_order_path_and_ready_work() {
        let dir = tempfile::tempdir().unwrap();
        let summary = graph(&dir, None)
            .summarize(&EngineConfig::default())
            .unwrap();

        assert!(summary.cycles.is_empty());
        assert_eq!(
            summary.order,
            Some(ids(&["REQ-A-001", "REQ-A-002", "REQ-B-001"]))
        );
        assert_eq!(
            summary.critical_path.unwrap().ids,
            ids(&["REQ-A-001", "REQ-A-002", "REQ-B-001"])
        );
        assert_eq!(summary.ready, ids(&["REQ-A-002"]));
    }

    #[test]
    fn filter_limits_listed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let summary = graph(&dir, Some("^REQ-B-"))
            .summarize(&EngineConfig::default())
            .unwrap();

        assert_eq!(summary.order, Some(ids(&["REQ-B-001"])));
        assert!(summary.ready.is_empty());
    }
}
