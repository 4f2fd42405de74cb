//! Policy preview command
//!
//! Resolves the snapshot policy and prints the partition without taking
//! any snapshots, so an operator can see what a run would touch.

use crate::output::{self, OutputFormat};
use anyhow::Result;
use rollsnap_common::USERPROP_NAME;
use rollsnap_engine::policy;
use rollsnap_engine::ZfsCli;
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct PolicyEntry {
    dataset: String,
    mode: String,
}

pub async fn run(zfs: &ZfsCli, label: &str, output_format: &str) -> Result<()> {
    let (single_list, recursive_list) = policy::resolve(zfs, label, USERPROP_NAME).await?;

    let rows: Vec<PolicyEntry> = single_list
        .into_iter()
        .map(|dataset| PolicyEntry {
            dataset,
            mode: "single".to_string(),
        })
        .chain(recursive_list.into_iter().map(|dataset| PolicyEntry {
            dataset,
            mode: "recursive".to_string(),
        }))
        .collect();

    output::print_output(rows, OutputFormat::from_str(output_format))
}
