use anyhow::Result;
use clap::Subcommand;

use mnemos::config::MnemosConfig;
use mnemos::memory::references::RefType;
use mnemos::runtime::Runtime;

#[derive(Subcommand)]
pub enum RefsAction {
    /// Show reference counts for one memory
    Show { memory_id: String },
    /// List tracked memories with no remaining references
    Zero,
    /// Summarize reference counts across all memories
    Stats,
}

pub fn run(config: MnemosConfig, action: RefsAction) -> Result<()> {
    let runtime = Runtime::open(config)?;
    let references = runtime.references();

    match action {
        RefsAction::Show { memory_id } => {
            let counts = references.get_count(&memory_id)?;
            println!("References to {memory_id}");
            println!("{}", "=".repeat(40));
            for ref_type in RefType::ALL {
                println!("  {:<20} {}", ref_type.as_str(), counts.get(ref_type));
            }
            println!("  {:<20} {}", "total", counts.total);
            println!();
            println!(
                "Protected from archival: {}",
                if counts.total > 0 { "yes" } else { "no" }
            );
        }
        RefsAction::Zero => {
            let ids = references.get_zero_ref_memories()?;
            if ids.is_empty() {
                println!("No unreferenced memories.");
            }
            for id in ids {
                println!("{id}");
            }
        }
        RefsAction::Stats => {
            let summary = references.summary()?;
            println!("Reference Counts");
            println!("{}", "=".repeat(40));
            println!("  Tracked memories:    {}", summary.tracked_memories);
            println!("  Protected:           {}", summary.protected);
            println!("  Unreferenced:        {}", summary.unreferenced);
            println!();
            println!("By Type:");
            for (ref_type, count) in &summary.by_type {
                println!("  {:<20} {}", ref_type, count);
            }
        }
    }

    runtime.shutdown();
    Ok(())
}
