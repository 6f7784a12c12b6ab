use anyhow::Result;
use clap::Subcommand;

use mnemos::breaker::BreakerPolicy;
use mnemos::config::MnemosConfig;
use mnemos::runtime::Runtime;

#[derive(Subcommand)]
pub enum BreakerAction {
    /// Show the persisted state of every breaker
    Status,
    /// Force a breaker closed and clear its failure count
    Reset { name: String },
}

pub fn run(config: MnemosConfig, action: BreakerAction) -> Result<()> {
    let policy = BreakerPolicy::from(&config.breaker);
    let runtime = Runtime::open(config)?;

    match action {
        BreakerAction::Status => {
            let statuses = runtime.breakers().stored_statuses()?;
            if statuses.is_empty() {
                println!("No circuit breakers have recorded state.");
            }
            for status in statuses {
                println!("{}", status.name);
                println!("  State:               {}", status.state);
                println!("  Failures:            {}", status.failure_count);
                if let Some(ref at) = status.last_failure_at {
                    println!("  Last failure:        {at}");
                }
                if let Some(ref at) = status.opened_at {
                    println!("  Opened at:           {at}");
                }
            }
        }
        BreakerAction::Reset { name } => {
            runtime.breakers().reset(&name, policy)?;
            println!("Breaker {name} reset to closed");
        }
    }

    runtime.shutdown();
    Ok(())
}
