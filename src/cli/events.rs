use anyhow::Result;
use clap::Subcommand;

use mnemos::config::MnemosConfig;
use mnemos::events::EventType;
use mnemos::runtime::Runtime;

#[derive(Subcommand)]
pub enum EventsAction {
    /// Show the most recent events, newest first
    Recent {
        /// Only show events of this type (e.g. memory_created)
        #[arg(long = "type")]
        event_type: Option<EventType>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show event counts by type
    Stats,
}

pub fn run(config: MnemosConfig, action: EventsAction) -> Result<()> {
    let runtime = Runtime::open(config)?;
    let events = runtime.events();

    match action {
        EventsAction::Recent { event_type, limit } => {
            let recent = events.get_recent(event_type, limit)?;
            if recent.is_empty() {
                println!("No events recorded.");
            }
            for event in recent {
                println!(
                    "{:>6}  {}  {:<22} {}",
                    event.id, event.created_at, event.event_type.as_str(), event.payload
                );
            }
        }
        EventsAction::Stats => {
            let stats = events.get_stats()?;
            println!("Event Log");
            println!("{}", "=".repeat(40));
            println!("  Total events:        {}", stats.total);
            println!();
            println!("By Type:");
            for event_type in EventType::ALL {
                let count = stats.by_type.get(event_type.as_str()).copied().unwrap_or(0);
                println!("  {:<22} {}", event_type.as_str(), count);
            }
            if let Some(ref oldest) = stats.oldest {
                println!();
                println!("Oldest event:          {oldest}");
            }
            if let Some(ref newest) = stats.newest {
                println!("Newest event:          {newest}");
            }
        }
    }

    runtime.shutdown();
    Ok(())
}
