//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use mnemos::config::MnemosConfig;
use mnemos::db;
use mnemos::runtime::Runtime;

/// Run database diagnostics and print a health report.
pub fn doctor(config: MnemosConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `mnemos enqueue` or `mnemos work` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let runtime = Runtime::open(config).context("failed to open database (may be corrupt)")?;
    let report = {
        let conn = runtime.pool().get_connection()?;
        db::check_database_health(&conn).context("failed to run health check")?
    };
    let pool = runtime.pool().status();

    println!("Mnemos Health Report");
    println!("====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("Pool size:         {} (open: {})", pool.size, pool.created);
    println!();
    println!("Row counts:");
    println!("  Queue entries:   {}", report.queue_rows);
    println!("  Breakers:        {}", report.breaker_rows);
    println!("  References:      {}", report.reference_rows);
    println!("  Events:          {}", report.event_rows);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop any running `mnemos work --daemon` processes");
        println!("  2. Restore from a backup: cp backup.db ~/.mnemos/memory.db");
    }

    runtime.shutdown();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
