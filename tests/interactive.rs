#![cfg(feature = "chromium")]

use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use catalog_scraper::{
    ProxyPool,
    ProxyProbe,
    ScrapeOrchestratorBuilder,
    ScrapeSettings,
    ScrapeTarget,
    StealthProvider,
    VERSION,
};
use tokio::runtime::Runtime;

fn prompt(label: &str) -> io::Result<String> {
    print!("{} ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_bool(input: &str, default: bool) -> bool {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => true,
        "n" | "no" | "false" => false,
        _ => default,
    }
}

fn parse_secs(input: &str, default: u64) -> Duration {
    Duration::from_secs(input.trim().parse().ok().filter(|v| *v > 0).unwrap_or(default))
}

#[test]
#[ignore = "Requires a local Chromium, network access and manual input"]
fn interactive_live_scrape() -> Result<(), Box<dyn Error>> {
    println!("catalog-scraper {} interactive smoke test", VERSION);
    println!("Settings come from the environment; prompts override a few of them.\n");

    let mut settings = ScrapeSettings::from_env()?;

    let url = prompt("Store URL:")?;
    if url.is_empty() {
        println!("No URL given, nothing to do.");
        return Ok(());
    }
    let target_answer = prompt("Target (menu / shop_info / all) [all]:")?;
    let headful_answer = prompt("Show the browser window? (y/N):")?;
    let probe_answer = prompt("Probe proxies before scraping? (y/N):")?;
    let overall_answer = prompt("Overall timeout in seconds [60]:")?;

    settings.headless = !parse_bool(&headful_answer, false);
    settings.overall_timeout = parse_secs(&overall_answer, 60);
    settings.validate()?;

    let target = match target_answer.as_str() {
        "menu" => ScrapeTarget::menu(),
        "shop_info" => ScrapeTarget::shop_info(),
        _ => ScrapeTarget::shop_all(),
    };

    let runtime = Runtime::new()?;
    let pool = Arc::new(settings.build_pool()?);
    println!("Loaded {} proxies ({:?} rotation)", pool.len(), pool.strategy());

    if parse_bool(&probe_answer, false) && !pool.is_empty() {
        probe_pool(&runtime, &pool)?;
    }

    let profile = StealthProvider::new().random_profile();
    println!(
        "Sample stealth profile -> {} {}x{} ({})",
        profile.name, profile.viewport.width, profile.viewport.height, profile.timezone
    );

    let orchestrator = ScrapeOrchestratorBuilder::from_settings(&settings)?
        .with_pool(Arc::clone(&pool))
        .build()?;

    println!("\nScraping {}...", url);
    let report = runtime.block_on(orchestrator.run(&url, &target))?;
    println!(
        "Finished in {:.1}s via {} (dom fallback: {})",
        report.elapsed.as_secs_f64(),
        report.proxy.as_deref().unwrap_or("direct"),
        report.dom_fallback_used
    );
    for (key, outcome) in &report.outcomes {
        match outcome.as_failure() {
            None => println!("  {key}: ok"),
            Some(failure) => println!("  {key}: {} ({})", failure.kind, failure.message),
        }
    }

    let body = serde_json::to_string_pretty(&report.to_json())?;
    let snippet: String = body.chars().take(800).collect();
    println!("Report preview (first 800 chars):\n{}\n", snippet);

    if let Some(metrics) = orchestrator.metrics() {
        let snapshot = metrics.snapshot();
        println!(
            "Metrics -> runs: {}, successes: {}, failures: {}",
            snapshot.global.total_runs, snapshot.global.successes, snapshot.global.failures
        );
    }
    let stats = pool.stats();
    println!("Pool after run -> {:?}", stats);

    println!("Interactive test complete. Re-run with different inputs as needed.");
    Ok(())
}

fn probe_pool(runtime: &Runtime, pool: &ProxyPool) -> Result<(), Box<dyn Error>> {
    println!("\n--- Probing proxies ---");
    let probe = ProxyProbe::new().with_timeout(Duration::from_secs(10));
    for (endpoint, result) in runtime.block_on(probe.verify_pool(pool)) {
        match result {
            Ok(report) => println!(
                "{} -> ok in {:?}, egress {}",
                endpoint,
                report.latency,
                report.origin.as_deref().unwrap_or("unknown")
            ),
            Err(err) => println!("{} -> failed: {}", endpoint, err),
        }
    }
    println!("--- Probe complete ---\n");
    Ok(())
}
