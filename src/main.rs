use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use testexplorer::data::{TestData, TestStats, TestStatus};
use testexplorer::framework::{self, TestFramework};
use testexplorer::{config, discovery, runner, Error, Result};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: testexplorer <discover|run [NAME...]|list|stats|reset>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let result = match args.get(1).map(|s| s.as_str()) {
        Some("discover") => discover().await,
        Some("run") => run(args[2..].to_vec()).await,
        Some("list") => list(),
        Some("stats") => stats(),
        Some("reset") => reset(),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        for detail in e.details() {
            eprintln!("  {}", detail);
        }
        std::process::exit(1);
    }
}

fn project_root() -> Result<PathBuf> {
    Ok(std::env::current_dir()?)
}

fn open_data(root: &Path) -> Result<Arc<TestData>> {
    Ok(Arc::new(TestData::open(config::data_dir(root))?))
}

fn load_frameworks(root: &Path, settings: &config::Settings) -> Result<Vec<Box<dyn TestFramework>>> {
    framework::from_settings(&settings.frameworks, root)
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}

fn print_stats(stats: &TestStats) {
    let counts: Vec<String> = TestStatus::ALL
        .iter()
        .filter(|s| stats.count(**s) > 0)
        .map(|s| format!("{} {}", stats.count(*s), s))
        .collect();
    println!("{} tests: {}", stats.total, counts.join(", "));
}

async fn discover() -> Result<()> {
    let root = project_root()?;
    let settings = config::resolve(Some(&root));
    let frameworks = load_frameworks(&root, &settings)?;
    let data = open_data(&root)?;

    let count = tokio::task::spawn_blocking(move || discovery::discover_tests(&data, &frameworks, settings.sort_tests))
        .await
        .map_err(join_error)??;
    println!("Discovered {} tests", count);
    Ok(())
}

async fn run(names: Vec<String>) -> Result<()> {
    let root = project_root()?;
    let settings = config::resolve(Some(&root));
    let frameworks = load_frameworks(&root, &settings)?;
    let data = open_data(&root)?;
    let selection = if names.is_empty() { vec![String::new()] } else { names };

    let worker = Arc::clone(&data);
    let mut handle = tokio::task::spawn_blocking(move || runner::run_tests(&worker, &frameworks, &selection));

    let mut interval = tokio::time::interval(Duration::from_millis(settings.refresh_interval_ms));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    let summary = loop {
        tokio::select! {
            result = &mut handle => break result.map_err(join_error)??,
            _ = interval.tick() => {
                let hints = data.poll_refresh();
                if !hints.is_empty() {
                    let stats = data.get_global_test_stats(false);
                    eprintln!(
                        "[{} running, {} queued] {} passed, {} failed",
                        stats.running, stats.queued, stats.passed, stats.failed + stats.crashed
                    );
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                data.stop_tests();
            }
        }
    };

    print_stats(&data.get_global_test_stats(false));
    if summary.stopped {
        println!("Run stopped after {:.1}s", summary.duration.as_secs_f64());
    }
    for framework in &summary.skipped_frameworks {
        eprintln!("warning: framework '{}' is not configured", framework);
    }
    for error in &summary.errors {
        eprintln!("error: {}", error);
    }
    Ok(())
}

fn list() -> Result<()> {
    let data = open_data(&project_root()?)?;
    data.get_test_list().for_each_leaf(|_, item| {
        println!("{:<8} {}", item.last_status.as_str(), item.full_name);
    });
    Ok(())
}

fn stats() -> Result<()> {
    let data = open_data(&project_root()?)?;
    let stats = data.get_global_test_stats(true);
    print_stats(&stats);
    if let Some(last_discovery) = data.get_last_discovery() {
        println!("Last discovery: {}", last_discovery.to_rfc3339());
    }
    if let Some(last_run) = stats.last_run {
        println!("Last run: {}", last_run.to_rfc3339());
    }
    Ok(())
}

fn reset() -> Result<()> {
    let data = open_data(&project_root()?)?;
    data.reset()?;
    println!("Test data cleared");
    Ok(())
}
