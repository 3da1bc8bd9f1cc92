//! Run server detection for a few addresses and print each step
//!
//! Usage: `cargo run --example detect -- user@example.com example.org`

use owlivion_discovery::{DetectionReport, Detector, DiscoveryConfig, TierOutcome};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match DiscoveryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    let detector = match Detector::with_defaults(config) {
        Ok(detector) => detector,
        Err(e) => {
            eprintln!("✗ Failed to initialize detector: {}", e);
            std::process::exit(2);
        }
    };

    let mut inputs: Vec<String> = std::env::args().skip(1).collect();
    if inputs.is_empty() {
        inputs = vec![
            "test@gmail.com".to_string(),
            "test@outlook.com".to_string(),
            "fastmail.com".to_string(),
            "test@unknowndomain99999.xyz".to_string(),
        ];
    }

    for input in inputs {
        println!("\n{}", "=".repeat(60));
        println!("Testing: {}", input);
        println!("{}", "=".repeat(60));

        let report = if input.contains('@') {
            detector.detect_with_report(&input).await
        } else {
            detector.probe_with_report(&input).await
        };
        print_report(&report);
    }
}

fn print_report(report: &DetectionReport) {
    match &report.domain {
        Some(domain) => println!("✓ Domain: {}", domain),
        None => {
            println!("✗ Invalid input");
            return;
        }
    }
    println!("✓ Total Duration: {}ms", report.total_duration_ms);
    println!();

    for (i, step) in report.steps.iter().enumerate() {
        let label = format!("{}. {}", i + 1, step.tier);
        match &step.outcome {
            TierOutcome::Hit => println!("✅ {}: SUCCESS ({}ms)", label, step.duration_ms),
            TierOutcome::NoResult => println!("⚠️  {}: NOT_FOUND ({}ms)", label, step.duration_ms),
            TierOutcome::Discarded => println!("⚠️  {}: INCOMPLETE ({}ms)", label, step.duration_ms),
            TierOutcome::Error(e) => println!("❌ {}: {} ({}ms)", label, e, step.duration_ms),
            TierOutcome::TimedOut => println!("❌ {}: TIMEOUT ({}ms)", label, step.duration_ms),
            TierOutcome::Skipped => println!("⏭ {}: Skipped", label),
        }
    }

    match &report.settings {
        Some(settings) => {
            println!();
            println!("Final Config:");
            println!("  Provider: {}", settings.display_name);
            println!("  Method: {:?}", settings.detection_method);
            println!(
                "  IMAP: {}:{} ({:?})",
                settings.imap_host, settings.imap_port, settings.imap_security
            );
            println!(
                "  SMTP: {}:{} ({:?})",
                settings.smtp_host, settings.smtp_port, settings.smtp_security
            );
        }
        None => println!("\nNo configuration found"),
    }
}
