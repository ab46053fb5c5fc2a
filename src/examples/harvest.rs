//! Run one harvest against the default sources and export a subscription.

use proxy_link_pool::{export_subscription, HarvestConfig, Harvester, RunOutcome};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // MAX_WORKERS, PROXY_TEST_TIMEOUT, MAX_TEST_COUNT and CHINA_PROXY_PROTOCOLS override these
    let config = HarvestConfig::builder()
        .max_test_count(50)
        .data_dir("data/china_proxies")
        .from_env()?
        .build();

    let harvester = Harvester::from_config(config)?;

    match harvester.run().await? {
        RunOutcome::NothingCollected => println!("Nothing collected, no previous proxies either."),
        RunOutcome::Completed(report) => {
            println!(
                "Tested {} of {} candidates: {} working, {} share links",
                report.tested,
                report.collected,
                report.working.len(),
                report.converted.len()
            );

            let records = harvester.store().all().await?;
            let dir = &harvester.config().data_dir;
            let written = export_subscription(
                &records,
                &dir.join("subscription.txt"),
                Some(&dir.join("subscription_base64.txt")),
                None,
            )?;
            println!("Subscription written with {} links", written);
        }
    }

    Ok(())
}
