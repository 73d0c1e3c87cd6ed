use agenda::calendar::digest::Digest;
use agenda::calendar::fetch_day_events;
use agenda::calendar::ics::IcsFeedFetcher;
use agenda::commands::DayQuery;
use agenda::FeedsConfig;
use chrono::Utc;
use chrono_tz::Tz;
use clap::Parser;
use dotenv::dotenv;
use std::error::Error;

/// Fetches a calendar feed and prints the agenda of a single day.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// URL of the iCalendar feed
    url: String,

    /// Day to show: today, tomorrow or an offset in days
    #[arg(default_value = "today")]
    day: String,

    /// Timezone for day boundaries and displayed times
    #[arg(long, default_value = "CET")]
    timezone: Tz,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv().ok();

    let cli = Cli::parse();

    let today = Utc::now().with_timezone(&cli.timezone).date_naive();
    let day = DayQuery::parse(Some(&cli.day)).resolve(today)?;

    let fetcher = IcsFeedFetcher::new(&FeedsConfig::default(), cli.timezone)?;
    let events = fetch_day_events(&fetcher, &cli.url, day, cli.timezone).await?;

    for event in &events {
        log::debug!("{:?}", event);
    }

    print!("{}", Digest::new(day, &events));

    Ok(())
}
