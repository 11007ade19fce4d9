//! Command-line interface.

use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use ticker_core::SchedulerTimeZone;
use ticker_core::generator::parse_expression;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "ticker-node")]
#[command(about = "Ticker - persistent time and cron job scheduler node")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run a scheduler node until Ctrl+C or SIGTERM.
    Run {
        /// Config file path, replacing `config/ticker.{toml,yaml}`.
        #[arg(short, long, env = "TICKER_CONFIG")]
        config: Option<PathBuf>,

        /// Node identity. Overrides `scheduler.node_id`.
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Print the next fire times of a 6-field cron expression.
    CronNext {
        /// Expression, e.g. "0 */15 * * * *". Quote it.
        expression: String,

        /// How many fire times to print.
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,

        /// Evaluate and print in UTC instead of local time.
        #[arg(long)]
        utc: bool,
    },
}

/// The next `count` fire times strictly after `now`.
///
/// Fails when the expression is malformed or can never fire.
pub fn cron_next(
    expression: &str,
    count: usize,
    zone: SchedulerTimeZone,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<DateTime<Utc>>> {
    let parsed = parse_expression(expression, now, zone)?;
    Ok(parsed.upcoming(&now, zone, count))
}

/// RFC 3339 in the zone the expression was evaluated in.
pub fn format_time(time: DateTime<Utc>, zone: SchedulerTimeZone) -> String {
    match zone {
        SchedulerTimeZone::Utc => time.to_rfc3339(),
        SchedulerTimeZone::Local => time.with_timezone(&Local).to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["ticker-node", "run", "--config", "ticker.toml", "--node-id", "n1"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Run {
                config: Some(PathBuf::from("ticker.toml")),
                node_id: Some("n1".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_cron_next() {
        let cli = Cli::try_parse_from(["ticker-node", "cron-next", "0 0 * * * *", "--count", "3", "--utc"]).unwrap();
        assert_eq!(
            cli.command,
            Command::CronNext {
                expression: "0 0 * * * *".to_string(),
                count: 3,
                utc: true,
            }
        );
        assert!(Cli::try_parse_from(["ticker-node"]).is_err());
    }

    #[test]
    fn test_cron_next_utc() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 10, 7, 30).unwrap();
        let times = cron_next("0 */15 * * * *", 3, SchedulerTimeZone::Utc, now).unwrap();
        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2025, 1, 1, 10, 15, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 1, 1, 10, 45, 0).unwrap(),
            ]
        );
        assert_eq!(format_time(times[0], SchedulerTimeZone::Utc), "2025-01-01T10:15:00+00:00");
    }

    #[test]
    fn test_cron_next_rejects_bad_expressions() {
        let now = Utc::now();
        assert!(cron_next("0 0 * * *", 1, SchedulerTimeZone::Utc, now).is_err());
        assert!(cron_next("0 0 0 30 2 *", 1, SchedulerTimeZone::Utc, now).is_err());
    }
}
