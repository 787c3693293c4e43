use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Log to the console and to `<who>.log` in `datadir`.
/// `RUST_LOG` takes precedence over `level_arg`.
pub fn setup_logging<P: AsRef<Path>>(datadir: P, who: &str, level_arg: &str) -> Result<()> {
    let level = log_level(env::var("RUST_LOG").ok().as_deref(), level_arg)?;

    // file
    let who_clone = who.to_string();
    let logfile = datadir.as_ref().join(format!("{}.log", who));
    let file_config = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}/{} {}] {}",
                tstamp(),
                who_clone,
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .level_for("hyper", LevelFilter::Info)
        .level_for("reqwest", LevelFilter::Info)
        .chain(
            fern::log_file(&logfile)
                .with_context(|| format!("open log file {}", logfile.display()))?,
        );

    // console
    let who_clone = who.to_string();
    let colors = ColoredLevelConfig::new().info(Color::Green).error(Color::Red).warn(Color::Yellow);
    let console_config = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}/{} {}] {}",
                tstamp(),
                who_clone,
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        .level(level)
        .level_for("hyper", LevelFilter::Info)
        .level_for("reqwest", LevelFilter::Info)
        .chain(std::io::stdout());

    fern::Dispatch::new()
        .chain(console_config)
        .chain(file_config)
        .apply()
        .context("logger already set")
}

fn log_level(env_level: Option<&str>, level_arg: &str) -> Result<LevelFilter> {
    let level = env_level.unwrap_or(level_arg);
    LevelFilter::from_str(level).with_context(|| format!("bad log level {}", level))
}

// UTC, local time lookups are unsound on some platforms
pub fn tstamp() -> String {
    use time::{macros::format_description, OffsetDateTime};

    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_level_wins() {
        assert_eq!(log_level(None, "info").unwrap(), LevelFilter::Info);
        assert_eq!(log_level(Some("trace"), "info").unwrap(), LevelFilter::Trace);
        assert!(log_level(None, "loud").is_err());
    }

    #[test]
    fn tstamp_shape() {
        let stamp = tstamp();
        assert_eq!(stamp.len(), "2024-01-01 00:00:00.000".len());
        assert_eq!(&stamp[10..11], " ");
    }

    #[test]
    fn logging_writes_the_log_file() {
        let tempdir = tempfile::TempDir::new().unwrap();
        setup_logging(tempdir.path(), "lnc-test", "info").unwrap();
        log::info!("hello");
        assert!(tempdir.path().join("lnc-test.log").exists());
    }
}
