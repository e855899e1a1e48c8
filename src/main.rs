use anyhow::Result;
use clap::Parser;
use dialflow::app::AppBuilder;
use dialflow::config::{Cli, Config};
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config = cli
        .conf
        .as_deref()
        .filter(|path| std::path::Path::new(path).exists())
        .map(|path| Config::load(path).expect("Failed to load config"))
        .unwrap_or_default();
    let config = match file_config.resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let app = AppBuilder::new().config(config).build()?;
    let cancel = app.cancel.clone();

    info!("starting dialflow");
    select! {
        result = app.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received CTRL+C, shutting down");
            cancel.cancel();
        }
    }
    Ok(())
}
