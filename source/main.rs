use clap::Parser as _;
use imaproxy::config::Config;
use std::path::Path;

#[derive(clap::Parser)]
struct Cli {
  #[clap(flatten)]
  config: Config,
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
  let pattern = if config.use_colors {
    "{d(%F %T)} {h({l})} {t} - {m}{n}"
  } else {
    "{d(%F %T)} {l} {t} - {m}{n}"
  };
  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new(pattern));

  let console = log4rs::config::Appender::builder()
    .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
      config.verbose.log_level_filter(),
    )))
    .build(
      "console",
      Box::new(
        log4rs::append::console::ConsoleAppender::builder()
          .encoder(encoder.clone())
          .build(),
      ),
    );

  let mut builder = log4rs::config::Config::builder().appender(console);
  let mut root_appenders = vec!["console"];

  if let Some(directory) = &config.log_directory {
    builder = builder.appender(
      log4rs::config::Appender::builder()
        .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
          log::LevelFilter::Trace,
        )))
        .build(
          "file",
          Box::new(
            log4rs::append::file::FileAppender::builder()
              .encoder(encoder)
              .build(Path::new(directory).join("imaproxy.log"))?,
          ),
        ),
    );
    root_appenders.push("file");
  }

  log4rs::init_config(builder.build(
    log4rs::config::Root::builder()
      .appenders(root_appenders)
      .build(log::LevelFilter::Trace),
  )?)?;
  Ok(())
}

fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  init_logging(&cli.config)?;
  imaproxy::run(&cli.config)
}
