use std::path::PathBuf;

use anyhow::{Context, Result};

use ferry::app::App;
use ferry::config::Config;
use ferry::transport::slack::SlackTransport;
use ferry::{logging, terminal};

fn config_path_from_args(args: &[String]) -> PathBuf {
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" || args[i] == "-c" {
            if i + 1 < args.len() {
                return PathBuf::from(&args[i + 1]);
            }
            break;
        }
        i += 1;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ferry").join("ferry.yaml")
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = config_path_from_args(&args);

    let config = Config::load(&config_path).with_context(|| {
        format!(
            "could not load configuration from {} (pass --config <path> to override)",
            config_path.display()
        )
    })?;
    config.validate()?;
    logging::init(&config.log_level);

    terminal::print_banner(env!("CARGO_PKG_VERSION"));
    terminal::print_info(&format!("config: {}", config_path.display()));
    terminal::print_info(&format!(
        "{} project(s) configured, data dir {}",
        config.projects.len(),
        config.data_dir.display()
    ));

    let transport = SlackTransport::new(&config.slack);
    let inbound = transport.spawn_poller(config.slack.channel_id.clone());

    let app = App::build(config, transport)?;
    terminal::print_success("connected; watching the channel");
    app.run(inbound).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    terminal::print_goodbye();
}
