use std::env;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" && cmd != "sync-venues" {
        eprintln!("Usage: courier serve --config <path>\n       courier sync-venues --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match courier_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if cmd == "sync-venues" {
        match courier_server::run_venue_sync(cfg).await {
            Ok(count) => println!("synced {count} venues"),
            Err(e) => {
                eprintln!("venue sync failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = courier_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}
