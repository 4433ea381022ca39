use attach_rename_milter::config_store::ReloadOutcome;
use attach_rename_milter::{Config, ConfigStore, Disposition, Message, MessageInterceptor, Milter, MimeMessage};
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("attach-rename-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter that renames report attachments from mapped senders after the date in their subject")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/attach-rename-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and the mapping document")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Run a message file through the rewrite pipeline and print the result")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .value_name("ADDRESS")
                .help("Envelope sender to use with --test-email (default: From header)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/attach-rename-milter.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file, &matches);
        return;
    }

    if matches.get_flag("daemon") {
        #[cfg(unix)]
        if let Err(e) = attach_rename_milter::daemon::daemonize(&config.pid_file) {
            log::error!("Failed to daemonize: {e}");
            process::exit(1);
        }

        #[cfg(not(unix))]
        log::warn!("Daemon mode not supported on this platform, running in foreground");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        log::error!("Milter error: {e}");
        process::exit(1);
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(ConfigStore::new(&config.mapping_path));
    store.reload();

    // Dropping the watcher stops it, keep it for the lifetime of the milter
    let _watcher = if config.watch {
        match store.watch(config.watch_poll_interval()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Mapping document will not be watched: {e}");
                None
            }
        }
    } else {
        None
    };

    #[cfg(unix)]
    attach_rename_milter::milter::reload_on_hangup(store.clone())?;

    let interceptor = Arc::new(MessageInterceptor::new(store, config.rewrite_settings()));
    let milter = Milter::new(interceptor);
    milter.run(&config.socket_path).await?;

    log::info!("Shutdown complete");
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!("   Socket: {}", config.socket_path);
    println!("   Marker prefix: {}", config.marker_prefix);
    println!("   Date format: {}", config.date_format);
    println!("   Mapping document: {}", config.mapping_path);
    println!();

    let store = ConfigStore::new(&config.mapping_path);
    match store.reload() {
        ReloadOutcome::Accepted { entries } => {
            println!("✅ Mapping document accepted ({entries} entries)");
            let snapshot = store.current_snapshot();
            let mut pairs: Vec<_> = snapshot.iter().collect();
            pairs.sort();
            for (sender, target) in pairs {
                println!("   {sender} -> {target}");
            }
        }
        ReloadOutcome::Rejected(e) => {
            println!("❌ Mapping document rejected: {e}");
            process::exit(1);
        }
        ReloadOutcome::Skipped => println!("⚠️  Another reload was in progress, nothing checked"),
    }
}

fn test_email_file(config: &Config, email_file: &str, matches: &ArgMatches) {
    println!("🧪 Testing email file: {}", email_file);
    println!();

    let raw = match std::fs::read(email_file) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("❌ Error reading email file: {}", e);
            process::exit(1);
        }
    };

    let store = Arc::new(ConfigStore::new(&config.mapping_path));
    if let ReloadOutcome::Rejected(e) = store.reload() {
        eprintln!("⚠️  Mapping not loaded: {e}");
    }
    let interceptor = MessageInterceptor::new(store, config.rewrite_settings());

    let sender = matches
        .get_one::<String>("sender")
        .map(String::as_str)
        .unwrap_or_default();
    let mut message = match MimeMessage::parse(raw, sender) {
        Ok(message) => message,
        Err(e) => {
            eprintln!("❌ Error parsing email file: {}", e);
            process::exit(1);
        }
    };

    println!("📧 Email Details:");
    println!("   Sender: {}", message.sender());
    println!("   Subject: {}", message.subject());
    print_attachments(&message);
    println!();

    let disposition = interceptor.process(&mut message, || {});

    match &disposition {
        Disposition::Rewritten { target, .. } => {
            println!("✏️  Result: REWRITTEN (sender mapped to {target})");
            println!("   Subject: {}", message.subject());
            print_attachments(&message);
        }
        Disposition::Failed { error, .. } => {
            println!("❌ Result: FAILED ({error})");
            print_attachments(&message);
        }
        other => println!("✅ Result: UNCHANGED ({other:?})"),
    }
}

fn print_attachments(message: &MimeMessage) {
    for (index, name) in message.attachment_names().into_iter().enumerate() {
        println!("   Attachment {}: {}", index + 1, name.unwrap_or("(unnamed)"));
    }
}
