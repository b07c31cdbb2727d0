use nutricam::cli::Args;
use nutricam::config::{self, PathConfig, Settings};
use nutricam::console::{self, Command, ConsoleSink, Setting};
use nutricam::core::workers::spawn_task;
use nutricam::core::{Dispatch, Orchestrator, ResultSink};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{select, unbounded, Receiver};
use log::{debug, info, warn};
use std::io::BufRead;

fn init_logging(args: &Args, path_config: &PathConfig) -> anyhow::Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| path_config.data_file(config::LOG_FILE));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .filter_module("reqwest", log::LevelFilter::Warn)
            .filter_module("hyper", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("reqwest", log::LevelFilter::Warn)
            .filter_module("hyper", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Forward stdin lines until EOF
fn spawn_stdin_reader() -> anyhow::Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    spawn_task("nutricam-stdin", move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    })?;
    Ok(rx)
}

fn report(dispatch: anyhow::Result<Dispatch>) {
    if let Err(e) = dispatch {
        eprintln!("Error: {:#}", e);
    }
}

fn print_status(orc: &Orchestrator, sink: &ConsoleSink) {
    let settings = orc.settings();
    println!("Camera:   {} (stream port {})", settings.camera_ip, settings.stream_port);
    println!("API:      {}", settings.api_url);
    match sink.auth() {
        Some(info) => println!(
            "User:     {}{}",
            info.identity.display_name,
            if info.session_based { " (session)" } else { "" }
        ),
        None => println!("User:     not logged in"),
    }
    match sink.last_frame_size() {
        Some((w, h)) => println!("Stream:   {} ({} frames, last {}x{})", orc.stream_state(), sink.frames(), w, h),
        None => println!("Stream:   {}", orc.stream_state()),
    }
    println!("Capture:  {}", if orc.has_capture() { "ready" } else { "none" });
    if orc.analysis_in_progress() {
        println!("Analysis: in progress");
    }
}

/// Returns false when the loop should end
fn handle_command(
    command: Command,
    orc: &Orchestrator,
    sink: &mut ConsoleSink,
    path_config: &PathConfig,
) -> bool {
    match command {
        Command::Login => report(orc.login()),
        Command::Logout => {
            if !orc.logout() {
                println!("Not logged in");
            }
        }
        Command::Stream => {
            if let Err(e) = orc.toggle_stream() {
                eprintln!("Error: {:#}", e);
            }
        }
        Command::Stop => {
            if !orc.stop_stream() {
                println!("Stream is not running");
            }
        }
        Command::Capture => report(orc.capture()),
        Command::Analyze => report(orc.analyze()),
        Command::Url => match sink.last_result().and_then(|r| r.image_url.as_deref()) {
            Some(url) => println!("{}", url),
            None => println!("No image URL available"),
        },
        Command::Status => print_status(orc, sink),
        Command::Set(which, value) => {
            orc.update_settings(|s| match which {
                Setting::CameraIp => s.camera_ip = value,
                Setting::ApiUrl => s.api_url = value,
                Setting::Email => s.email = value,
                Setting::Password => s.password = value,
            });
            println!("OK");
        }
        Command::Viewport(w, h) => {
            orc.viewport().set(w, h);
            println!("Viewport {}x{}", w, h);
        }
        Command::Save => {
            let path = path_config.settings_file();
            match orc.settings().save(&path) {
                Ok(()) => println!("Settings saved to {}", path.display()),
                Err(e) => eprintln!("Error: {:#}", e),
            }
        }
        Command::Help => println!("{}", console::HELP),
        Command::Quit => return false,
    }
    true
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = path_config.ensure_dirs() {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    info!("nutricam {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let settings_path = path_config.settings_file();
    info!("Config path: {}", settings_path.display());
    let mut settings = match Settings::load(&settings_path) {
        Ok(s) => s,
        Err(e) => {
            warn!("{:#}; using defaults", e);
            Settings::default()
        }
    };
    args.apply_to(&mut settings);
    debug!("Effective settings: {:?}", settings);

    let orc = Orchestrator::new(settings)?;
    let mut sink = ConsoleSink::new();
    let commands = spawn_stdin_reader()?;

    println!("nutricam {} - type 'help' for commands", env!("CARGO_PKG_VERSION"));
    if args.auto_login {
        report(orc.login());
    }
    if args.auto_stream {
        if let Err(e) = orc.start_stream() {
            eprintln!("Error: {:#}", e);
        }
    }

    loop {
        select! {
            recv(commands) -> line => {
                let Ok(line) = line else {
                    info!("stdin closed");
                    break;
                };
                match console::parse_command(&line) {
                    Ok(Some(command)) => {
                        if !handle_command(command, &orc, &mut sink, &path_config) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{}", msg),
                }
            }
            recv(orc.events()) -> event => {
                if let Ok(event) = event {
                    orc.dispatch(event, &mut sink as &mut dyn ResultSink);
                }
            }
        }
    }

    info!("Shutting down...");
    orc.shutdown();
    orc.pump(&mut sink);
    Ok(())
}
