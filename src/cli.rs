use clap::Parser;
use std::path::PathBuf;

use crate::config::Settings;

// Build version with stack info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "HTTP:   reqwest 0.12 (blocking)\n",
    "Image:  image 0.25 (JPEG/PNG)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Camera-to-nutrition console client
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Camera IP address (stream on port 81, snapshots on port 80)
    #[arg(short = 'i', long = "camera-ip", value_name = "IP", env = "NUTRICAM_CAMERA_IP")]
    pub camera_ip: Option<String>,

    /// Nutrition service base URL
    #[arg(short = 'a', long = "api-url", value_name = "URL", env = "NUTRICAM_API_URL")]
    pub api_url: Option<String>,

    /// Login email
    #[arg(short = 'e', long = "email", value_name = "EMAIL", env = "NUTRICAM_EMAIL")]
    pub email: Option<String>,

    /// Login password (never saved to the settings file)
    #[arg(long = "password", value_name = "PASSWORD", env = "NUTRICAM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// MJPEG stream port
    #[arg(long = "stream-port", value_name = "PORT")]
    pub stream_port: Option<u16>,

    /// Log in right after startup
    #[arg(long = "login")]
    pub auto_login: bool,

    /// Start the camera stream right after startup
    #[arg(short = 's', long = "stream")]
    pub auto_stream: bool,

    /// Enable debug logging to file (default: nutricam.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Args {
    /// Overlay CLI/env values onto loaded settings
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(ip) = &self.camera_ip {
            settings.camera_ip = ip.clone();
        }
        if let Some(url) = &self.api_url {
            settings.api_url = url.clone();
        }
        if let Some(email) = &self.email {
            settings.email = email.clone();
        }
        if let Some(password) = &self.password {
            settings.password = password.clone();
        }
        if let Some(port) = self.stream_port {
            settings.stream_port = port;
        }
    }
}
