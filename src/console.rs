//! Headless console front end: command parsing and a printing `ResultSink`.

use image::RgbImage;
use log::trace;

use crate::core::analysis::AnalysisResult;
use crate::core::capture::CapturedImage;
use crate::core::events::{AuthInfo, LogLine, ResultSink};

pub const HELP: &str = "\
Commands:
  login               log in with the configured email/password
  logout              forget the current credential
  stream              start the camera stream (again to stop)
  stop                stop the camera stream
  capture             take a snapshot from the camera
  analyze             send the last snapshot for analysis
  url                 print the stored image URL of the last analysis
  status              show connection and stream state
  ip <addr>           set camera IP
  api <url>           set API base URL
  email <addr>        set login email
  password <secret>   set login password
  view <W>x<H>        set the display viewport size
  save                write settings to disk
  help                this text
  quit                exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    CameraIp,
    ApiUrl,
    Email,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login,
    Logout,
    Stream,
    Stop,
    Capture,
    Analyze,
    Url,
    Status,
    Set(Setting, String),
    Viewport(u32, u32),
    Save,
    Help,
    Quit,
}

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };

    let setting = |which: Setting| {
        if rest.is_empty() {
            Err(format!("usage: {} <value>", word))
        } else {
            Ok(Some(Command::Set(which, rest.to_string())))
        }
    };

    match word.to_ascii_lowercase().as_str() {
        "login" => Ok(Some(Command::Login)),
        "logout" => Ok(Some(Command::Logout)),
        "stream" | "start" => Ok(Some(Command::Stream)),
        "stop" => Ok(Some(Command::Stop)),
        "capture" | "c" => Ok(Some(Command::Capture)),
        "analyze" | "analyse" | "a" => Ok(Some(Command::Analyze)),
        "url" => Ok(Some(Command::Url)),
        "status" => Ok(Some(Command::Status)),
        "ip" => setting(Setting::CameraIp),
        "api" => setting(Setting::ApiUrl),
        "email" => setting(Setting::Email),
        "password" => setting(Setting::Password),
        "view" => parse_size(rest)
            .map(|(w, h)| Some(Command::Viewport(w, h)))
            .ok_or_else(|| "usage: view <W>x<H>".to_string()),
        "save" => Ok(Some(Command::Save)),
        "help" | "?" => Ok(Some(Command::Help)),
        "quit" | "exit" | "q" => Ok(Some(Command::Quit)),
        other => Err(format!("unknown command '{}' (try 'help')", other)),
    }
}

fn parse_size(text: &str) -> Option<(u32, u32)> {
    let (w, h) = text.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// ASCII gauge, e.g. `[#####...............]  25%`
pub fn gauge(percent: f64) -> String {
    const WIDTH: usize = 20;
    let percent = percent.clamp(0.0, 100.0);
    let filled = ((percent / 100.0) * WIDTH as f64).round() as usize;
    format!("[{}{}] {:>3.0}%", "#".repeat(filled), ".".repeat(WIDTH - filled), percent)
}

fn amount(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1} {}", v, unit),
        None => "--".to_string(),
    }
}

/// Prints everything to stdout
#[derive(Default)]
pub struct ConsoleSink {
    frames: u64,
    last_frame: Option<(u32, u32)>,
    last_result: Option<AnalysisResult>,
    auth: Option<AuthInfo>,
    last_status: String,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_frame_size(&self) -> Option<(u32, u32)> {
        self.last_frame
    }

    pub fn last_result(&self) -> Option<&AnalysisResult> {
        self.last_result.as_ref()
    }

    pub fn auth(&self) -> Option<&AuthInfo> {
        self.auth.as_ref()
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    /// Multi-line report of an analysis result
    pub fn render_result(result: &AnalysisResult) -> String {
        let share = result.daily_share();
        let mut out = format!("Food: {}\n", result.food_name);
        out.push_str(&format!("  Calories  {:>12}  {}\n", amount(result.calories, "kcal"), gauge(share.calories)));
        out.push_str(&format!("  Protein   {:>12}  {}\n", amount(result.protein_grams, "g"), gauge(share.protein)));
        out.push_str(&format!("  Carbs     {:>12}  {}\n", amount(result.carb_grams, "g"), gauge(share.carbs)));
        out.push_str(&format!("  Fat       {:>12}  {}", amount(result.fat_grams, "g"), gauge(share.fat)));
        out
    }
}

impl ResultSink for ConsoleSink {
    fn on_frame(&mut self, image: &RgbImage) {
        self.frames += 1;
        self.last_frame = Some(image.dimensions());
        trace!("Frame #{} {}x{}", self.frames, image.width(), image.height());
    }

    fn on_capture(&mut self, image: &CapturedImage) {
        let preview = match image.decode() {
            Ok(img) => format!("{}x{}", img.width(), img.height()),
            Err(_) => "undecodable".to_string(),
        };
        println!(
            "Captured {:.1} KB ({}, {}) at {}",
            image.size_kb(),
            image.mime_type(),
            preview,
            image.captured_at().format("%H:%M:%S")
        );
    }

    fn on_analysis_result(&mut self, result: &AnalysisResult) {
        println!("{}", Self::render_result(result));
        self.last_result = Some(result.clone());
    }

    fn on_status(&mut self, text: &str) {
        if text != self.last_status {
            println!("* {}", text);
            self.last_status = text.to_string();
        }
    }

    fn on_log(&mut self, line: &LogLine) {
        println!("{}", line);
    }

    fn on_auth(&mut self, auth: Option<&AuthInfo>) {
        match auth {
            Some(info) if info.session_based => println!("Logged in as {} (session)", info.identity.display_name),
            Some(info) => println!("Logged in as {}", info.identity.display_name),
            None => println!("Not logged in"),
        }
        self.auth = auth.cloned();
    }

    fn on_analysis_cleared(&mut self) {
        self.last_result = None;
    }
}
