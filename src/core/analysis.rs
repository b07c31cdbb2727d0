//! Remote food analysis: image -> food name + nutrition estimate.
//!
//! # Single flight
//!
//! At most one analysis request runs at a time. [`AnalysisClient::try_acquire`]
//! hands out an [`AnalysisTicket`]; while a ticket is alive every other attempt
//! is rejected synchronously, before any network traffic. The ticket frees the
//! slot on drop, including when the worker panics.
//!
//! # Response shapes
//!
//! ```text
//! 200 {success:true,  data:{foodName, nutrition:{calories,proteins,carbs,fats}, imageUrl}}
//! 200 {success:false, error}
//! 401/403          -> AuthFailure (caller invalidates the session)
//! other status     -> ClientError(status, first 200 chars of body)
//! ```
//!
//! The downstream model call is slow, hence the 90 s timeout.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use log::{debug, info};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Deserializer, Serialize};

use super::capture::CapturedImage;
use super::outcome::RequestOutcome;
use super::session::{api_host, Credential};

/// Timeout for the analyze request
pub const ANALYZE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shown when the service does not name the food
pub const UNKNOWN_FOOD: &str = "Unknown";

/// Typed analysis result. Missing nutrients are `None` ("unknown"), not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub food_name: String,
    pub calories: Option<f64>,
    pub protein_grams: Option<f64>,
    pub carb_grams: Option<f64>,
    pub fat_grams: Option<f64>,
    /// Remote copy of the uploaded image, if the service stored one
    pub image_url: Option<String>,
}

/// 0..=100 gauge values relative to typical daily intake
/// (2000 kcal, 50 g protein, 300 g carbs, 70 g fat)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyShare {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

impl AnalysisResult {
    pub fn daily_share(&self) -> DailyShare {
        let gauge = |v: Option<f64>, scale: f64| (v.unwrap_or(0.0) * scale).clamp(0.0, 100.0);
        DailyShare {
            calories: gauge(self.calories, 1.0 / 20.0),
            protein: gauge(self.protein_grams, 2.0),
            carbs: gauge(self.carb_grams, 1.0 / 3.0),
            fat: gauge(self.fat_grams, 1.4),
        }
    }
}

impl fmt::Display for AnalysisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<f64>| match v {
            Some(v) => format!("{}", v),
            None => "--".to_string(),
        };
        write!(
            f,
            "{}: {} kcal, protein {} g, carbs {} g, fat {} g",
            self.food_name,
            show(self.calories),
            show(self.protein_grams),
            show(self.carb_grams),
            show(self.fat_grams)
        )
    }
}

// ===== Wire DTOs =====

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    user_id: Option<&'a str>,
    image: String,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<AnalyzeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AnalyzeData {
    #[serde(default)]
    food_name: Option<String>,
    #[serde(default)]
    nutrition: Option<NutritionDto>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Deserialize, Default)]
struct NutritionDto {
    #[serde(default, deserialize_with = "lenient_number")]
    calories: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    proteins: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    carbs: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    fats: Option<f64>,
}

/// Numbers may arrive as JSON numbers or numeric strings; anything else is unknown.
fn lenient_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    let number = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    // "NaN" and "inf" parse as floats
    Ok(number.filter(|v| v.is_finite()))
}

impl From<AnalyzeData> for AnalysisResult {
    fn from(data: AnalyzeData) -> Self {
        let nutrition = data.nutrition.unwrap_or_default();
        AnalysisResult {
            food_name: data.food_name.unwrap_or_else(|| UNKNOWN_FOOD.to_string()),
            calories: nutrition.calories,
            protein_grams: nutrition.proteins,
            carb_grams: nutrition.carbs,
            fat_grams: nutrition.fats,
            image_url: data.image_url.filter(|u| !u.is_empty()),
        }
    }
}

/// Decode a 200 body into a typed outcome
pub fn decode_response(body: &str) -> RequestOutcome<AnalysisResult> {
    let parsed: AnalyzeResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => return RequestOutcome::DecodeFailure(e.to_string()),
    };

    if !parsed.success {
        return RequestOutcome::ClientError {
            status: 200,
            message: parsed.error.unwrap_or_else(|| "Unknown error".to_string()),
        };
    }

    RequestOutcome::Success(parsed.data.unwrap_or_default().into())
}

/// `data:<mime>;base64,<payload>`
pub fn encode_data_url(image: &CapturedImage) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type(),
        BASE64_STANDARD.encode(image.bytes())
    )
}

/// Holds the single in-flight slot; frees it on drop
pub struct AnalysisTicket {
    slot: Arc<AtomicBool>,
}

impl Drop for AnalysisTicket {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::SeqCst);
    }
}

/// Analysis client with at-most-one in-flight request
#[derive(Default)]
pub struct AnalysisClient {
    in_flight: Arc<AtomicBool>,
}

impl AnalysisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim the in-flight slot, or `None` if a request is already pending.
    pub fn try_acquire(&self) -> Option<AnalysisTicket> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| AnalysisTicket { slot: Arc::clone(&self.in_flight) })
    }

    /// Claim the slot and run the request on the calling thread.
    pub fn analyze(
        &self,
        api_base: &str,
        credential: Option<&Credential>,
        user_id: Option<&str>,
        image: &CapturedImage,
    ) -> RequestOutcome<AnalysisResult> {
        // Checked first: no credential never touches the slot or the network
        let Some(credential) = credential else {
            return RequestOutcome::AuthFailure;
        };
        let Some(ticket) = self.try_acquire() else {
            return RequestOutcome::PreconditionFailure("Analysis already in progress".to_string());
        };
        self.analyze_with(ticket, api_base, Some(credential), user_id, image)
    }

    /// Run the request with a slot claimed earlier (e.g. on the UI thread).
    pub fn analyze_with(
        &self,
        ticket: AnalysisTicket,
        api_base: &str,
        credential: Option<&Credential>,
        user_id: Option<&str>,
        image: &CapturedImage,
    ) -> RequestOutcome<AnalysisResult> {
        let _ticket = ticket;

        let Some(credential) = credential else {
            info!("Authentication required. Please login first.");
            return RequestOutcome::AuthFailure;
        };

        let payload = AnalyzeRequest { user_id, image: encode_data_url(image) };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return RequestOutcome::PreconditionFailure(format!("Cannot encode payload: {}", e)),
        };
        info!("Payload size: {:.1} KB", body.len() as f64 / 1024.0);

        let client = match credential.client_for(api_base) {
            Ok(c) => c,
            Err(e) => return RequestOutcome::PreconditionFailure(e),
        };
        if credential.is_session() {
            info!("Using session-based authentication");
        } else {
            info!("Using token-based authentication for {}", api_host(api_base));
        }

        let url = format!("{}/api/analyze-food", api_base.trim_end_matches('/'));
        info!("Sending image to API: {}", url);

        let response = match client
            .post(&url)
            .timeout(ANALYZE_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
        {
            Ok(r) => r,
            Err(e) => return RequestOutcome::transport(&e),
        };

        let status = response.status().as_u16();
        info!("API response status: {}", status);

        let text = match response.text() {
            Ok(t) => t,
            Err(e) => return RequestOutcome::transport(&e),
        };

        match status {
            200 => {
                let outcome = decode_response(&text);
                if let RequestOutcome::DecodeFailure(ref e) = outcome {
                    debug!("Response text (truncated): {}", super::outcome::truncate_body(&text));
                    debug!("JSON decode error: {}", e);
                }
                outcome
            }
            401 | 403 => RequestOutcome::AuthFailure,
            _ => RequestOutcome::client_error(status, &text),
        }
    }
}
