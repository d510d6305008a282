//! Scan-preview confirmation flow for one form session.
//!
//! ```text
//! Idle -> Scanning -> PreviewReady -> (apply | cancel) -> Idle
//!                  \-> NoDataDetected -> (dismiss | rescan)
//!                  \-> Idle (recognition failed)
//! ```
//!
//! The form's vehicle record is only mutated by [`FormSession::apply`] and
//! direct edits. Callers serialize access (one lock per session) and must not
//! hold that lock across the recognition call; [`run_scan`] does this.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::normalizer::Normalizer;
use crate::recognition::{RecognitionError, RecognitionService, ScanImage};
use crate::vehicle::{VehicleField, VehicleRecord};

pub const NO_DATA_MESSAGE: &str = "Aucune information n'a pu être extraite de l'image. \
Veuillez réessayer avec une photo plus nette de votre carte grise, ou remplir les champs manuellement.";

pub const SCAN_FAILED_MESSAGE: &str = "Impossible de scanner le document.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    PreviewReady { preview: VehicleRecord },
    NoDataDetected,
}

/// Result of one completed scan attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// At least one field was extracted; awaiting confirmation.
    Preview { vehicle: VehicleRecord },
    /// The call succeeded but nothing was extracted.
    NoDataDetected { message: String },
    /// The call failed; scanning again may work.
    Failed { message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("a scan preview is waiting to be applied or cancelled")]
    PreviewPending,
    #[error("no scan preview to act on")]
    NoPreview,
    #[error("no completed scan to dismiss")]
    NothingToDismiss,
}

/// A quote request's vehicle form plus its scan flow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSession {
    pub id: Uuid,
    pub vehicle: VehicleRecord,
    #[serde(flatten)]
    pub state: ScanState,
    /// File name of the image behind the current scan or preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanned_file: Option<String>,
}

impl Default for FormSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FormSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            vehicle: VehicleRecord::default(),
            state: ScanState::Idle,
            scanned_file: None,
        }
    }

    /// Enter `Scanning`. Rejected while a scan is in flight or a preview is open.
    pub fn begin_scan(&mut self, filename: &str) -> Result<(), FlowError> {
        match self.state {
            ScanState::Scanning => return Err(FlowError::ScanInProgress),
            ScanState::PreviewReady { .. } => return Err(FlowError::PreviewPending),
            ScanState::Idle | ScanState::NoDataDetected => {}
        }
        debug!("Session {}: scanning {}", self.id, filename);
        self.state = ScanState::Scanning;
        self.scanned_file = Some(filename.to_string());
        Ok(())
    }

    /// Leave `Scanning` with the recognition result.
    pub fn complete_scan(
        &mut self,
        result: Result<serde_json::Value, RecognitionError>,
        normalizer: &Normalizer,
    ) -> ScanOutcome {
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Session {}: scan failed: {}", self.id, e);
                self.state = ScanState::Idle;
                self.scanned_file = None;
                return ScanOutcome::Failed {
                    message: failure_message(&e),
                };
            }
        };

        let preview = normalizer.normalize(&raw);
        if preview.is_blank() {
            info!("Session {}: no vehicle data detected", self.id);
            self.state = ScanState::NoDataDetected;
            self.scanned_file = None;
            return ScanOutcome::NoDataDetected {
                message: NO_DATA_MESSAGE.to_string(),
            };
        }

        info!(
            "Session {}: preview ready ({}/8 fields)",
            self.id,
            preview.filled_count()
        );
        self.state = ScanState::PreviewReady {
            preview: preview.clone(),
        };
        ScanOutcome::Preview { vehicle: preview }
    }

    /// Edit a preview field before accepting it. No validation.
    pub fn edit_preview(&mut self, field: VehicleField, value: impl Into<String>) -> Result<(), FlowError> {
        match &mut self.state {
            ScanState::PreviewReady { preview } => {
                preview.set(field, value);
                Ok(())
            }
            _ => Err(FlowError::NoPreview),
        }
    }

    /// Merge the preview into the form and return to `Idle`.
    pub fn apply(&mut self) -> Result<&VehicleRecord, FlowError> {
        if !matches!(self.state, ScanState::PreviewReady { .. }) {
            return Err(FlowError::NoPreview);
        }
        if let ScanState::PreviewReady { preview } = std::mem::replace(&mut self.state, ScanState::Idle) {
            self.vehicle.merge_from(&preview);
        }
        self.scanned_file = None;
        info!("Session {}: applied scan preview", self.id);
        Ok(&self.vehicle)
    }

    /// Drop the preview; the form is untouched.
    pub fn cancel(&mut self) -> Result<(), FlowError> {
        if !matches!(self.state, ScanState::PreviewReady { .. }) {
            return Err(FlowError::NoPreview);
        }
        self.state = ScanState::Idle;
        self.scanned_file = None;
        debug!("Session {}: preview cancelled", self.id);
        Ok(())
    }

    /// Acknowledge a "no data detected" outcome.
    pub fn dismiss(&mut self) -> Result<(), FlowError> {
        if self.state != ScanState::NoDataDetected {
            return Err(FlowError::NothingToDismiss);
        }
        self.state = ScanState::Idle;
        Ok(())
    }

    /// Direct user edit of the form, allowed in any state.
    pub fn edit_field(&mut self, field: VehicleField, value: impl Into<String>) {
        self.vehicle.set(field, value);
    }
}

/// User-facing text for a failed scan. Only messages a service addressed to
/// the user are passed through.
pub fn failure_message(error: &RecognitionError) -> String {
    match error {
        RecognitionError::Service { message, .. } if !message.trim().is_empty() => message.clone(),
        _ => SCAN_FAILED_MESSAGE.to_string(),
    }
}

/// Drive one scan for a session: enter `Scanning`, call the service without
/// holding the lock, then complete.
///
/// A trigger while another scan is in flight returns [`FlowError::ScanInProgress`]
/// and issues no recognition call.
pub async fn run_scan(
    session: &Mutex<FormSession>,
    service: &dyn RecognitionService,
    normalizer: &Normalizer,
    image: &ScanImage,
) -> Result<ScanOutcome, FlowError> {
    session.lock().await.begin_scan(&image.filename)?;

    let result = service.recognize(image).await;

    let outcome = session.lock().await.complete_scan(result, normalizer);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::text_patterns::CompiledPatterns;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn normalizer() -> Normalizer {
        Normalizer::new(CompiledPatterns::compile(&ScanConfig::default().text_patterns))
    }

    fn image() -> ScanImage {
        ScanImage {
            filename: "carte_grise.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            data: vec![0xFF, 0xD8, 0xFF],
        }
    }

    /// Replies with a fixed body; optionally waits for a release signal first.
    struct StubService {
        reply: Option<Value>,
        calls: AtomicUsize,
        started: Notify,
        release: Option<Notify>,
    }

    impl StubService {
        fn replying(reply: Value) -> Self {
            Self {
                reply: Some(reply),
                calls: AtomicUsize::new(0),
                started: Notify::new(),
                release: None,
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                ..Self::replying(Value::Null)
            }
        }

        fn gated(reply: Value) -> Self {
            Self {
                release: Some(Notify::new()),
                ..Self::replying(reply)
            }
        }
    }

    #[async_trait::async_trait]
    impl RecognitionService for StubService {
        fn name(&self) -> &str {
            "stub"
        }

        async fn recognize(&self, _image: &ScanImage) -> Result<Value, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            if let Some(release) = &self.release {
                release.notified().await;
            }
            self.reply.clone().ok_or(RecognitionError::Service {
                status: 503,
                message: "Service indisponible".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_scan_reaches_preview() {
        let session = Mutex::new(FormSession::new());
        let service = StubService::replying(json!({ "data": { "marque": "Audi", "A": "AB-123-CD" } }));

        let outcome = run_scan(&session, &service, &normalizer(), &image()).await.unwrap();
        let vehicle = match outcome {
            ScanOutcome::Preview { vehicle } => vehicle,
            other => panic!("expected a preview, got {:?}", other),
        };
        assert_eq!(vehicle.make, "Audi");
        assert_eq!(vehicle.registration_plate, "AB-123-CD");

        let guard = session.lock().await;
        assert!(matches!(guard.state, ScanState::PreviewReady { .. }));
        assert_eq!(guard.scanned_file.as_deref(), Some("carte_grise.jpg"));
        // form untouched until applied
        assert!(guard.vehicle.is_blank());
    }

    #[tokio::test]
    async fn test_empty_response_routes_to_no_data() {
        let session = Mutex::new(FormSession::new());
        let service = StubService::replying(json!({}));

        let outcome = run_scan(&session, &service, &normalizer(), &image()).await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::NoDataDetected {
                message: NO_DATA_MESSAGE.to_string()
            }
        );

        let mut guard = session.lock().await;
        assert_eq!(guard.state, ScanState::NoDataDetected);
        guard.dismiss().unwrap();
        assert_eq!(guard.state, ScanState::Idle);
    }

    #[tokio::test]
    async fn test_failure_returns_to_idle_with_retryable_message() {
        let session = Mutex::new(FormSession::new());
        let service = StubService::failing();

        let outcome = run_scan(&session, &service, &normalizer(), &image()).await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Failed {
                message: "Service indisponible".to_string()
            }
        );
        assert_eq!(session.lock().await.state, ScanState::Idle);

        // a new scan is allowed right away
        let outcome = run_scan(&session, &service, &normalizer(), &image()).await.unwrap();
        assert!(matches!(outcome, ScanOutcome::Failed { .. }));
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_provider_failure_uses_generic_message() {
        let mut session = FormSession::new();
        session.begin_scan("a.jpg").unwrap();
        let outcome = session.complete_scan(Err(RecognitionError::Provider { status: 401 }), &normalizer());
        assert_eq!(
            outcome,
            ScanOutcome::Failed {
                message: SCAN_FAILED_MESSAGE.to_string()
            }
        );
        assert_eq!(session.state, ScanState::Idle);
    }

    #[tokio::test]
    async fn test_second_trigger_while_scanning_is_rejected() {
        let session = Arc::new(Mutex::new(FormSession::new()));
        let service = Arc::new(StubService::gated(json!({ "vin": "VF1AB12C3D4567890" })));
        let normalizer = Arc::new(normalizer());

        let first = {
            let (session, service, normalizer) = (session.clone(), service.clone(), normalizer.clone());
            tokio::spawn(async move { run_scan(&session, service.as_ref(), &normalizer, &image()).await })
        };
        service.started.notified().await;

        let second = run_scan(&session, service.as_ref(), &normalizer, &image()).await;
        assert_eq!(second, Err(FlowError::ScanInProgress));
        assert_eq!(session.lock().await.state, ScanState::Scanning);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);

        if let Some(release) = &service.release {
            release.notify_one();
        }
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, ScanOutcome::Preview { .. }));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scan_rejected_while_preview_pending() {
        let mut session = FormSession::new();
        session.begin_scan("a.jpg").unwrap();
        session.complete_scan(Ok(json!({ "make": "Opel" })), &normalizer());
        assert_eq!(session.begin_scan("b.jpg"), Err(FlowError::PreviewPending));
    }

    #[test]
    fn test_edit_then_apply_merges_non_blank_fields() {
        let mut session = FormSession::new();
        session.edit_field(VehicleField::Make, "BMW");
        session.edit_field(VehicleField::Model, "A4");

        session.begin_scan("a.jpg").unwrap();
        session.complete_scan(Ok(json!({ "make": "Audi", "color": "Bleu" })), &normalizer());
        session.edit_preview(VehicleField::Color, "Bleu nuit").unwrap();

        let merged = session.apply().unwrap().clone();
        assert_eq!(merged.make, "Audi");
        assert_eq!(merged.model, "A4");
        assert_eq!(merged.color, "Bleu nuit");
        assert_eq!(session.state, ScanState::Idle);
        assert_eq!(session.scanned_file, None);
        assert_eq!(session.apply(), Err(FlowError::NoPreview));
    }

    #[test]
    fn test_cancel_discards_preview() {
        let mut session = FormSession::new();
        session.edit_field(VehicleField::Make, "BMW");
        session.begin_scan("a.jpg").unwrap();
        session.complete_scan(Ok(json!({ "make": "Audi" })), &normalizer());

        session.cancel().unwrap();
        assert_eq!(session.vehicle.make, "BMW");
        assert_eq!(session.state, ScanState::Idle);
        assert_eq!(session.cancel(), Err(FlowError::NoPreview));
    }

    #[test]
    fn test_apply_outside_preview_keeps_state() {
        let mut session = FormSession::new();
        session.begin_scan("a.jpg").unwrap();
        assert_eq!(session.apply(), Err(FlowError::NoPreview));
        assert_eq!(session.state, ScanState::Scanning);
        assert_eq!(
            session.edit_preview(VehicleField::Vin, "X"),
            Err(FlowError::NoPreview)
        );
        assert_eq!(session.dismiss(), Err(FlowError::NothingToDismiss));
    }

    #[test]
    fn test_rescan_allowed_after_no_data() {
        let mut session = FormSession::new();
        session.begin_scan("a.jpg").unwrap();
        session.complete_scan(Ok(json!(null)), &normalizer());
        assert_eq!(session.state, ScanState::NoDataDetected);
        assert!(session.begin_scan("b.jpg").is_ok());
    }

    #[test]
    fn test_snapshot_serializes_flat_state() {
        let mut session = FormSession::new();
        session.begin_scan("a.jpg").unwrap();
        session.complete_scan(Ok(json!({ "make": "Audi" })), &normalizer());

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"], "preview_ready");
        assert_eq!(json["preview"]["make"], "Audi");
        assert_eq!(json["vehicle"]["make"], "");
        assert_eq!(json["scannedFile"], "a.jpg");
        assert!(json.get("scanned_file").is_none());
    }
}
