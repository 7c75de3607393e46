use serde::Serialize;

use crate::error::{DispatchResult, ErrorResponse};
use crate::request::{Dispatched, ResultSource, TextType};

#[derive(Debug, Serialize)]
pub struct TranslateResponse {
    pub text: String,
    pub provider: String,
    pub text_type: TextType,
    pub source: ResultSource,
    pub fingerprint: String,
}

impl From<Dispatched> for TranslateResponse {
    fn from(dispatched: Dispatched) -> Self {
        Self {
            text: dispatched.translation.text,
            provider: dispatched.translation.provider,
            text_type: dispatched.translation.text_type,
            source: dispatched.source,
            fingerprint: dispatched.fingerprint.as_str().to_string(),
        }
    }
}

/// One entry per input segment, in input order.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SegmentResult {
    Ok(TranslateResponse),
    Error(ErrorResponse),
}

#[derive(Debug, Serialize)]
pub struct SegmentsResponse {
    pub translated: usize,
    pub failed: usize,
    pub segments: Vec<SegmentResult>,
}

impl SegmentsResponse {
    pub fn new(results: Vec<DispatchResult<Dispatched>>) -> Self {
        let segments: Vec<SegmentResult> = results
            .into_iter()
            .map(|result| match result {
                Ok(dispatched) => SegmentResult::Ok(dispatched.into()),
                Err(e) => SegmentResult::Error(ErrorResponse::from_dispatch_error(&e)),
            })
            .collect();
        let translated = segments
            .iter()
            .filter(|s| matches!(s, SegmentResult::Ok(_)))
            .count();

        Self {
            translated,
            failed: segments.len() - translated,
            segments,
        }
    }
}
