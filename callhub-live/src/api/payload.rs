//! Body extractor shared by the webhook and session endpoints

use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::header::CONTENT_TYPE,
    Form, Json,
};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;

use crate::ingest::{FieldMap, PayloadError};

/// Request body as a field map, JSON or form-encoded
///
/// Never rejects: an unreadable body becomes `Err` so the handler can log and
/// acknowledge it.
pub struct WebhookPayload(pub Result<FieldMap, PayloadError>);

#[async_trait]
impl<S> FromRequest<S> for WebhookPayload
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"))
            .unwrap_or(false);

        let fields = if is_json {
            match Json::<Value>::from_request(req, state).await {
                Ok(Json(Value::Object(map))) => Ok(map),
                Ok(Json(_)) => Err(PayloadError::NotAnObject),
                Err(rejection) => Err(PayloadError::Body(rejection.body_text())),
            }
        } else {
            match Form::<HashMap<String, String>>::from_request(req, state).await {
                Ok(Form(pairs)) => Ok(pairs
                    .into_iter()
                    .map(|(key, value)| (key, Value::String(value)))
                    .collect()),
                Err(rejection) => Err(PayloadError::Body(rejection.body_text())),
            }
        };

        Ok(WebhookPayload(fields))
    }
}
