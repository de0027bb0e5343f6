use std::sync::Arc;

use log::info;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::dispatcher::RequestDispatcher;
use super::models::RequestSpec;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    model_picker_enabled: bool,
}

/// Memoised `GET /models` for one client; cleared on logout.
pub(crate) struct CopilotModelsHandler {
    dispatcher: Arc<RequestDispatcher>,
    cached: Mutex<Option<Vec<String>>>,
}

impl CopilotModelsHandler {
    pub(crate) fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        CopilotModelsHandler {
            dispatcher,
            cached: Mutex::new(None),
        }
    }

    /// Ids of the models offered in the editor's model picker.
    pub(crate) async fn get_models(&self) -> Result<Vec<String>, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(models) = cached.as_ref() {
            info!("Returning cached models");
            return Ok(models.clone());
        }

        let response = self.dispatcher.send(&RequestSpec::get("/models")).await?;
        let models = picker_models(response.json::<ModelsResponse>()?);
        info!("Fetched {} models", models.len());
        *cached = Some(models.clone());
        Ok(models)
    }

    pub(crate) async fn forget(&self) {
        *self.cached.lock().await = None;
    }
}

fn picker_models(response: ModelsResponse) -> Vec<String> {
    response
        .data
        .into_iter()
        .filter(|model| model.model_picker_enabled)
        .map(|model| model.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_picker_models_are_listed() {
        let response: ModelsResponse = serde_json::from_str(
            r#"{"data":[
                {"id":"gpt-4o","model_picker_enabled":true},
                {"id":"text-embedding-3-small","model_picker_enabled":false},
                {"id":"legacy"},
                {"id":"claude-sonnet-4","model_picker_enabled":true,"vendor":"Anthropic"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(picker_models(response), vec!["gpt-4o", "claude-sonnet-4"]);
    }
}
