use serde::Deserialize;
use serde_json::Value;

/// Generic `*.list` response envelope.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    #[serde(default)]
    pub items: Vec<Value>,
    pub next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Deserialize, Debug)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

#[derive(Deserialize, Debug)]
pub struct ErrorDetail {
    #[serde(default)]
    pub reason: String,
}
