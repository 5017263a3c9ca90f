// src/api/types.rs
use serde::{Deserialize, Serialize};

use crate::utils::error::{AgentError, Result};

pub const CODE_SUCCESS: i32 = 0;

/// `{code, message, body}` envelope shared by the gateway and the update API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Option::default")]
    pub body: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn success(body: T) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: String::new(),
            body: Some(body),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Unwraps a remote envelope, turning failure codes into errors.
    pub fn into_body(self) -> Result<T> {
        if !self.is_success() {
            return Err(AgentError::Upstream(format!(
                "code {}: {}",
                self.code, self.message
            )));
        }
        self.body
            .ok_or_else(|| AgentError::Upstream("response has no body".into()))
    }
}

impl ApiResult<()> {
    pub fn error(error: &AgentError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            body: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginQuery {
    pub plugin_id: Option<String>,
    pub app_version: Option<i64>,
}

impl PluginQuery {
    /// Merges parameters sent as a form body. Form values win over the
    /// query string.
    pub fn with_form(self, form: Option<PluginQuery>) -> Self {
        match form {
            Some(form) => Self {
                plugin_id: form.plugin_id.filter(|id| !id.is_empty()).or(self.plugin_id),
                app_version: form.app_version.or(self.app_version),
            },
            None => self,
        }
    }

    pub fn require_id(&self) -> Result<&str> {
        match self.plugin_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(AgentError::NotFound(String::new())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterInfo {
    pub namespace: String,
    pub version: i64,
    pub version_name: String,
}

impl MasterInfo {
    pub fn current(namespace: impl Into<String>) -> Self {
        let version_name = env!("CARGO_PKG_VERSION").to_string();
        Self {
            namespace: namespace.into(),
            version: version_code(&version_name),
            version_name,
        }
    }
}

/// `major.minor.patch` packed as `major * 10000 + minor * 100 + patch`.
fn version_code(version: &str) -> i64 {
    version
        .split('.')
        .take(3)
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse::<i64>()
                .unwrap_or(0)
        })
        .chain(std::iter::repeat(0))
        .take(3)
        .fold(0, |acc, part| acc * 100 + part)
}
