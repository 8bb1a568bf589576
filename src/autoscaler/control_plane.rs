//! Abstraction over the external machine control plane the autoscaler
//! starts worker hosts through. Kept as a trait so the autoscaler's
//! debounce/decision logic can be tested without a live control-plane API.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct Machine {
    pub id: String,
    pub language: String,
    pub state: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Request(String),

    #[error("control plane returned an unexpected response: {0}")]
    UnexpectedResponse(String),
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_machines(&self, app: &str) -> Result<Vec<Machine>, ControlPlaneError>;
    async fn start_machine(&self, app: &str, machine_id: &str) -> Result<Machine, ControlPlaneError>;
}

/// A control plane reached over HTTP, the shape every major fly/VM-style
/// machine API takes: list running machines for an app, or start one.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token: api_token.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct MachineResponse {
    id: String,
    state: String,
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_machines(&self, app: &str) -> Result<Vec<Machine>, ControlPlaneError> {
        let url = format!("{}/apps/{}/machines", self.base_url, app);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?;

        let machines: Vec<MachineResponse> = resp
            .json()
            .await
            .map_err(|e| ControlPlaneError::UnexpectedResponse(e.to_string()))?;

        Ok(machines
            .into_iter()
            .map(|m| Machine {
                id: m.id,
                language: app.to_string(),
                state: m.state,
            })
            .collect())
    }

    async fn start_machine(&self, app: &str, machine_id: &str) -> Result<Machine, ControlPlaneError> {
        let url = format!("{}/apps/{}/machines/{}/start", self.base_url, app, machine_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?;

        let machine: MachineResponse = resp
            .json()
            .await
            .map_err(|e| ControlPlaneError::UnexpectedResponse(e.to_string()))?;

        Ok(Machine {
            id: machine.id,
            language: app.to_string(),
            state: machine.state,
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory control plane that just counts how many times it was
    /// asked to start a machine per language.
    #[derive(Default)]
    pub struct FakeControlPlane {
        pub starts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn list_machines(&self, _app: &str) -> Result<Vec<Machine>, ControlPlaneError> {
            Ok(vec![Machine {
                id: "m-1".to_string(),
                language: _app.to_string(),
                state: "stopped".to_string(),
            }])
        }

        async fn start_machine(&self, app: &str, _machine_id: &str) -> Result<Machine, ControlPlaneError> {
            self.starts.lock().unwrap().push(app.to_string());
            Ok(Machine {
                id: format!("fake-{app}-{}", self.starts.lock().unwrap().len()),
                language: app.to_string(),
                state: "starting".to_string(),
            })
        }
    }
}
