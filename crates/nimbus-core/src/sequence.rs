//! Parameters of the job a sequencer creates once its dependencies finish.

use serde::{Deserialize, Serialize};

use crate::job::JobKind;
use crate::resource::TriggerType;
use crate::{Error, Result};

/// Tagged by the kind of job to create. Decoding happens when the sequencer
/// launches, so malformed parameters surface as a configuration error there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NextJobParameters {
    Describe {
        connection_id: String,
        resource_types: Vec<String>,
    },
    Compliance {
        benchmark_id: String,
        connection_ids: Vec<String>,
        #[serde(default)]
        control_ids: Vec<String>,
    },
    Analytics {},
}

impl NextJobParameters {
    pub fn kind(&self) -> JobKind {
        match self {
            NextJobParameters::Describe { .. } => JobKind::Describe,
            NextJobParameters::Compliance { .. } => JobKind::Compliance,
            NextJobParameters::Analytics {} => JobKind::Analytics,
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        TriggerType::Manual
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Decode stored parameters and check they describe a `next_job`.
    pub fn decode(next_job: JobKind, raw: &serde_json::Value) -> Result<Self> {
        let params: NextJobParameters = serde_json::from_value(raw.clone())
            .map_err(|e| Error::Configuration(format!("malformed next job parameters: {e}")))?;
        if params.kind() != next_job {
            return Err(Error::Configuration(format!(
                "next job is {next_job} but parameters describe {}",
                params.kind()
            )));
        }
        Ok(params)
    }
}
