//! Experiment scenarios

use crate::constants::SERVER_ADDRESS_PLACEHOLDER;
use crate::error::ValidationError;
use crate::profile::{NetworkProfile, ProfileKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;
use url::form_urlencoded;

/// Streaming protocol exercised by a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Dash,
    Lldash,
    Webrtc,
    Moq,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dash => "dash",
            Self::Lldash => "lldash",
            Self::Webrtc => "webrtc",
            Self::Moq => "moq",
        }
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dash" => Ok(Self::Dash),
            "lldash" => Ok(Self::Lldash),
            "webrtc" => Ok(Self::Webrtc),
            "moq" => Ok(Self::Moq),
            other => Err(ValidationError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One experiment definition, loaded once and never mutated
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub protocol: Protocol,

    /// Media manifest URL, may contain the server address placeholder
    pub media_url: String,

    pub network_profile: NetworkProfile,

    /// Resolved path of the profile file (None for implicit passthrough)
    pub profile_source: Option<PathBuf>,

    pub duration_s: u64,
}

/// On-disk scenario layout. Every field is optional here so that missing
/// fields turn into precise validation errors rather than parser noise.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ScenarioDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mpd_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_profile: Option<ProfileRefDoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    experiment: Option<ExperimentDoc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileRefDoc {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExperimentDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_s: Option<i64>,
}

impl Scenario {
    /// Load a scenario file together with the profile it references.
    ///
    /// Relative profile paths are resolved against the scenario's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| ValidationError::io(path, e))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        Self::from_yaml_str(&contents, base_dir)
    }

    pub fn from_yaml_str(contents: &str, base_dir: &Path) -> Result<Self, ValidationError> {
        let doc: ScenarioDoc =
            serde_yaml::from_str(contents).map_err(|e| ValidationError::parse("scenario", e))?;

        let id = doc
            .id
            .ok_or_else(|| ValidationError::MissingField("id".to_string()))?;
        let protocol: Protocol = doc
            .protocol
            .ok_or_else(|| ValidationError::MissingField("protocol".to_string()))?
            .parse()?;
        let media_url = doc
            .mpd_url
            .ok_or_else(|| ValidationError::MissingField("mpd_url".to_string()))?;
        let profile_ref = doc
            .network_profile
            .ok_or_else(|| ValidationError::MissingField("network_profile".to_string()))?;
        let duration_s = doc
            .experiment
            .and_then(|e| e.duration_s)
            .ok_or_else(|| ValidationError::MissingField("experiment.duration_s".to_string()))?;

        if duration_s <= 0 {
            return Err(ValidationError::OutOfRange {
                field: "experiment.duration_s",
                expected: "> 0",
                value: duration_s as f64,
            });
        }

        let kind: ProfileKind = profile_ref
            .kind
            .ok_or_else(|| ValidationError::MissingField("network_profile.type".to_string()))?
            .parse()?;

        let (network_profile, profile_source) = match (kind, profile_ref.file) {
            (_, Some(file)) => {
                let resolved = if file.is_absolute() {
                    file
                } else {
                    base_dir.join(file)
                };
                (NetworkProfile::load(kind, &resolved)?, Some(resolved))
            }
            (ProfileKind::Static, None) => {
                warn!("Scenario {}: no profile file specified, using passthrough", id);
                (NetworkProfile::passthrough(), None)
            }
            (ProfileKind::Trace, None) => {
                return Err(ValidationError::MissingField("network_profile.file".to_string()));
            }
        };

        let scenario = Self {
            id,
            protocol,
            media_url,
            network_profile,
            profile_source,
            duration_s: duration_s as u64,
        };
        scenario.validate()?;

        Ok(scenario)
    }

    /// Structural checks, repeated by the orchestrator before a run
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }

        if self.media_url.trim().is_empty() {
            return Err(ValidationError::MissingField("mpd_url".to_string()));
        }

        if self.duration_s == 0 {
            return Err(ValidationError::OutOfRange {
                field: "experiment.duration_s",
                expected: "> 0",
                value: 0.0,
            });
        }

        if let NetworkProfile::Static(params) = &self.network_profile {
            params.validate()?;
        }

        Ok(())
    }

    /// Media URL with the placeholder replaced by `server_address`
    pub fn resolve_media_url(&self, server_address: &str) -> String {
        self.media_url.replace(SERVER_ADDRESS_PLACEHOLDER, server_address)
    }

    /// Player URL handed to the session client. Query values are
    /// form-encoded, so manifest URLs may carry their own query string.
    pub fn player_url(&self, player_base: &str, server_address: &str, stats_port: u16) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("mpd", &self.resolve_media_url(server_address))
            .append_pair(
                "stats_server",
                &format!("http://{}:{}", server_address, stats_port),
            )
            .append_pair("experiment_id", &self.id)
            .finish();

        format!("{}?{}", player_base, query)
    }

    /// Serialize back into scenario-file form. `profile_file` replaces the
    /// original profile path (used when the profile is copied next to the
    /// snapshot).
    pub fn snapshot_yaml(&self, profile_file: Option<&Path>) -> Result<String, serde_yaml::Error> {
        let doc = ScenarioDoc {
            id: Some(self.id.clone()),
            protocol: Some(self.protocol.to_string()),
            mpd_url: Some(self.media_url.clone()),
            network_profile: Some(ProfileRefDoc {
                kind: Some(self.network_profile.kind().to_string()),
                file: profile_file
                    .map(Path::to_path_buf)
                    .or_else(|| self.profile_source.clone()),
            }),
            experiment: Some(ExperimentDoc {
                duration_s: Some(self.duration_s as i64),
            }),
        };

        serde_yaml::to_string(&doc)
    }
}
