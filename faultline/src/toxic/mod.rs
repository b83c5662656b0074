//! The toxic catalogue: named stream transforms applied to one direction of
//! a proxied connection, plus the registry turning wire definitions into
//! typed parameters.

pub mod bandwidth;
pub mod latency;
pub mod limit_data;
pub mod noop;
pub mod reset_peer;
pub mod slicer;
pub mod slow_close;
pub mod timeout;

use core::fmt;

use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct as _;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Error;
use crate::stream::{StageExit, StageState, ToxicStub};

/// Direction of travel: `upstream` is client → server, `downstream` is
/// server → client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Upstream,
    #[default]
    Downstream,
}

impl StreamDirection {
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "upstream" => Ok(StreamDirection::Upstream),
            "downstream" => Ok(StreamDirection::Downstream),
            _ => Err(Error::InvalidStream),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamDirection::Upstream => "upstream",
            StreamDirection::Downstream => "downstream",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            StreamDirection::Upstream => 0,
            StreamDirection::Downstream => 1,
        }
    }
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed parameters for every catalogue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ToxicKind {
    Noop,
    Latency(latency::Latency),
    Bandwidth(bandwidth::Bandwidth),
    SlowClose(slow_close::SlowClose),
    Timeout(timeout::Timeout),
    Slicer(slicer::Slicer),
    LimitData(limit_data::LimitData),
    ResetPeer(reset_peer::ResetPeer),
}

impl ToxicKind {
    /// The registry: builds typed parameters from a catalogue name and an
    /// attribute bag. Unknown names fail with `invalid toxic type`, omitted
    /// required attributes with `missing required field`.
    pub fn parse(type_name: &str, attributes: serde_json::Value) -> Result<Self, Error> {
        match type_name {
            "noop" => Ok(ToxicKind::Noop),
            "latency" => Ok(ToxicKind::Latency(parse_attributes(attributes)?)),
            "bandwidth" => Ok(ToxicKind::Bandwidth(parse_attributes(attributes)?)),
            "slow_close" => Ok(ToxicKind::SlowClose(parse_attributes(attributes)?)),
            "timeout" => Ok(ToxicKind::Timeout(parse_attributes(attributes)?)),
            "slicer" => Ok(ToxicKind::Slicer(parse_attributes(attributes)?)),
            "limit_data" => Ok(ToxicKind::LimitData(parse_attributes(attributes)?)),
            "reset_peer" => Ok(ToxicKind::ResetPeer(parse_attributes(attributes)?)),
            other => Err(Error::InvalidToxicType(other.to_owned())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ToxicKind::Noop => "noop",
            ToxicKind::Latency(_) => "latency",
            ToxicKind::Bandwidth(_) => "bandwidth",
            ToxicKind::SlowClose(_) => "slow_close",
            ToxicKind::Timeout(_) => "timeout",
            ToxicKind::Slicer(_) => "slicer",
            ToxicKind::LimitData(_) => "limit_data",
            ToxicKind::ResetPeer(_) => "reset_peer",
        }
    }

    pub fn attributes(&self) -> serde_json::Value {
        fn to_value<T: Serialize>(params: &T) -> serde_json::Value {
            serde_json::to_value(params).expect("toxic parameters serialize to a JSON object")
        }

        match self {
            ToxicKind::Noop => serde_json::json!({}),
            ToxicKind::Latency(params) => to_value(params),
            ToxicKind::Bandwidth(params) => to_value(params),
            ToxicKind::SlowClose(params) => to_value(params),
            ToxicKind::Timeout(params) => to_value(params),
            ToxicKind::Slicer(params) => to_value(params),
            ToxicKind::LimitData(params) => to_value(params),
            ToxicKind::ResetPeer(params) => to_value(params),
        }
    }

    /// Chunk budget for the stage's input link. Latency keeps a deep buffer
    /// so queued chunks keep their arrival stamps instead of back-pressuring
    /// the reader for the whole delay window.
    pub(crate) fn chunk_buffer(&self) -> usize {
        match self {
            ToxicKind::Latency(_) => 1024,
            _ => 1,
        }
    }

    /// Whether toxicity is drawn once per connection rather than per chunk.
    pub(crate) fn connection_scoped(&self) -> bool {
        !matches!(self, ToxicKind::Noop | ToxicKind::Latency(_) | ToxicKind::Slicer(_))
    }

    pub(crate) fn initial_state(&self) -> Option<StageState> {
        match self {
            ToxicKind::LimitData(_) => Some(StageState::LimitData { transmitted: 0 }),
            _ => None,
        }
    }

    /// Runs this transform over the stub until end-of-stream, an interrupt,
    /// or a deliberate early close.
    pub(crate) async fn pipe(&self, stub: &mut ToxicStub, toxicity: f32) -> StageExit {
        if self.connection_scoped() && !stub.applies(toxicity) {
            return noop::run(stub).await;
        }

        match self {
            ToxicKind::Noop => noop::run(stub).await,
            ToxicKind::Latency(params) => latency::run(stub, params, toxicity).await,
            ToxicKind::Bandwidth(params) => bandwidth::run(stub, params).await,
            ToxicKind::SlowClose(params) => slow_close::run(stub, params).await,
            ToxicKind::Timeout(params) => timeout::run(stub, params).await,
            ToxicKind::Slicer(params) => slicer::run(stub, params, toxicity).await,
            ToxicKind::LimitData(params) => limit_data::run(stub, params).await,
            ToxicKind::ResetPeer(params) => reset_peer::run(stub, params).await,
        }
    }
}

fn parse_attributes<T: DeserializeOwned>(attributes: serde_json::Value) -> Result<T, Error> {
    let attributes = match attributes {
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    };

    serde_json::from_value(attributes).map_err(|error| {
        let message = error.to_string();
        match missing_field_name(&message) {
            Some(field) => Error::MissingField(field.to_owned()),
            None => Error::BadRequestBody(message),
        }
    })
}

fn missing_field_name(message: &str) -> Option<&str> {
    let rest = message.strip_prefix("missing field `")?;
    rest.split('`').next()
}

/// A configured toxic: a named transform bound to one direction of a proxy.
#[derive(Debug, Clone)]
pub struct Toxic {
    pub name: String,
    pub kind: ToxicKind,
    pub stream: StreamDirection,
    pub toxicity: f32,
}

impl Toxic {
    /// Builds a toxic from its wire definition, applying the catalogue
    /// defaults: stream `downstream`, toxicity 1.0, name `<type>_<stream>`.
    pub fn from_input(input: ToxicInput) -> Result<Self, Error> {
        let stream = match input.stream.as_deref() {
            None | Some("") => StreamDirection::default(),
            Some(value) => StreamDirection::parse(value)?,
        };

        if input.toxic_type.is_empty() {
            return Err(Error::InvalidToxicType(String::new()));
        }
        let kind = ToxicKind::parse(&input.toxic_type, input.attributes)?;

        let toxicity = input.toxicity.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&toxicity) {
            return Err(Error::BadRequestBody(format!("toxicity {toxicity} is out of [0, 1]")));
        }

        let name = if input.name.is_empty() {
            format!("{}_{}", kind.type_name(), stream)
        } else {
            input.name
        };

        Ok(Toxic {
            name,
            kind,
            stream,
            toxicity,
        })
    }

    /// Full-configuration equality, used to decide whether a populate entry
    /// must recreate a live toxic.
    pub fn config_matches(&self, other: &Toxic) -> bool {
        self.kind == other.kind
            && self.stream == other.stream
            && (self.toxicity - other.toxicity).abs() < f32::EPSILON
    }

    /// Applies an update payload: attributes merge over the current ones, the
    /// type and stream never change.
    pub fn apply_patch(&self, patch: ToxicPatch) -> Result<Toxic, Error> {
        let kind = match patch.attributes {
            Some(serde_json::Value::Object(new_attributes)) => {
                let mut attributes = self.kind.attributes();
                if let serde_json::Value::Object(merged) = &mut attributes {
                    merged.extend(new_attributes);
                }
                ToxicKind::parse(self.kind.type_name(), attributes)?
            }
            Some(other) => return Err(Error::BadRequestBody(format!("attributes must be an object, got {other}"))),
            None => self.kind.clone(),
        };

        let toxicity = patch.toxicity.unwrap_or(self.toxicity);
        if !(0.0..=1.0).contains(&toxicity) {
            return Err(Error::BadRequestBody(format!("toxicity {toxicity} is out of [0, 1]")));
        }

        Ok(Toxic {
            name: self.name.clone(),
            kind,
            stream: self.stream,
            toxicity,
        })
    }

    pub(crate) fn sentinel(stream: StreamDirection) -> Toxic {
        Toxic {
            name: String::new(),
            kind: ToxicKind::Noop,
            stream,
            toxicity: 1.0,
        }
    }
}

impl Serialize for Toxic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Toxic", 5)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("type", self.kind.type_name())?;
        state.serialize_field("stream", self.stream.as_str())?;
        state.serialize_field("toxicity", &self.toxicity)?;
        state.serialize_field("attributes", &self.kind.attributes())?;
        state.end()
    }
}

/// Wire shape shared by the admin API and the populate file.
#[derive(Debug, Clone, Deserialize)]
pub struct ToxicInput {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub toxic_type: String,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub toxicity: Option<f32>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Update payload: both fields optional, attributes merge over the old ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToxicPatch {
    #[serde(default)]
    pub toxicity: Option<f32>,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}
