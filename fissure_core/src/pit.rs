//! Format descriptions ("pits") in JSON.
//!
//! A pit names the data models, the state model whose actions use them, the
//! publishers those actions run against and the agents that watch the
//! target. [`PitFile`] is the raw deserialized document; [`PitFile::build`]
//! turns it into ready-to-run parts.

use crate::agent::{Agent, LocalAgent, Monitor};
use crate::element::DataElement;
use crate::fixup::SequenceIncrement;
use crate::model::{DataModel, ModelError};
use crate::monitor::{ExitStatusMonitor, ProcessMonitor, ProcessMonitorConfig};
use crate::publisher::{Publisher, PublisherError, PublisherRegistry};
use crate::relation::Relation;
use crate::rpc::RpcAgent;
use crate::state::{Action, ActionKind, StateError, StateModel};
use crate::variant::Variant;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_INPUT_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum PitError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid format description: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Publisher(#[from] PublisherError),
    #[error("element '{element}': {reason}")]
    Element { element: String, reason: String },
    #[error("action '{action}' uses unknown data model '{model}'")]
    UnknownDataModel { action: String, model: String },
    #[error("unknown publisher '{0}'")]
    UnknownPublisher(String),
    #[error("monitor '{monitor}': {reason}")]
    Monitor { monitor: String, reason: String },
    #[error("invalid hex: {0}")]
    Hex(String),
}

fn element_error(element: &str, reason: impl Into<String>) -> PitError {
    PitError::Element {
        element: element.to_string(),
        reason: reason.into(),
    }
}

/// Decodes a hex string; whitespace between digit pairs is ignored.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, PitError> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(PitError::Hex(format!("odd number of digits in '{text}'")));
    }
    let nibble = |digit: u8| match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        other => Err(PitError::Hex(format!("'{}' is not a hex digit", other as char))),
    };
    digits
        .chunks(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

fn json_variant(value: &serde_json::Value) -> Option<Variant> {
    match value {
        serde_json::Value::Bool(b) => Some(Variant::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(Variant::UInt)
            .or_else(|| n.as_i64().map(Variant::Int)),
        serde_json::Value::String(s) => Some(Variant::Str(s.clone())),
        _ => None,
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ElementType {
    Number,
    String,
    Blob,
    Flag,
    Block,
    Choice,
    Array,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EndianDef {
    #[default]
    Little,
    Big,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingDef {
    #[default]
    Utf8,
    Ascii,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnitDef {
    #[default]
    Bytes,
    Bits,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RelationDef {
    Size {
        from: String,
        #[serde(default)]
        unit: UnitDef,
    },
    Offset {
        from: String,
    },
    Count {
        from: String,
    },
    When {
        from: String,
        equals: serde_json::Value,
    },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum FixupDef {
    SequenceIncrement,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ElementDef {
    #[serde(rename = "type")]
    pub kind: ElementType,
    pub name: String,
    #[serde(default)]
    pub bits: Option<u32>,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub endian: EndianDef,
    #[serde(default)]
    pub encoding: EncodingDef,
    /// Fixed length in bytes.
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub length_bits: Option<u64>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub default_hex: Option<String>,
    #[serde(default)]
    pub token: bool,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    #[serde(default)]
    pub fixup: Option<FixupDef>,
    #[serde(default)]
    pub children: Vec<ElementDef>,
    #[serde(default)]
    pub template: Option<Box<ElementDef>>,
    #[serde(default)]
    pub min_occurs: usize,
    /// Absent means unbounded.
    #[serde(default)]
    pub max_occurs: Option<usize>,
    /// Occurrences generated before anything is cracked.
    #[serde(default)]
    pub occurs: Option<usize>,
}

impl ElementDef {
    pub fn build(&self) -> Result<DataElement, PitError> {
        let name = self.name.as_str();
        let mut element = match self.kind {
            ElementType::Number => {
                let bits = self.bits.ok_or_else(|| element_error(name, "numbers need 'bits'"))?;
                let mut number = DataElement::number(name, bits);
                if self.signed {
                    number = number.signed();
                }
                if self.endian == EndianDef::Big {
                    number = number.big_endian();
                }
                number
            }
            ElementType::Flag => {
                let bits = self.bits.ok_or_else(|| element_error(name, "flags need 'bits'"))?;
                DataElement::flag(name, bits)
            }
            ElementType::String => {
                let string = DataElement::string(name);
                match self.encoding {
                    EncodingDef::Ascii => string.ascii(),
                    EncodingDef::Utf8 => string,
                }
            }
            ElementType::Blob => DataElement::blob(name),
            ElementType::Block => DataElement::block(name, self.build_children()?),
            ElementType::Choice => DataElement::choice(name, self.build_children()?),
            ElementType::Array => {
                let template = self
                    .template
                    .as_ref()
                    .ok_or_else(|| element_error(name, "arrays need a 'template'"))?
                    .build()?;
                let array = DataElement::array(name, template, self.min_occurs, self.max_occurs);
                match self.occurs {
                    Some(occurs) => array.with_occurs(occurs),
                    None => array,
                }
            }
        };

        if let Some(value) = self.default_value()? {
            element = element.with_default(value);
        }
        if let Some(bytes) = self.length {
            element = element.with_length_bytes(bytes);
        }
        if let Some(bits) = self.length_bits {
            element = element.with_length_bits(bits);
        }
        if self.token {
            element = element.token();
        }
        for relation in &self.relations {
            element = element.with_relation(self.relation(relation)?);
        }
        if let Some(FixupDef::SequenceIncrement) = self.fixup {
            element = element.with_fixup(SequenceIncrement);
        }
        Ok(element)
    }

    fn build_children(&self) -> Result<Vec<DataElement>, PitError> {
        self.children.iter().map(ElementDef::build).collect()
    }

    fn default_value(&self) -> Result<Option<Variant>, PitError> {
        if let Some(hex) = &self.default_hex {
            return Ok(Some(Variant::Bytes(decode_hex(hex)?)));
        }
        let Some(value) = &self.default else {
            return Ok(None);
        };
        let invalid = || element_error(&self.name, format!("unusable default {value}"));
        let variant = match (self.kind, value) {
            (ElementType::Blob, serde_json::Value::String(text)) => Variant::Bytes(text.as_bytes().to_vec()),
            (ElementType::Number, serde_json::Value::Number(n)) if self.signed => {
                Variant::Int(n.as_i64().ok_or_else(invalid)?)
            }
            (ElementType::Number | ElementType::Flag, serde_json::Value::Number(n)) => {
                match n.as_u64() {
                    Some(v) => Variant::UInt(v),
                    None => Variant::Int(n.as_i64().ok_or_else(invalid)?),
                }
            }
            (ElementType::String, serde_json::Value::String(text)) => Variant::Str(text.clone()),
            _ => return Err(invalid()),
        };
        Ok(Some(variant))
    }

    fn relation(&self, def: &RelationDef) -> Result<Relation, PitError> {
        Ok(match def {
            RelationDef::Size {
                from,
                unit: UnitDef::Bytes,
            } => Relation::size(from.as_str()),
            RelationDef::Size {
                from,
                unit: UnitDef::Bits,
            } => Relation::size_in_bits(from.as_str()),
            RelationDef::Offset { from } => Relation::offset(from.as_str()),
            RelationDef::Count { from } => Relation::count(from.as_str()),
            RelationDef::When { from, equals } => {
                let expected = json_variant(equals).ok_or_else(|| {
                    element_error(&self.name, format!("condition value {equals} is not a scalar"))
                })?;
                Relation::when(from.as_str(), expected)
            }
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SampleDef {
    Hex(String),
    Text(String),
    /// Relative paths resolve against the pit's directory.
    File(PathBuf),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Open,
    Close,
    Output,
    Input,
    Call,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ActionDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub publisher: String,
    #[serde(default)]
    pub data_model: Option<String>,
    #[serde(default)]
    pub sample: Option<SampleDef>,
    #[serde(default)]
    pub watchdog_ms: Option<u64>,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StateModelDef {
    pub name: String,
    pub actions: Vec<ActionDef>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PublisherDef {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentTransportDef {
    /// Monitors run on the engine's thread.
    #[default]
    InProcess,
    /// Monitors run on their own thread behind the RPC client.
    Thread,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MonitorDef {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AgentDef {
    pub name: String,
    #[serde(default)]
    pub transport: AgentTransportDef,
    #[serde(default)]
    pub monitors: Vec<MonitorDef>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ExitStatusParams {
    publisher: String,
}

/// A format description as written.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PitFile {
    pub data_models: Vec<ElementDef>,
    pub state_model: StateModelDef,
    #[serde(default)]
    pub publishers: Vec<PublisherDef>,
    #[serde(default)]
    pub agents: Vec<AgentDef>,
}

/// Everything a run needs, built from a [`PitFile`].
pub struct Pit {
    pub data_models: BTreeMap<String, DataModel>,
    pub state_model: StateModel,
    pub publishers: Vec<Box<dyn Publisher>>,
    pub agents: Vec<Box<dyn Agent>>,
}

impl PitFile {
    pub fn parse(text: &str) -> Result<Self, PitError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, PitError> {
        let text = std::fs::read_to_string(path).map_err(|source| PitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Builds every data model, keyed by root name.
    pub fn data_models(&self) -> Result<BTreeMap<String, DataModel>, PitError> {
        let mut models = BTreeMap::new();
        for def in &self.data_models {
            let model = DataModel::new(def.build()?)?;
            models.insert(model.name().to_string(), model);
        }
        Ok(models)
    }

    /// Builds the pit. Relative sample files resolve against `base_dir`.
    pub fn build(
        &self,
        base_dir: &Path,
        publishers: &PublisherRegistry,
        agent_timeout: Duration,
    ) -> Result<Pit, PitError> {
        let data_models = self.data_models()?;

        let mut actions = Vec::with_capacity(self.state_model.actions.len());
        for def in &self.state_model.actions {
            actions.push(build_action(def, &data_models, base_dir)?);
        }
        let state_model = StateModel::new(self.state_model.name.clone(), actions)?;

        let mut built_publishers = Vec::with_capacity(self.publishers.len());
        for def in &self.publishers {
            built_publishers.push(publishers.create(&def.kind, &def.name, &def.params)?);
        }

        let mut agents: Vec<Box<dyn Agent>> = Vec::with_capacity(self.agents.len());
        for def in &self.agents {
            let mut agent = LocalAgent::new(def.name.clone());
            for monitor in &def.monitors {
                agent.add_monitor(build_monitor(monitor, &built_publishers)?);
            }
            debug!(agent = %def.name, monitors = def.monitors.len(), transport = ?def.transport, "agent built");
            agents.push(match def.transport {
                AgentTransportDef::InProcess => Box::new(agent),
                AgentTransportDef::Thread => Box::new(RpcAgent::threaded(agent, agent_timeout)),
            });
        }

        Ok(Pit {
            data_models,
            state_model,
            publishers: built_publishers,
            agents,
        })
    }
}

fn build_action(
    def: &ActionDef,
    models: &BTreeMap<String, DataModel>,
    base_dir: &Path,
) -> Result<Action, PitError> {
    let kind = match def.kind {
        ActionType::Open => ActionKind::Open,
        ActionType::Close => ActionKind::Close,
        ActionType::Output => ActionKind::Output,
        ActionType::Input => ActionKind::Input {
            max_size: def.max_size.unwrap_or(DEFAULT_INPUT_SIZE),
        },
        ActionType::Call => ActionKind::Call {
            method: def.method.clone().ok_or_else(|| PitError::Element {
                element: def.name.clone(),
                reason: "call actions need a 'method'".to_string(),
            })?,
        },
    };
    let mut action = Action::new(def.name.clone(), kind, def.publisher.clone());
    if let Some(name) = &def.data_model {
        let model = models.get(name).ok_or_else(|| PitError::UnknownDataModel {
            action: def.name.clone(),
            model: name.clone(),
        })?;
        action = action.with_model(model.clone());
    }
    if let Some(sample) = &def.sample {
        let bytes = match sample {
            SampleDef::Hex(hex) => decode_hex(hex)?,
            SampleDef::Text(text) => text.as_bytes().to_vec(),
            SampleDef::File(path) => {
                let path = base_dir.join(path);
                std::fs::read(&path).map_err(|source| PitError::Io { path, source })?
            }
        };
        action = action.with_sample(bytes);
    }
    if let Some(ms) = def.watchdog_ms {
        action = action.with_watchdog(Duration::from_millis(ms));
    }
    Ok(action)
}

fn build_monitor(def: &MonitorDef, publishers: &[Box<dyn Publisher>]) -> Result<Box<dyn Monitor>, PitError> {
    let invalid = |reason: String| PitError::Monitor {
        monitor: def.name.clone(),
        reason,
    };
    match def.kind.as_str() {
        "process" => {
            let config: ProcessMonitorConfig =
                serde_json::from_value(def.params.clone()).map_err(|e| invalid(e.to_string()))?;
            Ok(Box::new(ProcessMonitor::new(def.name.clone(), config)))
        }
        "exit-status" => {
            let params: ExitStatusParams =
                serde_json::from_value(def.params.clone()).map_err(|e| invalid(e.to_string()))?;
            let publisher = publishers
                .iter()
                .find(|p| p.name() == params.publisher)
                .ok_or_else(|| PitError::UnknownPublisher(params.publisher.clone()))?;
            let slot = publisher
                .exit_status()
                .ok_or_else(|| invalid(format!("publisher '{}' does not run a target", params.publisher)))?;
            Ok(Box::new(ExitStatusMonitor::new(def.name.clone(), slot)))
        }
        other => Err(invalid(format!("unknown monitor kind '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cracker::Cracker;
    use serde_json::json;

    fn scenario_pit() -> serde_json::Value {
        json!({
            "data-models": [{
                "type": "block",
                "name": "Msg",
                "children": [
                    { "type": "string", "name": "cmd", "length": 3, "default": "GET" },
                    { "type": "number", "name": "len", "bits": 16 },
                    { "type": "blob", "name": "payload",
                      "relations": [{ "type": "size", "from": "len" }] }
                ]
            }],
            "state-model": {
                "name": "session",
                "actions": [
                    { "name": "send", "type": "output", "publisher": "sink",
                      "data-model": "Msg", "sample": { "hex": "474554 0500 6162636465" },
                      "watchdog-ms": 500 },
                    { "name": "ping", "type": "call", "publisher": "sink", "method": "ping" }
                ]
            },
            "publishers": [{ "name": "sink", "kind": "null" }],
            "agents": [{ "name": "local", "transport": "thread", "monitors": [] }]
        })
    }

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("00ff 10Ab").unwrap(), vec![0x00, 0xff, 0x10, 0xab]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn builds_the_whole_pit() {
        let file: PitFile = serde_json::from_value(scenario_pit()).unwrap();
        let pit = file
            .build(Path::new("."), &PublisherRegistry::with_builtins(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(pit.state_model.len(), 2);
        assert_eq!(pit.publishers[0].name(), "sink");
        assert_eq!(pit.agents[0].name(), "local");

        let send = &pit.state_model.actions()[0];
        assert_eq!(send.sample.as_deref(), Some(&b"GET\x05\x00abcde"[..]));
        assert_eq!(send.watchdog, Some(Duration::from_millis(500)));
        assert_eq!(
            pit.state_model.actions()[1].kind,
            ActionKind::Call { method: "ping".into() }
        );

        let mut model = pit.data_models["Msg"].clone();
        Cracker::new().crack(&mut model, b"GET\x05\x00abcdefgh").unwrap();
        assert_eq!(model.find("Msg.payload").unwrap().value(), &Variant::from(&b"abcde"[..]));
    }

    #[test]
    fn element_errors_are_reported() {
        let def: ElementDef = serde_json::from_value(json!({ "type": "number", "name": "n" })).unwrap();
        assert!(matches!(def.build(), Err(PitError::Element { .. })));

        let def: ElementDef =
            serde_json::from_value(json!({ "type": "string", "name": "s", "default": 5 })).unwrap();
        assert!(matches!(def.build(), Err(PitError::Element { .. })));

        assert!(serde_json::from_value::<ElementDef>(json!({ "type": "blob", "name": "b", "size": 3 })).is_err());
    }

    #[test]
    fn elements_take_a_fixup() {
        let def: ElementDef = serde_json::from_value(json!({
            "type": "number", "name": "seq", "bits": 16, "default": 4,
            "fixup": { "type": "sequence-increment" }
        }))
        .unwrap();
        assert_eq!(def.fixup, Some(FixupDef::SequenceIncrement));
        let element = def.build().unwrap();
        assert_eq!(element.fixup().map(|f| f.name()), Some("sequence-increment"));

        let unknown = serde_json::from_value::<ElementDef>(json!({
            "type": "number", "name": "n", "bits": 8, "fixup": { "type": "crc32" }
        }));
        assert!(unknown.is_err());
    }

    #[test]
    fn arrays_choices_and_conditions() {
        let def: ElementDef = serde_json::from_value(json!({
            "type": "block",
            "name": "Pkt",
            "children": [
                { "type": "number", "name": "kind", "bits": 8 },
                { "type": "number", "name": "n", "bits": 8 },
                { "type": "array", "name": "items", "min-occurs": 0, "max-occurs": 4,
                  "relations": [{ "type": "count", "from": "n" }],
                  "template": { "type": "number", "name": "item", "bits": 8 } },
                { "type": "choice", "name": "tail", "children": [
                    { "type": "blob", "name": "extra", "length": 1,
                      "relations": [{ "type": "when", "from": "kind", "equals": 1 }] },
                    { "type": "block", "name": "none" }
                ]}
            ]
        }))
        .unwrap();
        let mut model = DataModel::new(def.build().unwrap()).unwrap();
        Cracker::new().crack(&mut model, &[1, 2, 7, 8, 9]).unwrap();
        assert_eq!(model.find("Pkt.items").unwrap().children().len(), 2);
        assert_eq!(model.find("Pkt.items.item_1").unwrap().value(), &Variant::UInt(8));
        assert_eq!(model.find("Pkt.tail").unwrap().selected(), Some(0));
    }

    #[test]
    fn exit_status_monitor_needs_a_command_publisher() {
        let mut value = scenario_pit();
        value["agents"] = json!([{
            "name": "local",
            "monitors": [{ "name": "exit", "kind": "exit-status", "params": { "publisher": "sink" } }]
        }]);
        let file: PitFile = serde_json::from_value(value).unwrap();
        let err = file
            .build(Path::new("."), &PublisherRegistry::with_builtins(), Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, PitError::Monitor { .. }));
    }
}
