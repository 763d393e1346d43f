use crate::model::DataModel;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state model '{0}' has no actions")]
    Empty(String),
    #[error("action name '{0}' is used twice")]
    DuplicateAction(String),
    #[error("action '{action}' needs a data model for {kind}")]
    MissingModel { action: String, kind: &'static str },
    #[error("action '{action}' has sample data but no data model")]
    SampleWithoutModel { action: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Open,
    Close,
    /// Sends the generated data model to the publisher.
    Output,
    /// Reads up to `max_size` bytes and cracks them into the data model, if
    /// the action has one.
    Input { max_size: usize },
    /// Invokes a method on the publisher with the generated data model, if
    /// any, as the argument.
    Call { method: String },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Open => "open",
            ActionKind::Close => "close",
            ActionKind::Output => "output",
            ActionKind::Input { .. } => "input",
            ActionKind::Call { .. } => "call",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Call { method } => write!(f, "call({method})"),
            other => f.write_str(other.label()),
        }
    }
}

/// One step of the state model.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    /// Name of the publisher the action runs against.
    pub publisher: String,
    pub model: Option<DataModel>,
    /// Bytes cracked into `model` once per session.
    pub sample: Option<Vec<u8>>,
    /// Wall-time limit for the action.
    pub watchdog: Option<Duration>,
}

impl Action {
    pub fn new(name: impl Into<String>, kind: ActionKind, publisher: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            publisher: publisher.into(),
            model: None,
            sample: None,
            watchdog: None,
        }
    }

    pub fn output(name: impl Into<String>, publisher: impl Into<String>, model: DataModel) -> Self {
        Self::new(name, ActionKind::Output, publisher).with_model(model)
    }

    pub fn with_model(mut self, model: DataModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_sample(mut self, sample: impl Into<Vec<u8>>) -> Self {
        self.sample = Some(sample.into());
        self
    }

    pub fn with_watchdog(mut self, limit: Duration) -> Self {
        self.watchdog = Some(limit);
        self
    }
}

/// The ordered actions every iteration runs.
#[derive(Debug, Clone)]
pub struct StateModel {
    name: String,
    actions: Vec<Action>,
}

impl StateModel {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Result<Self, StateError> {
        let name = name.into();
        if actions.is_empty() {
            return Err(StateError::Empty(name));
        }
        let mut seen = HashSet::new();
        for action in &actions {
            if !seen.insert(action.name.as_str()) {
                return Err(StateError::DuplicateAction(action.name.clone()));
            }
            if action.kind == ActionKind::Output && action.model.is_none() {
                return Err(StateError::MissingModel {
                    action: action.name.clone(),
                    kind: "output",
                });
            }
            if action.sample.is_some() && action.model.is_none() {
                return Err(StateError::SampleWithoutModel {
                    action: action.name.clone(),
                });
            }
        }
        Ok(Self { name, actions })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Names of every publisher an action uses, in first-use order.
    pub fn publishers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for action in &self.actions {
            if !names.contains(&action.publisher.as_str()) {
                names.push(&action.publisher);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::DataElement;

    fn model() -> DataModel {
        DataModel::new(DataElement::block("Msg", vec![DataElement::number("n", 8)])).unwrap()
    }

    #[test]
    fn rejects_invalid_actions() {
        assert_eq!(
            StateModel::new("empty", vec![]).unwrap_err(),
            StateError::Empty("empty".into())
        );
        let dup = vec![
            Action::new("a", ActionKind::Open, "p"),
            Action::new("a", ActionKind::Close, "p"),
        ];
        assert_eq!(
            StateModel::new("s", dup).unwrap_err(),
            StateError::DuplicateAction("a".into())
        );
        let bare = vec![Action::new("send", ActionKind::Output, "p")];
        assert!(matches!(
            StateModel::new("s", bare).unwrap_err(),
            StateError::MissingModel { .. }
        ));
        let orphan = vec![Action::new("recv", ActionKind::Input { max_size: 4 }, "p").with_sample(vec![1])];
        assert!(matches!(
            StateModel::new("s", orphan).unwrap_err(),
            StateError::SampleWithoutModel { .. }
        ));
    }

    #[test]
    fn publishers_in_first_use_order() {
        let actions = vec![
            Action::new("open", ActionKind::Open, "net"),
            Action::output("send", "net", model()),
            Action::new("log", ActionKind::Call { method: "flush".into() }, "file"),
        ];
        let state = StateModel::new("s", actions).unwrap();
        assert_eq!(state.publishers(), vec!["net", "file"]);
        assert_eq!(state.actions()[2].kind.to_string(), "call(flush)");
    }
}
