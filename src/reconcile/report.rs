use crate::binding::{Binding, BindingSpec};
use crate::error::ClevisError;
use serde::{Serialize, Serializer};

/// What reconciling one binding did, or would do in a dry run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Unchanged,
    Bound,
    Rebound,
    Unbound,
    WouldBind,
    WouldUnbind,
    /// Unbinding from a device that is not LUKS.
    NotApplicable,
}

impl Action {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::Bound | Self::Rebound | Self::Unbound | Self::WouldBind | Self::WouldUnbind
        )
    }
}

fn error_message<S: Serializer>(
    error: &Option<ClevisError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Serialize)]
pub struct Outcome {
    pub device: String,
    pub slot: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(
        serialize_with = "error_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<ClevisError>,
}

impl Outcome {
    pub fn new(binding: &Binding, result: Result<Action, ClevisError>) -> Self {
        let (action, error) = match result {
            Ok(action) => (Some(action), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            device: binding.device.clone(),
            slot: binding.slot,
            action,
            error,
        }
    }

    pub fn changed(&self) -> bool {
        match (&self.action, &self.error) {
            (Some(action), _) => action.changed(),
            (None, Some(error)) => error.modified_device(),
            (None, None) => false,
        }
    }
}

/// Result of a whole run.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub changed: bool,
    /// A fatal error stopped the run before every binding was processed.
    pub aborted: bool,
    pub outcomes: Vec<Outcome>,
}

impl Report {
    pub fn record(&mut self, outcome: Outcome) {
        self.changed |= outcome.changed();
        self.outcomes.push(outcome);
    }

    pub fn errors(&self) -> impl Iterator<Item = &ClevisError> {
        self.outcomes.iter().filter_map(|o| o.error.as_ref())
    }

    pub fn failed(&self) -> bool {
        self.errors().next().is_some()
    }

    /// One line for the user: the fatal error if there was one, else a count.
    pub fn message(&self) -> String {
        let failures: Vec<(&Outcome, &ClevisError)> = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| (o, e)))
            .collect();
        if let Some((fatal, error)) = failures.iter().find(|(_, e)| e.is_fatal()) {
            return format!("{}:{}: {}", fatal.device, fatal.slot, error);
        }
        match failures.as_slice() {
            [] => format!(
                "{} binding(s) processed, {} changed",
                self.outcomes.len(),
                self.outcomes.iter().filter(|o| o.changed()).count()
            ),
            [(only, error)] => format!("{}:{}: {}", only.device, only.slot, error),
            many => format!(
                "{} of {} binding(s) failed",
                many.len(),
                self.outcomes.len()
            ),
        }
    }

    /// What `apply` prints.
    pub fn summary<'a>(&'a self, original_bindings: &'a [BindingSpec]) -> Summary<'a> {
        Summary {
            changed: self.changed,
            msg: self.message(),
            outcomes: &self.outcomes,
            original_bindings,
        }
    }
}

/// The run's result alongside the desired state as given, secrets redacted.
#[derive(Debug, Serialize)]
pub struct Summary<'a> {
    pub changed: bool,
    pub msg: String,
    pub outcomes: &'a [Outcome],
    pub original_bindings: &'a [BindingSpec],
}
