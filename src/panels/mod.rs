//! Vertical panels: clinical notes, drug dispatch and scheduling.
//!
//! Every vertical describes itself with a static table of [`FieldSetter`]s.
//! The same table drives function-call dispatch, direct UI edits and the
//! function definitions advertised to the agent.

pub mod clinical_notes;
pub mod drug_dispatch;
pub mod fuzzy;
pub mod scheduling;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::error::{PanelError, StoreError};
use crate::protocol::{FunctionCall, FunctionCallResponse};
use crate::storage::{Record, RecordStore};
use clinical_notes::ClinicalNotes;
use drug_dispatch::DrugDispatch;
use fuzzy::{CommandAction, CommandGroup, CommandMatch};
use scheduling::Scheduling;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalKind {
    ClinicalNotes,
    DrugDispatch,
    Scheduling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Active,
    Completed,
}

/// One settable draft field and the agent function that sets it.
pub struct FieldSetter<D: 'static> {
    pub function: &'static str,
    pub field: &'static str,
    /// Argument key in the function call payload.
    pub arg: &'static str,
    pub description: &'static str,
    pub apply: fn(&mut D, String),
}

pub trait Vertical: 'static {
    type Draft: Default + Clone + Serialize + Send;
    type Record: Record + std::fmt::Debug;

    const KIND: VerticalKind;
    const SAVE_FUNCTION: &'static str;
    const SAVE_DESCRIPTION: &'static str;
    const CLEAR_FUNCTION: &'static str;
    const CLEAR_DESCRIPTION: &'static str;
    /// Agent instructions while this panel is selected.
    const PROMPT: &'static str;

    fn setters() -> &'static [FieldSetter<Self::Draft>];
    fn commands() -> &'static [CommandGroup];

    /// Build a record from a finished draft.
    fn finalize(draft: &Self::Draft, now: DateTime<Utc>) -> Result<Self::Record, PanelError>;

    fn fixture() -> Self::Record;

    /// Fields editable from the UI that no agent function sets.
    fn edit_extra(_draft: &mut Self::Draft, _field: &str, _value: &str) -> bool {
        false
    }

    fn set_status(_record: &mut Self::Record, status: &str) -> Result<(), PanelError> {
        Err(PanelError::InvalidStatus(status.to_string()))
    }

    /// Status reached by toggling, for verticals with a workflow status.
    fn toggled_status(_record: &Self::Record) -> Option<&'static str> {
        None
    }
}

/// Object-safe view of a panel, used by [`Panels`] and the orchestrator.
pub trait PanelHandle: Send {
    fn kind(&self) -> VerticalKind;
    fn phase(&self) -> Phase;
    fn handle_call(&mut self, call: &FunctionCall) -> FunctionCallResponse;
    fn on_utterance(&mut self, text: &str) -> Option<CommandMatch>;
    fn edit_field(&mut self, field: &str, value: &str) -> Result<(), PanelError>;
    /// Persist the draft. Returns the new record's id.
    fn save(&mut self) -> Result<String, PanelError>;
    fn clear(&mut self);
    fn delete(&mut self, id: &str) -> Result<bool, PanelError>;
    /// Set a record's status, or toggle it when `status` is `None`.
    fn set_status(&mut self, id: &str, status: Option<&str>) -> Result<(), PanelError>;
    fn reload(&mut self);
    fn snapshot(&self) -> Value;
    fn function_definitions(&self) -> Vec<Value>;
    fn commands(&self) -> &'static [CommandGroup];
    fn prompt(&self) -> &'static str;
}

pub struct VerticalPanel<V: Vertical> {
    phase: Phase,
    draft: V::Draft,
    records: Vec<V::Record>,
    store: RecordStore,
}

impl<V: Vertical> VerticalPanel<V> {
    pub fn new(store: RecordStore) -> Self {
        let mut panel = Self {
            phase: Phase::Idle,
            draft: V::Draft::default(),
            records: Vec::new(),
            store,
        };
        panel.reload();
        panel
    }

    pub fn draft(&self) -> &V::Draft {
        &self.draft
    }

    pub fn records(&self) -> &[V::Record] {
        &self.records
    }

    fn setter_for_function(function: &str) -> Option<&'static FieldSetter<V::Draft>> {
        V::setters().iter().find(|s| s.function == function)
    }

    fn reset_draft(&mut self) {
        self.draft = V::Draft::default();
    }

    fn touch(&mut self) {
        if self.phase != Phase::Active {
            self.phase = Phase::Active;
        }
    }

    fn dispatch(&mut self, call: &FunctionCall) -> Result<(), PanelError> {
        if call.name == V::SAVE_FUNCTION {
            return self.save_record().map(|_| ());
        }
        if call.name == V::CLEAR_FUNCTION {
            self.reset_draft();
            return Ok(());
        }
        let setter = Self::setter_for_function(&call.name)
            .ok_or_else(|| PanelError::UnknownFunction(call.name.clone()))?;

        let args = call
            .parsed_arguments()
            .map_err(|e| PanelError::InvalidArguments {
                function: call.name.clone(),
                reason: e.to_string(),
            })?;
        let value = match args.get(setter.arg) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(PanelError::InvalidArguments {
                    function: call.name.clone(),
                    reason: format!("missing `{}`", setter.arg),
                })
            }
        };
        (setter.apply)(&mut self.draft, value);
        self.touch();
        Ok(())
    }

    fn save_record(&mut self) -> Result<V::Record, PanelError> {
        let record = V::finalize(&self.draft, Utc::now())?;
        if let Err(e) = self.store.add(&record) {
            log::error!("Failed to save {:?} record: {}", V::KIND, e);
            return Err(e.into());
        }
        log::info!("Saved {:?} record {}", V::KIND, record.id());
        self.insert_sorted(record.clone());
        self.reset_draft();
        self.phase = Phase::Completed;
        Ok(record)
    }

    fn insert_sorted(&mut self, record: V::Record) {
        let at = self
            .records
            .iter()
            .position(|r| r.timestamp() < record.timestamp())
            .unwrap_or(self.records.len());
        self.records.insert(at, record);
    }
}

impl<V: Vertical> PanelHandle for VerticalPanel<V> {
    fn kind(&self) -> VerticalKind {
        V::KIND
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn handle_call(&mut self, call: &FunctionCall) -> FunctionCallResponse {
        match self.dispatch(call) {
            Ok(()) => FunctionCallResponse::success(call),
            Err(e) => {
                log::warn!("{:?} function {} failed: {}", V::KIND, call.name, e);
                FunctionCallResponse::error(call, e.to_string())
            }
        }
    }

    fn on_utterance(&mut self, text: &str) -> Option<CommandMatch> {
        let found = fuzzy::match_command(text, V::commands())?;
        log::info!("{:?} voice command: {} ({:?})", V::KIND, found.canonical, found.action);
        match found.action {
            CommandAction::Start => {
                if self.phase != Phase::Active {
                    self.reset_draft();
                    self.phase = Phase::Active;
                }
            }
            CommandAction::Save => {
                if self.phase == Phase::Active {
                    if let Err(e) = self.save_record() {
                        log::warn!("Voice save of {:?} failed: {}", V::KIND, e);
                    }
                }
            }
            CommandAction::Clear => self.reset_draft(),
            CommandAction::Cancel => {
                self.reset_draft();
                self.phase = Phase::Idle;
            }
        }
        Some(found)
    }

    fn edit_field(&mut self, field: &str, value: &str) -> Result<(), PanelError> {
        if let Some(setter) = V::setters().iter().find(|s| s.field == field) {
            (setter.apply)(&mut self.draft, value.to_string());
        } else if !V::edit_extra(&mut self.draft, field, value) {
            return Err(PanelError::UnknownField(field.to_string()));
        }
        self.touch();
        Ok(())
    }

    fn save(&mut self) -> Result<String, PanelError> {
        self.save_record().map(|record| record.id().to_string())
    }

    fn clear(&mut self) {
        self.reset_draft();
    }

    fn delete(&mut self, id: &str) -> Result<bool, PanelError> {
        let existed = self.store.delete::<V::Record>(id)?;
        self.records.retain(|r| r.id() != id);
        Ok(existed)
    }

    fn set_status(&mut self, id: &str, status: Option<&str>) -> Result<(), PanelError> {
        let index = self
            .records
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut record = self.records[index].clone();
        let status = match status {
            Some(status) => status,
            None => V::toggled_status(&record)
                .ok_or_else(|| PanelError::InvalidStatus("toggle".to_string()))?,
        };
        V::set_status(&mut record, status)?;
        self.store.put(&record)?;
        self.records[index] = record;
        Ok(())
    }

    fn reload(&mut self) {
        match self.store.list::<V::Record>() {
            Ok(records) => self.records = records,
            Err(e) => log::error!("Failed to load {:?} records: {}", V::KIND, e),
        }
    }

    fn snapshot(&self) -> Value {
        json!({
            "kind": V::KIND,
            "phase": self.phase,
            "draft": serde_json::to_value(&self.draft).unwrap_or_default(),
            "records": serde_json::to_value(&self.records).unwrap_or_default(),
        })
    }

    fn function_definitions(&self) -> Vec<Value> {
        let mut definitions: Vec<Value> = V::setters()
            .iter()
            .map(|s| {
                json!({
                    "name": s.function,
                    "description": s.description,
                    "parameters": {
                        "type": "object",
                        "properties": {
                            s.arg: { "type": "string", "description": s.description }
                        },
                        "required": [s.arg]
                    }
                })
            })
            .collect();
        for (name, description) in [
            (V::SAVE_FUNCTION, V::SAVE_DESCRIPTION),
            (V::CLEAR_FUNCTION, V::CLEAR_DESCRIPTION),
        ] {
            definitions.push(json!({
                "name": name,
                "description": description,
                "parameters": { "type": "object", "properties": {}, "required": [] }
            }));
        }
        definitions
    }

    fn commands(&self) -> &'static [CommandGroup] {
        V::commands()
    }

    fn prompt(&self) -> &'static str {
        V::PROMPT
    }
}

/// What a committed user utterance did to the panels.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelOutcome {
    Switched(VerticalKind),
    Command(CommandMatch),
}

/// The three panels and the current selection.
pub struct Panels {
    store: RecordStore,
    panels: Vec<Box<dyn PanelHandle>>,
    active: Option<VerticalKind>,
}

impl Panels {
    pub fn new(store: RecordStore) -> Self {
        match seed_defaults(&store) {
            Ok(true) => log::info!("Seeded default records"),
            Ok(false) => {}
            Err(e) => log::error!("Failed to seed default records: {}", e),
        }
        let panels: Vec<Box<dyn PanelHandle>> = vec![
            Box::new(VerticalPanel::<ClinicalNotes>::new(store.clone())),
            Box::new(VerticalPanel::<DrugDispatch>::new(store.clone())),
            Box::new(VerticalPanel::<Scheduling>::new(store.clone())),
        ];
        Self {
            store,
            panels,
            active: None,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn active(&self) -> Option<VerticalKind> {
        self.active
    }

    pub fn select(&mut self, kind: Option<VerticalKind>) -> bool {
        if self.active == kind {
            return false;
        }
        log::info!("Panel selected: {:?}", kind);
        self.active = kind;
        true
    }

    pub fn panel(&self, kind: VerticalKind) -> Option<&dyn PanelHandle> {
        self.panels.iter().find(|p| p.kind() == kind).map(|p| p.as_ref())
    }

    pub fn panel_mut(&mut self, kind: VerticalKind) -> Option<&mut (dyn PanelHandle + 'static)> {
        self.panels.iter_mut().find(|p| p.kind() == kind).map(|p| p.as_mut())
    }

    pub fn active_panel_mut(&mut self) -> Option<&mut (dyn PanelHandle + 'static)> {
        let kind = self.active?;
        self.panel_mut(kind)
    }

    /// Run function calls through the selected panel. `None` when no panel
    /// is selected and the calls belong to the backend.
    pub fn handle_calls(&mut self, calls: &[FunctionCall]) -> Option<Vec<FunctionCallResponse>> {
        let panel = self.active_panel_mut()?;
        Some(calls.iter().map(|call| panel.handle_call(call)).collect())
    }

    /// Offer a committed user utterance to the panels. A start command for
    /// another vertical switches to it; anything else goes to the selected
    /// panel's own matcher.
    pub fn on_user_utterance(&mut self, text: &str) -> Option<PanelOutcome> {
        let active = self.active?;
        let switch_to = self
            .panels
            .iter()
            .filter(|p| p.kind() != active)
            .find(|p| {
                fuzzy::match_command(text, p.commands())
                    .is_some_and(|m| m.action == CommandAction::Start)
            })
            .map(|p| p.kind());

        if let Some(kind) = switch_to {
            self.select(Some(kind));
            if let Some(panel) = self.panel_mut(kind) {
                panel.on_utterance(text);
            }
            return Some(PanelOutcome::Switched(kind));
        }
        self.active_panel_mut()?
            .on_utterance(text)
            .map(PanelOutcome::Command)
    }

    /// Definitions for every panel function, first definition per name.
    pub fn function_definitions(&self) -> Vec<Value> {
        let mut seen = HashSet::new();
        self.panels
            .iter()
            .flat_map(|p| p.function_definitions())
            .filter(|def| {
                def.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| seen.insert(name.to_string()))
            })
            .collect()
    }

    /// Instructions for the selected panel, headed by the current local time.
    pub fn instructions(&self) -> Option<String> {
        let panel = self.panel(self.active?)?;
        Some(format!("{}{}", datetime_header(Local::now()), panel.prompt()))
    }

    pub fn snapshot(&self, kind: VerticalKind) -> Option<Value> {
        self.panel(kind).map(|p| p.snapshot())
    }
}

pub fn datetime_header(now: DateTime<Local>) -> String {
    format!(
        "Today's Date is: {}\nCurrent Time is: {}\n\n",
        now.format("%b %-d, %Y"),
        now.format("%-I:%M %p")
    )
}

/// Add one fixture per collection when every collection is empty.
pub fn seed_defaults(store: &RecordStore) -> Result<bool, StoreError> {
    let empty = store.is_empty::<<ClinicalNotes as Vertical>::Record>()?
        && store.is_empty::<<DrugDispatch as Vertical>::Record>()?
        && store.is_empty::<<Scheduling as Vertical>::Record>()?;
    if !empty {
        return Ok(false);
    }
    store.add(&ClinicalNotes::fixture())?;
    store.add(&DrugDispatch::fixture())?;
    store.add(&Scheduling::fixture())?;
    Ok(true)
}
