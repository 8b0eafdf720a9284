//! Drug dispatch: prescriptions sent to a pharmacy.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fuzzy::{CommandAction, CommandGroup};
use super::{FieldSetter, Vertical, VerticalKind};
use crate::error::PanelError;
use crate::storage::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    #[default]
    Pending,
    Dispatched,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Dispatched => "dispatched",
        }
    }

    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(DispatchStatus::Pending),
            "dispatched" => Some(DispatchStatus::Dispatched),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchDraft {
    pub patient_name: String,
    pub mrn: String,
    pub medication: String,
    pub dosage: String,
    pub frequency: String,
    pub pharmacy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrugDispatchRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub patient_name: String,
    pub mrn: String,
    pub medication: String,
    pub dosage: String,
    #[serde(default)]
    pub frequency: String,
    pub pharmacy: String,
    #[serde(default)]
    pub status: DispatchStatus,
}

impl Record for DrugDispatchRecord {
    const COLLECTION: Collection = Collection::DrugDispatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
}

static SETTERS: [FieldSetter<DispatchDraft>; 6] = [
    FieldSetter {
        function: "set_patient_name",
        field: "patientName",
        arg: "name",
        description: "The patient's full name",
        apply: |d: &mut DispatchDraft, v: String| d.patient_name = v,
    },
    FieldSetter {
        function: "set_mrn",
        field: "mrn",
        arg: "mrn",
        description: "The patient's Medical Record Number",
        apply: |d: &mut DispatchDraft, v: String| d.mrn = v,
    },
    FieldSetter {
        function: "set_medication",
        field: "medication",
        arg: "medication",
        description: "The name of the medication",
        apply: |d: &mut DispatchDraft, v: String| d.medication = v,
    },
    FieldSetter {
        function: "set_dosage",
        field: "dosage",
        arg: "dosage",
        description: "The dosage of the medication",
        apply: |d: &mut DispatchDraft, v: String| d.dosage = v,
    },
    FieldSetter {
        function: "set_frequency",
        field: "frequency",
        arg: "frequency",
        description: "How often the medication is taken",
        apply: |d: &mut DispatchDraft, v: String| d.frequency = v,
    },
    FieldSetter {
        function: "set_pharmacy",
        field: "pharmacy",
        arg: "pharmacy",
        description: "The pharmacy that fills the prescription",
        apply: |d: &mut DispatchDraft, v: String| d.pharmacy = v,
    },
];

static COMMANDS: [CommandGroup; 2] = [
    CommandGroup {
        action: CommandAction::Start,
        phrases: &[
            "start drug dispatch",
            "drug dispatch",
            "drugs dispatch",
            "drug dispatched",
        ],
    },
    CommandGroup {
        action: CommandAction::Cancel,
        phrases: &["cancel drug dispatch"],
    },
];

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

pub struct DrugDispatch;

impl Vertical for DrugDispatch {
    type Draft = DispatchDraft;
    type Record = DrugDispatchRecord;

    const KIND: VerticalKind = VerticalKind::DrugDispatch;
    const SAVE_FUNCTION: &'static str = "dispatch_prescription";
    const SAVE_DESCRIPTION: &'static str = "Dispatch the prescription to the pharmacy";
    const CLEAR_FUNCTION: &'static str = "clear_prescription";
    const CLEAR_DESCRIPTION: &'static str = "Clear the current prescription";
    const PROMPT: &'static str = "You are a pharmacy assistant helping to dispatch prescriptions. \
Do not ask for any information until the user says \"Drug Dispatch\" or \"Start Drug Dispatch\". \
When starting, say only \"What is the patient's name?\". Ask for one field at a time, in this order: \
patient name, medical record number, medication, dosage, frequency, pharmacy. \
Call the matching set_ function as soon as you hear a value, then ask only for the next missing field. \
Read the prescription back once every field is filled and ask the user to confirm. \
When the user confirms, call dispatch_prescription. \
When you hear \"Cancel Drug Dispatch\" or \"Clear prescription\" call clear_prescription.";

    fn setters() -> &'static [FieldSetter<DispatchDraft>] {
        &SETTERS
    }

    fn commands() -> &'static [CommandGroup] {
        &COMMANDS
    }

    fn finalize(draft: &DispatchDraft, now: DateTime<Utc>) -> Result<DrugDispatchRecord, PanelError> {
        if is_blank(&draft.patient_name) || is_blank(&draft.mrn) {
            return Err(PanelError::Incomplete("patient information".to_string()));
        }
        if is_blank(&draft.medication) || is_blank(&draft.dosage) || is_blank(&draft.pharmacy) {
            return Err(PanelError::Incomplete("prescription information".to_string()));
        }
        Ok(DrugDispatchRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            patient_name: draft.patient_name.clone(),
            mrn: draft.mrn.clone(),
            medication: draft.medication.clone(),
            dosage: draft.dosage.clone(),
            frequency: draft.frequency.clone(),
            pharmacy: draft.pharmacy.clone(),
            status: DispatchStatus::Pending,
        })
    }

    fn fixture() -> DrugDispatchRecord {
        DrugDispatchRecord {
            id: "default-dispatch".into(),
            timestamp: Utc
                .with_ymd_and_hms(2025, 2, 21, 13, 13, 6)
                .single()
                .unwrap_or_default(),
            patient_name: "Jane Bloggs".into(),
            mrn: "A965247".into(),
            medication: "Ibuprofen".into(),
            dosage: "200 milligrams".into(),
            frequency: "Every 4 hours".into(),
            pharmacy: "CVS Pharmacy Markets San Francisco".into(),
            status: DispatchStatus::Pending,
        }
    }

    fn set_status(record: &mut DrugDispatchRecord, status: &str) -> Result<(), PanelError> {
        record.status = DispatchStatus::parse(status)
            .ok_or_else(|| PanelError::InvalidStatus(status.to_string()))?;
        Ok(())
    }

    fn toggled_status(record: &DrugDispatchRecord) -> Option<&'static str> {
        let next = match record.status {
            DispatchStatus::Pending => DispatchStatus::Dispatched,
            DispatchStatus::Dispatched => DispatchStatus::Pending,
        };
        Some(next.as_str())
    }
}
