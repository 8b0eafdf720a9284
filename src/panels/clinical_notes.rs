//! Clinical notes: demographics, visit info and clinical findings plus free text.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fuzzy::{CommandAction, CommandGroup};
use super::{FieldSetter, Vertical, VerticalKind};
use crate::error::PanelError;
use crate::storage::{Collection, Record};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medical_record_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_visit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_visit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chief_complaint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present_illness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_of_systems: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_exam: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteFields {
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub visit_info: VisitInfo,
    #[serde(default)]
    pub clinical_info: ClinicalInfo,
}

impl NoteFields {
    /// Labelled lines for every field that has a value, in form order.
    fn labelled(&self) -> Vec<(&'static str, &str)> {
        let d = &self.demographics;
        let v = &self.visit_info;
        let c = &self.clinical_info;
        [
            ("Patient Name", &d.patient_name),
            ("Date of Birth", &d.date_of_birth),
            ("Age", &d.age),
            ("Gender", &d.gender),
            ("Medical Record Number", &d.medical_record_number),
            ("Visit Date", &v.date_of_visit),
            ("Visit Time", &v.time_of_visit),
            ("Visit Type", &v.visit_type),
            ("Provider", &v.provider_name),
            ("Chief Complaint", &c.chief_complaint),
            ("Present Illness", &c.present_illness),
            ("Review of Systems", &c.review_of_systems),
            ("Physical Examination", &c.physical_exam),
            ("Assessment", &c.assessment),
            ("Plan", &c.plan),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| (label, s))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.labelled().is_empty()
    }

    pub fn render(&self) -> String {
        self.labelled()
            .into_iter()
            .map(|(label, value)| format!("{}: {}", label, value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDraft {
    pub content: String,
    #[serde(flatten)]
    pub fields: NoteFields,
}

impl NoteDraft {
    fn append_note(&mut self, text: String) {
        if !self.content.is_empty() && !self.content.ends_with('\n') {
            self.content.push('\n');
        }
        self.content.push_str(&text);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalNote {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub last_modified: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: NoteFields,
}

impl Record for ClinicalNote {
    const COLLECTION: Collection = Collection::ClinicalNotes;

    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

static SETTERS: [FieldSetter<NoteDraft>; 15] = [
    FieldSetter {
        function: "set_patient_name",
        field: "patientName",
        arg: "name",
        description: "The patient's full name",
        apply: |d: &mut NoteDraft, v: String| d.fields.demographics.patient_name = Some(v),
    },
    FieldSetter {
        function: "set_date_of_birth",
        field: "dateOfBirth",
        arg: "dateOfBirth",
        description: "The patient's date of birth in MM/DD/YYYY format",
        apply: |d: &mut NoteDraft, v: String| d.fields.demographics.date_of_birth = Some(v),
    },
    FieldSetter {
        function: "set_gender",
        field: "gender",
        arg: "gender",
        description: "The patient's gender",
        apply: |d: &mut NoteDraft, v: String| d.fields.demographics.gender = Some(v),
    },
    FieldSetter {
        function: "set_mrn",
        field: "medicalRecordNumber",
        arg: "mrn",
        description: "The patient's Medical Record Number",
        apply: |d: &mut NoteDraft, v: String| d.fields.demographics.medical_record_number = Some(v),
    },
    FieldSetter {
        function: "set_visit_date",
        field: "dateOfVisit",
        arg: "date",
        description: "The date of the visit in MM/DD/YYYY format",
        apply: |d: &mut NoteDraft, v: String| d.fields.visit_info.date_of_visit = Some(v),
    },
    FieldSetter {
        function: "set_visit_time",
        field: "timeOfVisit",
        arg: "time",
        description: "The time of the visit",
        apply: |d: &mut NoteDraft, v: String| d.fields.visit_info.time_of_visit = Some(v),
    },
    FieldSetter {
        function: "set_visit_type",
        field: "visitType",
        arg: "visitType",
        description: "The type of visit, for example a general checkup",
        apply: |d: &mut NoteDraft, v: String| d.fields.visit_info.visit_type = Some(v),
    },
    FieldSetter {
        function: "set_provider_name",
        field: "providerName",
        arg: "providerName",
        description: "The name of the healthcare provider",
        apply: |d: &mut NoteDraft, v: String| d.fields.visit_info.provider_name = Some(v),
    },
    FieldSetter {
        function: "set_chief_complaint",
        field: "chiefComplaint",
        arg: "complaint",
        description: "The patient's chief complaint",
        apply: |d: &mut NoteDraft, v: String| d.fields.clinical_info.chief_complaint = Some(v),
    },
    FieldSetter {
        function: "set_present_illness",
        field: "presentIllness",
        arg: "illness",
        description: "History of the present illness",
        apply: |d: &mut NoteDraft, v: String| d.fields.clinical_info.present_illness = Some(v),
    },
    FieldSetter {
        function: "set_review_of_systems",
        field: "reviewOfSystems",
        arg: "systems",
        description: "Findings from the review of systems",
        apply: |d: &mut NoteDraft, v: String| d.fields.clinical_info.review_of_systems = Some(v),
    },
    FieldSetter {
        function: "set_physical_exam",
        field: "physicalExam",
        arg: "exam",
        description: "Findings from the physical examination",
        apply: |d: &mut NoteDraft, v: String| d.fields.clinical_info.physical_exam = Some(v),
    },
    FieldSetter {
        function: "set_assessment",
        field: "assessment",
        arg: "assessment",
        description: "The clinical assessment",
        apply: |d: &mut NoteDraft, v: String| d.fields.clinical_info.assessment = Some(v),
    },
    FieldSetter {
        function: "set_plan",
        field: "plan",
        arg: "plan",
        description: "The treatment plan",
        apply: |d: &mut NoteDraft, v: String| d.fields.clinical_info.plan = Some(v),
    },
    FieldSetter {
        function: "other_notes",
        field: "notes",
        arg: "notes",
        description: "Any additional notes to append to the note text",
        apply: |d: &mut NoteDraft, v: String| d.append_note(v),
    },
];

static COMMANDS: [CommandGroup; 3] = [
    CommandGroup {
        action: CommandAction::Start,
        phrases: &[
            "start clinical note",
            "clinical note",
            "start note",
            "start a clinical note",
            "start a note",
            "begin clinical note",
            "begin a clinical note",
            "create clinical note",
            "create a clinical note",
            "new clinical note",
            "new note",
        ],
    },
    CommandGroup {
        action: CommandAction::Save,
        phrases: &[
            "save note",
            "save the note",
            "save clinical note",
            "save this note",
            "finish note",
            "end note",
        ],
    },
    CommandGroup {
        action: CommandAction::Clear,
        phrases: &[
            "clear note",
            "clear the note",
            "delete note",
            "delete the note",
            "reset note",
        ],
    },
];

pub struct ClinicalNotes;

impl Vertical for ClinicalNotes {
    type Draft = NoteDraft;
    type Record = ClinicalNote;

    const KIND: VerticalKind = VerticalKind::ClinicalNotes;
    const SAVE_FUNCTION: &'static str = "save_note";
    const SAVE_DESCRIPTION: &'static str = "Save the current clinical note";
    const CLEAR_FUNCTION: &'static str = "clear_note";
    const CLEAR_DESCRIPTION: &'static str = "Clear the current clinical note";
    const PROMPT: &'static str = "You are a medical transcription assistant helping with clinical notes. \
Do not ask for patient information until the user says \"Clinical Note\" or \"Start Clinical Note\". \
When starting, say only \"What is the patient's name?\". Ask for one field at a time, in this order: \
patient name, date of birth, gender, medical record number, visit date, visit time, visit type, \
provider name, chief complaint, present illness, review of systems, physical examination, assessment, plan. \
Call the matching set_ function as soon as you hear a value, then ask only for the next missing field. \
Format dates as MM/DD/YYYY and keep medical terminology intact. \
After the plan, ask for additional notes and record them with other_notes. \
When you hear \"Save note\", \"Finish note\" or \"End note\" call save_note. \
When you hear \"Clear note\", \"Delete note\" or \"Reset note\" call clear_note.";

    fn setters() -> &'static [FieldSetter<NoteDraft>] {
        &SETTERS
    }

    fn commands() -> &'static [CommandGroup] {
        &COMMANDS
    }

    fn finalize(draft: &NoteDraft, now: DateTime<Utc>) -> Result<ClinicalNote, PanelError> {
        let content = if draft.content.trim().is_empty() {
            if draft.fields.is_empty() {
                return Err(PanelError::Incomplete("the note is empty".to_string()));
            }
            draft.fields.render()
        } else {
            draft.content.clone()
        };
        Ok(ClinicalNote {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            content,
            last_modified: now,
            fields: draft.fields.clone(),
        })
    }

    fn fixture() -> ClinicalNote {
        let fields = NoteFields {
            demographics: Demographics {
                patient_name: Some("Joe Blogs".into()),
                date_of_birth: Some("09/05/1984".into()),
                age: None,
                gender: Some("Male".into()),
                medical_record_number: Some("B 652 947".into()),
            },
            visit_info: VisitInfo {
                date_of_visit: Some("02/21/2025".into()),
                time_of_visit: Some("13:20".into()),
                visit_type: Some("General checkup".into()),
                provider_name: Some("Urgent Care".into()),
            },
            clinical_info: ClinicalInfo {
                chief_complaint: Some("Injection site swelling".into()),
                present_illness: Some("No prior history".into()),
                review_of_systems: Some("No findings".into()),
                physical_exam: Some("Swelling and redness around the injection site".into()),
                assessment: None,
                plan: Some("200 milligrams of Ibuprofen to be taken every 4 hours, and rest.".into()),
            },
        };
        let timestamp = Utc
            .with_ymd_and_hms(2025, 2, 21, 13, 20, 0)
            .single()
            .unwrap_or_default();
        ClinicalNote {
            id: "default-note".into(),
            timestamp,
            content: fields.render(),
            last_modified: timestamp,
            fields,
        }
    }

    fn edit_extra(draft: &mut NoteDraft, field: &str, value: &str) -> bool {
        match field {
            "content" => {
                draft.content = value.to_string();
                true
            }
            "age" => {
                draft.fields.demographics.age = Some(value.to_string());
                true
            }
            _ => false,
        }
    }
}
